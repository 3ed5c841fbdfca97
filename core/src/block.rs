/// Exception code carried by a backpatch site.
///
/// `DispatchOnly` sites skip the raise call: the exception has already
/// been delivered (by a helper) and only cleanup and dispatch remain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExcCode {
    Fixed(u32),
    DispatchOnly,
}

/// How a backpatch site's placeholder is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FixupKind {
    /// rel32 displacement of a conditional branch.
    Rel32,
    /// 64-bit absolute immediate (recovery address operand).
    Abs64,
}

/// A fault-guard site recorded while a block body is emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackpatchSite {
    /// Arena offset of the placeholder field.
    pub fixup_offset: usize,
    pub kind: FixupKind,
    pub exc: ExcCode,
    /// Guest instructions completed before the guarded instruction.
    pub icount: u32,
}

/// Where a register-indirect exit reads the next PC from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcSource {
    Pc,
    NewPc,
}

/// Control transfer emitted at the end of a straight-line path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDescriptor {
    /// Next PC is a constant dispatched through the resolve helper.
    Static(u32),
    /// Next PC is a constant whose ICache slot is read directly.
    StaticViaICache(u32, usize),
    /// Next PC is read from the register file at run time.
    RegisterIndirect(PcSource),
    /// Unconditional guest exception `(code, pc)`.
    Exception(u32, u32),
}

impl ExitDescriptor {
    /// Statically known successor PC, if any.
    pub fn target_pc(&self) -> Option<u32> {
        match *self {
            ExitDescriptor::Static(pc) | ExitDescriptor::StaticViaICache(pc, _) => Some(pc),
            _ => None,
        }
    }
}

/// Host-offset to guest-instruction mapping entry.
///
/// One record is written at the start of every guest instruction body;
/// records are sorted by `host_offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryRecord {
    pub host_offset: u32,
    pub icount: u32,
}

/// Find the instruction index covering `host_offset`.
pub fn recovery_lookup(records: &[RecoveryRecord], host_offset: u32) -> Option<u32> {
    let idx = records.partition_point(|r| r.host_offset <= host_offset);
    if idx == 0 {
        None
    } else {
        Some(records[idx - 1].icount)
    }
}
