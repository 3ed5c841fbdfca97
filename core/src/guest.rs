use std::mem::offset_of;

/// Number of general-purpose guest registers.
pub const NUM_GPRS: usize = 16;

/// Guest architectural state as seen by generated code.
///
/// Generated code keeps a pointer to this structure in a fixed host
/// register for the whole block and addresses every field with a
/// constant displacement, so the layout is `repr(C)` and must not be
/// reordered.
#[repr(C)]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuestRegs {
    pub r: [u32; NUM_GPRS],
    /// Program counter. Holds the block start address while a block
    /// runs; exits and trampolines advance it.
    pub pc: u32,
    /// Staged branch target (written by delayed branches).
    pub new_pc: u32,
    /// Saved PC of the last delivered exception.
    pub spc: u32,
    /// Cycles consumed in the current time slice.
    pub slice_cycle: u32,
    /// Mode flags (privilege, address translation, ...).
    pub sr: u32,
}

impl GuestRegs {
    pub fn new(pc: u32) -> Self {
        Self {
            pc,
            ..Self::default()
        }
    }
}

pub const OFFSET_R: usize = offset_of!(GuestRegs, r);
pub const OFFSET_PC: usize = offset_of!(GuestRegs, pc);
pub const OFFSET_NEW_PC: usize = offset_of!(GuestRegs, new_pc);
pub const OFFSET_SPC: usize = offset_of!(GuestRegs, spc);
pub const OFFSET_SLICE_CYCLE: usize = offset_of!(GuestRegs, slice_cycle);
pub const OFFSET_SR: usize = offset_of!(GuestRegs, sr);

/// Byte offset of general-purpose register `n`.
pub const fn gpr_offset(n: usize) -> usize {
    assert!(n < NUM_GPRS);
    OFFSET_R + n * 4
}
