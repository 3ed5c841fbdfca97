/// x86-64 general-purpose register indices.
///
/// Encoding matches the x86-64 ModR/M and REX register numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    /// Low 3 bits of the register encoding (for ModR/M).
    #[inline]
    pub const fn low3(self) -> u8 {
        (self as u8) & 0x7
    }

    /// Whether this register requires a REX prefix (R8-R15).
    #[inline]
    pub const fn needs_rex(self) -> bool {
        (self as u8) >= 8
    }
}

/// Bitmap of host registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RegSet(u16);

impl RegSet {
    pub const EMPTY: RegSet = RegSet(0);

    pub const fn of(regs: &[Reg]) -> Self {
        let mut bits = 0u16;
        let mut i = 0;
        while i < regs.len() {
            bits |= 1 << regs[i] as u16;
            i += 1;
        }
        Self(bits)
    }

    pub const fn contains(self, reg: Reg) -> bool {
        self.0 & (1 << reg as u16) != 0
    }

    pub const fn union(self, other: RegSet) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }
}

/// Pointer to the guest register file, live for the whole block.
pub const BASE_REG: Reg = Reg::Rbp;

/// Transfer register carrying a backpatch site's exception code into
/// the shared trampoline.
pub const XFER_CODE: Reg = Reg::R10;

/// Transfer register carrying a backpatch site's instruction count.
pub const XFER_ICOUNT: Reg = Reg::Rax;

/// Registers the block prologue saves.
pub const CALLEE_SAVED: &[Reg] = &[Reg::Rbp];

/// Scratch area reserved below the saved registers. Keeps `rsp`
/// 16-byte aligned at every call site inside the block.
pub const FRAME_SCRATCH: usize = 16;

pub const STACK_ALIGN: usize = 16;
