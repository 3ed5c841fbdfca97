use std::ops::Range;

use xlat_backend::ExecRegion;
use xlat_core::block::recovery_lookup;
use xlat_core::{BackpatchSite, ExitDescriptor, GuestRegs, RecoveryRecord};

/// Signature of a compiled block: takes the register file, returns the
/// next entry point or null when the successor must be looked up.
pub type BlockFn = unsafe extern "C" fn(*mut GuestRegs) -> *const u8;

/// One compiled guest block.
///
/// Immutable once built; the cache hands out `Arc`s and drops a block
/// only after it has been retired and collected.
pub struct TranslatedBlock {
    pub guest_start_pc: u32,
    /// Address following the last translated instruction.
    pub guest_end_pc: u32,
    pub icount: u32,
    pub(crate) code: ExecRegion,
    pub backpatch_list: Vec<BackpatchSite>,
    pub exits: Vec<ExitDescriptor>,
    /// Trampolines and stubs, as offsets into the block's code.
    pub trampolines: Range<usize>,
    pub(crate) recovery: Vec<RecoveryRecord>,
    pub(crate) insn_shift: u8,
}

impl TranslatedBlock {
    pub fn entry_point(&self) -> *const u8 {
        self.code.as_ptr()
    }

    pub fn code_size(&self) -> usize {
        self.code.len()
    }

    pub fn code(&self) -> &[u8] {
        self.code.as_slice()
    }

    /// Host address range of the code.
    pub fn host_range(&self) -> Range<usize> {
        self.code.range()
    }

    pub fn contains_host(&self, ip: usize) -> bool {
        self.host_range().contains(&ip)
    }

    /// Host address range of the trampolines and stubs.
    pub fn trampoline_range(&self) -> Range<usize> {
        let base = self.code.as_ptr() as usize;
        base + self.trampolines.start..base + self.trampolines.end
    }

    pub fn recovery(&self) -> &[RecoveryRecord] {
        &self.recovery
    }

    /// Guest PC of the instruction whose code contains host address `ip`.
    ///
    /// Instructions that emit no host code share their offset with the
    /// next one; a pointer there maps to the last of them. Addresses in
    /// the trampoline region belong to no single instruction.
    pub fn guest_pc_at(&self, ip: usize) -> Option<u32> {
        if !self.contains_host(ip) {
            return None;
        }
        let off = ip - self.host_range().start;
        if self.trampolines.contains(&off) {
            return None;
        }
        let idx = recovery_lookup(&self.recovery, off as u32)?;
        Some(self.guest_start_pc.wrapping_add(idx << self.insn_shift))
    }

    /// Like [`guest_pc_at`](Self::guest_pc_at) for a return address: the
    /// owning instruction is the one containing the call, one byte back.
    pub fn guest_pc_at_return(&self, ret: usize) -> Option<u32> {
        if !self.contains_host(ret) {
            return None;
        }
        self.guest_pc_at(ret.checked_sub(1)?)
    }

    /// Whether the guest bytes of this block intersect `range`.
    pub fn overlaps(&self, range: &Range<u32>) -> bool {
        let end = self.guest_end_pc.max(self.guest_start_pc.wrapping_add(1));
        self.guest_start_pc < range.end && range.start < end
    }

    /// Run the block once.
    ///
    /// # Safety
    /// `regs` must be valid for the whole run, and every helper baked
    /// into the block must still be callable with its context.
    pub unsafe fn execute(&self, regs: *mut GuestRegs) -> *const u8 {
        execute_entry(self.entry_point(), regs)
    }
}

/// Enter generated code at `entry`.
///
/// # Safety
/// `entry` must be the entry point of a live block.
pub unsafe fn execute_entry(entry: *const u8, regs: *mut GuestRegs) -> *const u8 {
    let f: BlockFn = std::mem::transmute(entry);
    f(regs)
}

impl std::fmt::Debug for TranslatedBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslatedBlock")
            .field("guest_start_pc", &format_args!("{:#x}", self.guest_start_pc))
            .field("guest_end_pc", &format_args!("{:#x}", self.guest_end_pc))
            .field("icount", &self.icount)
            .field("host", &format_args!("{:#x?}", self.host_range()))
            .field("sites", &self.backpatch_list.len())
            .field("exits", &self.exits)
            .finish()
    }
}
