use std::ops::Range;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use xlat_backend::IcacheWindow;

/// Direct-mapped entry points for a fixed window of guest addresses.
///
/// One slot per instruction address in `[base, base + size)`. Generated
/// code reads slots with plain loads; the cache writes them under its
/// write lock.
pub struct IcacheSlots {
    base: u32,
    size: u32,
    shift: u8,
    slots: Box<[AtomicPtr<u8>]>,
}

impl IcacheSlots {
    pub fn new(base: u32, size: u32, shift: u8) -> Self {
        let count = (size as usize).div_ceil(1 << shift);
        let slots = (0..count).map(|_| AtomicPtr::new(ptr::null_mut())).collect();
        Self {
            base,
            size,
            shift,
            slots,
        }
    }

    /// Description handed to the exit generator.
    pub fn window(&self) -> IcacheWindow {
        if self.size == 0 {
            return IcacheWindow::DISABLED;
        }
        IcacheWindow {
            base: self.base,
            size: self.size,
            slots: self.slots.as_ptr() as usize,
            shift: self.shift,
        }
    }

    pub fn index_of(&self, pc: u32) -> Option<usize> {
        self.window().slot_of(pc)
    }

    pub fn get(&self, pc: u32) -> *const u8 {
        match self.index_of(pc) {
            Some(i) => self.slots[i].load(Ordering::Acquire),
            None => ptr::null(),
        }
    }

    pub(crate) fn set(&self, pc: u32, entry: *const u8) {
        if let Some(i) = self.index_of(pc) {
            self.slots[i].store(entry as *mut u8, Ordering::Release);
        }
    }

    pub(crate) fn clear(&self, pc: u32) {
        self.set(pc, ptr::null());
    }

    pub(crate) fn clear_range(&self, range: Range<u32>) {
        let mut pc = range.start.max(self.base) & !((1u32 << self.shift) - 1);
        let end = range.end.min(self.base.saturating_add(self.size));
        while pc < end {
            self.clear(pc);
            pc = match pc.checked_add(1 << self.shift) {
                Some(next) => next,
                None => break,
            };
        }
    }

    pub(crate) fn clear_all(&self) {
        for slot in self.slots.iter() {
            slot.store(ptr::null_mut(), Ordering::Release);
        }
    }
}
