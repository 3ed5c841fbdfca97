use std::ptr;

use tracing::warn;
use xlat_core::{GuestRegs, Result, XlatError};

use crate::block::execute_entry;
use crate::compiler::BlockCompiler;
use crate::GuestTranslator;

/// Why [`run_slice`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceExit {
    /// The cycle budget was reached; `cycles` is the final counter.
    Completed { cycles: u32 },
    /// A block could not be compiled even into an empty cache.
    CacheFull,
}

/// Execute guest code until `slice_cycle` reaches `budget`.
///
/// Blocks chain through the entry points they return; a null return
/// looks the current PC up in the cache and compiles on a miss. On
/// capacity exhaustion the cache is flushed once and the compile
/// retried.
///
/// # Safety
/// `regs` must point to the register file the guest's helpers were
/// built for and stay valid for the whole call.
pub unsafe fn run_slice<G: GuestTranslator + ?Sized>(
    compiler: &mut BlockCompiler,
    guest: &mut G,
    regs: *mut GuestRegs,
    budget: u32,
) -> Result<SliceExit> {
    let mut next: *const u8 = ptr::null();
    let mut flushed = false;

    while (*regs).slice_cycle < budget {
        let entry = if next.is_null() {
            let pc = (*regs).pc;
            let hit = compiler.cache().lookup_entry(pc);
            if hit.is_null() {
                match compiler.compile(guest, pc) {
                    Ok(block) => block.entry_point(),
                    Err(XlatError::CompileCapacityExceeded { .. }) if !flushed => {
                        warn!(pc, "flushing translation cache and retrying");
                        compiler.cache().flush();
                        flushed = true;
                        continue;
                    }
                    Err(XlatError::CompileCapacityExceeded { .. }) => {
                        return Ok(SliceExit::CacheFull)
                    }
                    Err(e) => return Err(e),
                }
            } else {
                hit
            }
        } else {
            next
        };
        next = execute_entry(entry, regs);
    }

    Ok(SliceExit::Completed {
        cycles: (*regs).slice_cycle,
    })
}
