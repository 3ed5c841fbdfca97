//! Host instruction pointer recovery for traps raised inside generated
//! code.
//!
//! Both strategies are read-only walks of the current call stack and
//! report the first return address that lands inside generated code.
//! They must be called from a helper invoked (directly or through a few
//! frames) by a block.

use xlat_core::NativePcStrategy;

/// Upper bound on frame-pointer hops for [`NativePcStrategy::FrameScan`].
pub const MAX_FRAME_HOPS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativePcResolver {
    strategy: NativePcStrategy,
}

impl NativePcResolver {
    pub fn new(strategy: NativePcStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> NativePcStrategy {
        self.strategy
    }

    /// Return the innermost host IP on the current stack for which
    /// `in_code` holds. `sentinel` is the register-file base address the
    /// block prologue bound to its frame pointer.
    #[inline(never)]
    pub fn find(&self, sentinel: usize, in_code: impl Fn(usize) -> bool) -> Option<usize> {
        match self.strategy {
            NativePcStrategy::Unwind => unwind_find(in_code),
            NativePcStrategy::FrameScan => {
                let fp = current_frame_pointer();
                // SAFETY: the chain is bounded and starts at this frame;
                // helpers on it are built with frame pointers.
                let ip = unsafe { scan_frame_chain(fp, sentinel, MAX_FRAME_HOPS) }?;
                in_code(ip).then_some(ip)
            }
        }
    }

    /// [`find`](Self::find) restricted to one block's code range.
    pub fn find_in(&self, code: std::ops::Range<usize>, sentinel: usize) -> Option<usize> {
        self.find(sentinel, |ip| code.contains(&ip))
    }
}

#[inline(never)]
fn unwind_find(in_code: impl Fn(usize) -> bool) -> Option<usize> {
    let mut found = None;
    backtrace::trace(|frame| {
        let ip = frame.ip() as usize;
        // Frames with no IP end some unwinds; never report them.
        if ip != 0 && in_code(ip) {
            found = Some(ip);
            false
        } else {
            true
        }
    });
    found
}

#[inline(always)]
fn current_frame_pointer() -> *const usize {
    #[cfg(target_arch = "x86_64")]
    {
        let fp: *const usize;
        // SAFETY: reads a register only.
        unsafe {
            std::arch::asm!("mov {}, rbp", out(reg) fp, options(nomem, nostack, preserves_flags));
        }
        fp
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        std::ptr::null()
    }
}

/// Walk a saved frame-pointer chain starting at `fp`.
///
/// Each frame is `[saved fp][return address]`. The walk stops at the
/// first frame whose saved fp equals `sentinel` and returns that
/// frame's return address. Gives up on a null or misaligned pointer,
/// when `fp` itself is the sentinel (the caller never set up a frame),
/// or after `max_hops` frames.
///
/// # Safety
/// Every frame reached within `max_hops` must be readable.
pub unsafe fn scan_frame_chain(
    mut fp: *const usize,
    sentinel: usize,
    max_hops: usize,
) -> Option<usize> {
    for _ in 0..max_hops {
        if fp.is_null()
            || fp as usize % std::mem::align_of::<usize>() != 0
            || fp as usize == sentinel
        {
            return None;
        }
        let saved = *fp;
        if saved == sentinel {
            return Some(*fp.add(1));
        }
        fp = saved as *const usize;
    }
    None
}
