use std::io;
use std::ptr;

use crate::code_buffer::Relocation;

/// Executable copy of one finished block.
///
/// Backed by an anonymous mapping that is written once while RW, then
/// flipped to RX and never written again (W^X).
pub struct ExecRegion {
    ptr: *mut u8,
    len: usize,
    map_len: usize,
}

// SAFETY: the mapping is owned exclusively and immutable after install.
unsafe impl Send for ExecRegion {}
unsafe impl Sync for ExecRegion {}

impl ExecRegion {
    /// Map `code`, resolve `relocs` against the final address and make
    /// the result executable.
    pub fn install(code: &[u8], relocs: &[Relocation]) -> io::Result<Self> {
        let page_size = page_size();
        let map_len = (code.len().max(1) + page_size - 1) & !(page_size - 1);

        // SAFETY: MAP_ANONYMOUS | MAP_PRIVATE, no file backing.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let region = Self {
            ptr: ptr as *mut u8,
            len: code.len(),
            map_len,
        };

        // SAFETY: the mapping is at least code.len() bytes and RW.
        unsafe {
            ptr::copy_nonoverlapping(code.as_ptr(), region.ptr, code.len());
        }
        let base = region.ptr as usize;
        for r in relocs {
            assert!(r.offset + 8 <= code.len() && r.target <= code.len());
            let abs = (base + r.target) as u64;
            // SAFETY: bounds checked above.
            unsafe { (region.ptr.add(r.offset) as *mut u64).write_unaligned(abs) };
        }

        let ret = unsafe {
            libc::mprotect(
                region.ptr as *mut libc::c_void,
                map_len,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(region)
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr as *const u8
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Host address range `[start, start + len)`.
    pub fn range(&self) -> std::ops::Range<usize> {
        let start = self.ptr as usize;
        start..start + self.len
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: len bytes were written during install.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl Drop for ExecRegion {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                libc::munmap(self.ptr as *mut libc::c_void, self.map_len);
            }
        }
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf is always safe to call.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}
