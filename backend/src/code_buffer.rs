use tracing::trace;

/// Default arena capacity: 64 KiB.
const DEFAULT_CODE_BUF_SIZE: usize = 64 * 1024;

/// An absolute 64-bit reference that can only be resolved once the
/// code has reached its final address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    /// Arena offset of the 8-byte field.
    pub offset: usize,
    /// Arena offset the field must point at.
    pub target: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FixupWidth {
    Rel32,
    Abs64,
}

/// Append-only emission arena for one block.
///
/// All positions are arena offsets; nothing here knows where the code
/// will finally live. Emission beyond the capacity never panics: the
/// buffer becomes exhausted, further bytes are dropped, and the
/// compiler discards the partial block.
pub struct CodeBuffer {
    code: Vec<u8>,
    capacity: usize,
    exhausted: bool,
    /// Reserved, not yet patched fixups.
    pending: Vec<(usize, FixupWidth)>,
    relocs: Vec<Relocation>,
}

impl CodeBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            code: Vec::with_capacity(capacity.min(DEFAULT_CODE_BUF_SIZE)),
            capacity,
            exhausted: false,
            pending: Vec::new(),
            relocs: Vec::new(),
        }
    }

    pub fn with_default_size() -> Self {
        Self::new(DEFAULT_CODE_BUF_SIZE)
    }

    /// Drop all emitted code and start a new block.
    pub fn reset(&mut self) {
        self.code.clear();
        self.exhausted = false;
        self.pending.clear();
        self.relocs.clear();
    }

    /// Current emission offset.
    #[inline]
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.capacity - self.code.len()
    }

    /// Whether an emission ran past the capacity.
    #[inline]
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    #[inline]
    fn fits(&mut self, n: usize) -> bool {
        if self.exhausted || self.code.len() + n > self.capacity {
            if !self.exhausted {
                trace!(offset = self.code.len(), capacity = self.capacity, "code buffer exhausted");
            }
            self.exhausted = true;
            return false;
        }
        true
    }

    // -- Emit methods --

    #[inline]
    pub fn emit_u8(&mut self, val: u8) {
        if self.fits(1) {
            self.code.push(val);
        }
    }

    #[inline]
    pub fn emit_u16(&mut self, val: u16) {
        self.emit_bytes(&val.to_le_bytes());
    }

    #[inline]
    pub fn emit_u32(&mut self, val: u32) {
        self.emit_bytes(&val.to_le_bytes());
    }

    #[inline]
    pub fn emit_u64(&mut self, val: u64) {
        self.emit_bytes(&val.to_le_bytes());
    }

    #[inline]
    pub fn emit_bytes(&mut self, data: &[u8]) {
        if self.fits(data.len()) {
            self.code.extend_from_slice(data);
        }
    }

    // -- Fixups --

    /// Emit a zero rel32 field and reserve it for one later patch.
    pub fn reserve_rel32(&mut self) -> usize {
        let at = self.offset();
        self.emit_u32(0);
        if !self.exhausted {
            self.pending.push((at, FixupWidth::Rel32));
        }
        at
    }

    /// Emit a zero 64-bit field and reserve it for one later patch.
    pub fn reserve_abs64(&mut self) -> usize {
        let at = self.offset();
        self.emit_u64(0);
        if !self.exhausted {
            self.pending.push((at, FixupWidth::Abs64));
        }
        at
    }

    fn take_reservation(&mut self, at: usize, width: FixupWidth) {
        let idx = self
            .pending
            .iter()
            .position(|&(off, w)| off == at && w == width);
        assert!(
            idx.is_some(),
            "patch of unreserved or already patched fixup at {at:#x}"
        );
        if let Some(idx) = idx {
            self.pending.swap_remove(idx);
        }
    }

    /// Point the rel32 field at `at` to arena offset `target`.
    pub fn patch_rel32(&mut self, at: usize, target: usize) {
        if self.exhausted {
            return;
        }
        assert!(at + 4 <= self.code.len(), "fixup {at:#x} out of range");
        self.take_reservation(at, FixupWidth::Rel32);
        let disp = target as i64 - (at as i64 + 4);
        assert!(
            disp >= i32::MIN as i64 && disp <= i32::MAX as i64,
            "rel32 displacement out of range"
        );
        self.code[at..at + 4].copy_from_slice(&(disp as i32).to_le_bytes());
    }

    /// Point a rel32 field at the current offset (binds a forward label).
    pub fn bind_rel32(&mut self, at: usize) {
        let here = self.offset();
        self.patch_rel32(at, here);
    }

    /// Resolve the 64-bit field at `at` to the absolute address of arena
    /// offset `target` once the code is installed.
    pub fn patch_abs64(&mut self, at: usize, target: usize) {
        if self.exhausted {
            return;
        }
        assert!(at + 8 <= self.code.len(), "fixup {at:#x} out of range");
        self.take_reservation(at, FixupWidth::Abs64);
        self.relocs.push(Relocation { offset: at, target });
    }

    /// Number of reserved fixups that have not been patched.
    pub fn pending_fixups(&self) -> usize {
        self.pending.len()
    }

    pub fn relocations(&self) -> &[Relocation] {
        &self.relocs
    }

    #[inline]
    pub fn read_u32(&self, offset: usize) -> u32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.code[offset..offset + 4]);
        u32::from_le_bytes(b)
    }

    #[inline]
    pub fn read_u64(&self, offset: usize) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.code[offset..offset + 8]);
        u64::from_le_bytes(b)
    }

    /// Generated code up to the current offset.
    pub fn as_slice(&self) -> &[u8] {
        &self.code
    }
}

impl Default for CodeBuffer {
    fn default() -> Self {
        Self::with_default_size()
    }
}
