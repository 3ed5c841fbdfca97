use xlat_backend::code_buffer::CodeBuffer;

#[test]
fn test_emit_and_read() {
    let mut buf = CodeBuffer::new(4096);
    buf.emit_u8(0x90); // NOP
    buf.emit_u32(0xDEADBEEF);
    assert_eq!(buf.offset(), 5);
    assert_eq!(buf.as_slice()[0], 0x90);
    assert_eq!(buf.read_u32(1), 0xDEADBEEF);
}

#[test]
fn test_patch_forward_branch() {
    let mut buf = CodeBuffer::new(4096);
    buf.emit_u8(0xE9);
    let at = buf.reserve_rel32();
    buf.emit_bytes(&[0x90; 3]);
    buf.bind_rel32(at);
    assert_eq!(buf.read_u32(at), 3);
    assert_eq!(buf.pending_fixups(), 0);
}

#[test]
fn test_reservation_past_capacity_is_dropped() {
    let mut buf = CodeBuffer::new(8);
    buf.emit_u64(1);
    assert!(!buf.is_exhausted());
    let at = buf.reserve_rel32();
    assert!(buf.is_exhausted());
    // Patches after exhaustion are ignored, not fatal.
    buf.patch_rel32(at, 0);
    assert_eq!(buf.offset(), 8);
    assert_eq!(buf.pending_fixups(), 0);
}
