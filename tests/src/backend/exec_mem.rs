use xlat_backend::{ExecRegion, Relocation};

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[test]
fn test_install_resolves_relocations() {
    let mut code = vec![0u8; 8];
    code.push(0xC3);
    let region = ExecRegion::install(&code, &[Relocation { offset: 0, target: 8 }]).unwrap();

    let base = region.as_ptr() as usize;
    assert_eq!(base % page_size(), 0);
    assert_eq!(region.len(), 9);
    let field = u64::from_le_bytes(region.as_slice()[..8].try_into().unwrap());
    assert_eq!(field as usize, base + 8);
    assert_eq!(region.range(), base..base + 9);
}

#[test]
fn test_installed_code_runs() {
    // mov eax, 42; ret
    let code = [0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3];
    let region = ExecRegion::install(&code, &[]).unwrap();
    let f: extern "C" fn() -> u32 = unsafe { std::mem::transmute(region.as_ptr()) };
    assert_eq!(f(), 42);
}
