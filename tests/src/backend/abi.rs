use proptest::prelude::*;
use xlat_backend::abi::{emit_epilogue, emit_prologue};
use xlat_backend::x86_64::emitter::{emit_mov_ri, emit_store};
use xlat_backend::x86_64::regs::BASE_REG;
use xlat_backend::{
    AbiBridge, BackpatchRegistry, CallArg, CallTarget, CodeBuffer, HostAbi, Reg, STACK,
    SYSV_AMD64, WIN64,
};
use xlat_core::guest::{gpr_offset, OFFSET_R};
use xlat_core::{ExcCode, FixupKind};

#[test]
fn test_stack_call_balances() {
    let bridge = AbiBridge::new(&STACK);
    let cases: [&[CallArg]; 4] = [
        &[],
        &[CallArg::Imm(7)],
        &[CallArg::Imm(u64::MAX - 1), CallArg::Reg(Reg::Rcx)],
        &[CallArg::Mem32 { base: Reg::Rsp, disp: 8 }, CallArg::Imm(1)],
    ];
    for args in cases {
        let mut buf = CodeBuffer::new(256);
        let site = bridge.call(&mut buf, CallTarget::Abs(0x1234_5678), args);
        assert_eq!(site.stack_bytes % 16, 0, "{args:?}");
        assert!(site.stack_bytes as usize >= 8 * args.len());
        let code = buf.as_slice();
        if site.stack_bytes > 0 {
            // add rsp, imm8
            assert_eq!(
                &code[code.len() - 4..],
                &[0x48, 0x83, 0xC4, site.stack_bytes as u8]
            );
        }
    }
}

#[test]
fn test_win64_reserves_shadow_space() {
    let bridge = AbiBridge::new(&WIN64);
    let mut buf = CodeBuffer::new(256);
    let site = bridge.call(&mut buf, CallTarget::Abs(0x1000), &[CallArg::Imm(1)]);
    assert_eq!(site.stack_bytes, 32);
    let code = buf.as_slice();
    // sub rsp, 32 ... call r11 ; add rsp, 32
    assert!(code[..site.return_offset].windows(4).any(|w| w == [0x48, 0x83, 0xEC, 0x20]));
    assert_eq!(&code[site.return_offset - 3..site.return_offset], &[0x41, 0xFF, 0xD3]);
    assert_eq!(&code[site.return_offset..], &[0x48, 0x83, 0xC4, 0x20]);
}

#[test]
fn test_exc_call_registers_placeholder() {
    for abi in [&SYSV_AMD64, &WIN64, &STACK] {
        let bridge = AbiBridge::new(abi);
        let mut buf = CodeBuffer::new(256);
        let mut registry = BackpatchRegistry::new();
        bridge.call_exc(
            &mut buf,
            &mut registry,
            CallTarget::Abs(0x1000),
            &[CallArg::Imm(1), CallArg::Imm(2)],
            5,
        );
        assert_eq!(registry.len(), 1, "{}", abi.name);
        let site = registry.sites()[0];
        assert_eq!(site.kind, FixupKind::Abs64);
        assert_eq!(site.exc, ExcCode::DispatchOnly);
        assert_eq!(site.icount, 5);
        assert_eq!(buf.pending_fixups(), 1);
        // test rax, rax ; jz +2 ; jmp rax
        let code = buf.as_slice();
        assert_eq!(
            &code[code.len() - 11..],
            &[0x48, 0x85, 0xC0, 0x0F, 0x84, 0x02, 0x00, 0x00, 0x00, 0xFF, 0xE0]
        );
    }
}

#[test]
#[should_panic(expected = "aliases an argument register")]
fn test_target_aliasing_argument_panics() {
    let bridge = AbiBridge::new(&SYSV_AMD64);
    let mut buf = CodeBuffer::new(256);
    bridge.call(
        &mut buf,
        CallTarget::Reg(Reg::Rsi),
        &[CallArg::Imm(1), CallArg::Imm(2)],
    );
}

#[test]
#[should_panic(expected = "memory argument base")]
fn test_memory_base_aliasing_argument_panics() {
    let bridge = AbiBridge::new(&SYSV_AMD64);
    let mut buf = CodeBuffer::new(256);
    bridge.call(
        &mut buf,
        CallTarget::Abs(0x1000),
        &[CallArg::Imm(1), CallArg::Mem32 { base: Reg::Rdi, disp: 0 }],
    );
}

fn stack_call(target: CallTarget, args: &[CallArg]) {
    let mut buf = CodeBuffer::new(256);
    AbiBridge::new(&STACK).call(&mut buf, target, args);
}

#[test]
#[should_panic(expected = "argument aliases the call scratch register")]
fn test_stack_call_rejects_scratch_register_argument() {
    stack_call(
        CallTarget::Abs(0x1000),
        &[CallArg::Reg(Reg::R11), CallArg::Imm(0x1_2345_6789)],
    );
}

#[test]
#[should_panic(expected = "memory argument base aliases the call scratch register")]
fn test_stack_call_rejects_scratch_memory_base() {
    stack_call(
        CallTarget::Abs(0x1000),
        &[CallArg::Mem32 { base: Reg::R11, disp: 0 }, CallArg::Imm(1)],
    );
}

#[test]
#[should_panic(expected = "call target base aliases the call scratch register")]
fn test_stack_call_rejects_scratch_target_base() {
    stack_call(
        CallTarget::Mem { base: Reg::R11, disp: 8 },
        &[CallArg::Imm(1)],
    );
}

#[test]
#[should_panic(expected = "call target aliases the call scratch register")]
fn test_stack_call_rejects_scratch_target() {
    stack_call(CallTarget::Reg(Reg::R11), &[]);
}

#[test]
fn test_stack_call_pushes_other_registers() {
    let mut buf = CodeBuffer::new(256);
    let site = AbiBridge::new(&STACK).call(
        &mut buf,
        CallTarget::Abs(0x1000),
        &[CallArg::Reg(Reg::R10), CallArg::Imm(0x1_2345_6789)],
    );
    assert_eq!(site.stack_bytes, 16);
    // mov r11, imm64 ; push r11 ; push r10
    let code = buf.as_slice();
    assert_eq!(&code[..2], &[0x49, 0xBB]);
    assert_eq!(&code[10..14], &[0x41, 0x53, 0x41, 0x52]);
}

#[cfg(all(target_arch = "x86_64", unix))]
mod native {
    use super::*;
    use xlat_backend::ExecRegion;
    use xlat_core::GuestRegs;
    use xlat_exec::BlockFn;

    #[repr(C)]
    #[derive(Debug, Default)]
    struct Seen {
        calls: u32,
        arg: u64,
    }

    extern "C" fn record_sysv(seen: *mut Seen, arg: u64) -> *const u8 {
        let seen = unsafe { &mut *seen };
        seen.calls += 1;
        seen.arg = arg;
        std::ptr::null()
    }

    extern "win64" fn record_win64(seen: *mut Seen, arg: u64) -> *const u8 {
        let seen = unsafe { &mut *seen };
        seen.calls += 1;
        seen.arg = arg;
        std::ptr::null()
    }

    /// Wrap `body` in a block that saves `rsp` into r0:r1 before and
    /// r2:r3 after it, then run it.
    fn run(regs: &mut GuestRegs, body: impl FnOnce(&mut CodeBuffer)) {
        let mut buf = CodeBuffer::new(1024);
        emit_prologue(&mut buf, HostAbi::native());
        emit_store(&mut buf, true, Reg::Rsp, BASE_REG, OFFSET_R as i32);
        body(&mut buf);
        emit_store(&mut buf, true, Reg::Rsp, BASE_REG, OFFSET_R as i32 + 8);
        emit_mov_ri(&mut buf, false, Reg::Rax, 0);
        emit_epilogue(&mut buf);
        assert_eq!(buf.pending_fixups(), 0);

        let region = ExecRegion::install(buf.as_slice(), buf.relocations()).unwrap();
        let f: BlockFn = unsafe { std::mem::transmute(region.as_ptr()) };
        let next = unsafe { f(regs) };
        assert!(next.is_null());
        assert_eq!(regs.r[0..2], regs.r[2..4], "stack pointer not restored");
    }

    fn sysv_target() -> CallTarget {
        CallTarget::Abs(record_sysv as *const () as usize)
    }

    #[derive(Debug, Clone, Copy)]
    enum ArgKind {
        Imm(u64),
        Mem(u32),
        Reg(u64),
    }

    fn arg_kind() -> impl Strategy<Value = ArgKind> {
        prop_oneof![
            any::<u64>().prop_map(ArgKind::Imm),
            any::<u32>().prop_map(ArgKind::Mem),
            any::<u64>().prop_map(ArgKind::Reg),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn test_sysv_call_delivers_argument(kind in arg_kind()) {
            let mut seen = Seen::default();
            let ctx = &mut seen as *mut Seen as u64;
            let mut regs = GuestRegs::default();
            let mut r9 = 0;
            let (arg, expected) = match kind {
                ArgKind::Imm(v) => (CallArg::Imm(v), v),
                ArgKind::Mem(v) => {
                    regs.r[5] = v;
                    (CallArg::Mem32 { base: BASE_REG, disp: gpr_offset(5) as i32 }, v as u64)
                }
                ArgKind::Reg(v) => {
                    r9 = v;
                    (CallArg::Reg(Reg::R9), v)
                }
            };

            run(&mut regs, |buf| {
                emit_mov_ri(buf, true, Reg::R9, r9);
                AbiBridge::new(&SYSV_AMD64).call(buf, sysv_target(), &[CallArg::Imm(ctx), arg]);
            });
            prop_assert_eq!(seen.calls, 1);
            prop_assert_eq!(seen.arg, expected);
        }
    }

    #[test]
    fn test_sysv_swapped_registers() {
        let mut seen = Seen::default();
        let ctx = &mut seen as *mut Seen as u64;
        let mut regs = GuestRegs::default();
        run(&mut regs, |buf| {
            emit_mov_ri(buf, true, Reg::Rsi, ctx);
            emit_mov_ri(buf, true, Reg::Rdi, 0x1122_3344_5566_7788);
            AbiBridge::new(&SYSV_AMD64).call(
                buf,
                sysv_target(),
                &[CallArg::Reg(Reg::Rsi), CallArg::Reg(Reg::Rdi)],
            );
        });
        assert_eq!(seen.calls, 1);
        assert_eq!(seen.arg, 0x1122_3344_5566_7788);
    }

    #[test]
    fn test_sysv_chained_registers() {
        let mut seen = Seen::default();
        let ctx = &mut seen as *mut Seen as u64;
        let mut regs = GuestRegs::default();
        run(&mut regs, |buf| {
            emit_mov_ri(buf, true, Reg::Rsi, ctx);
            emit_mov_ri(buf, true, Reg::Rax, 99);
            AbiBridge::new(&SYSV_AMD64).call(
                buf,
                sysv_target(),
                &[CallArg::Reg(Reg::Rsi), CallArg::Reg(Reg::Rax)],
            );
        });
        assert_eq!(seen.arg, 99);
    }

    #[test]
    fn test_sysv_register_and_memory_targets() {
        let mut seen = Seen::default();
        let ctx = &mut seen as *mut Seen as u64;
        let mut regs = GuestRegs::default();
        let func = record_sysv as *const () as usize as u64;
        regs.r[6] = func as u32;
        regs.r[7] = (func >> 32) as u32;
        run(&mut regs, |buf| {
            let bridge = AbiBridge::new(&SYSV_AMD64);
            emit_mov_ri(buf, true, Reg::R10, func);
            bridge.call(buf, CallTarget::Reg(Reg::R10), &[CallArg::Imm(ctx), CallArg::Imm(1)]);
            bridge.call(
                buf,
                CallTarget::Mem { base: BASE_REG, disp: gpr_offset(6) as i32 },
                &[CallArg::Imm(ctx), CallArg::Imm(2)],
            );
        });
        assert_eq!(seen.calls, 2);
        assert_eq!(seen.arg, 2);
    }

    #[test]
    fn test_win64_call_delivers_arguments() {
        let mut seen = Seen::default();
        let ctx = &mut seen as *mut Seen as u64;
        let mut regs = GuestRegs::default();
        regs.r[9] = 0xFEED_F00D;
        run(&mut regs, |buf| {
            let bridge = AbiBridge::new(&WIN64);
            let target = CallTarget::Abs(record_win64 as *const () as usize);
            let value = CallArg::Mem32 { base: BASE_REG, disp: gpr_offset(9) as i32 };
            bridge.call(buf, target, &[CallArg::Imm(ctx), value]);
        });
        assert_eq!(seen.calls, 1);
        assert_eq!(seen.arg, 0xFEED_F00D);
    }

    #[test]
    fn test_win64_swapped_registers() {
        let mut seen = Seen::default();
        let ctx = &mut seen as *mut Seen as u64;
        let mut regs = GuestRegs::default();
        run(&mut regs, |buf| {
            emit_mov_ri(buf, true, Reg::Rdx, ctx);
            emit_mov_ri(buf, true, Reg::Rcx, 5);
            AbiBridge::new(&WIN64).call(
                buf,
                CallTarget::Abs(record_win64 as *const () as usize),
                &[CallArg::Reg(Reg::Rdx), CallArg::Reg(Reg::Rcx)],
            );
        });
        assert_eq!(seen.arg, 5);
    }
}
