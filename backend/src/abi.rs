//! Host calling conventions and helper-call emission.
//!
//! Generated code reaches runtime helpers (block resolution, exception
//! delivery, guest memory access) only through [`AbiBridge`], which
//! marshals up to two arguments the way the active [`HostAbi`] expects.
//! Every call clobbers the table's `call_clobbered` set; callers must
//! treat those registers as dead afterwards.

use crate::backpatch::BackpatchRegistry;
use crate::code_buffer::CodeBuffer;
use crate::x86_64::emitter::*;
use crate::x86_64::regs::{Reg, RegSet, BASE_REG, CALLEE_SAVED, FRAME_SCRATCH, STACK_ALIGN};

/// Capability table for one host calling convention.
#[derive(Debug)]
pub struct HostAbi {
    pub name: &'static str,
    /// Integer argument registers in order; empty when every argument
    /// is passed on the stack.
    pub arg_regs: &'static [Reg],
    /// Bytes the caller must reserve above the return address.
    pub shadow_space: u32,
    /// Register used to hold an absolute call target. Never an
    /// argument or return register.
    pub call_scratch: Reg,
    pub return_reg: Reg,
    pub call_clobbered: RegSet,
}

pub static SYSV_AMD64: HostAbi = HostAbi {
    name: "sysv-amd64",
    arg_regs: &[Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9],
    shadow_space: 0,
    call_scratch: Reg::R11,
    return_reg: Reg::Rax,
    call_clobbered: RegSet::of(&[
        Reg::Rax,
        Reg::Rcx,
        Reg::Rdx,
        Reg::Rsi,
        Reg::Rdi,
        Reg::R8,
        Reg::R9,
        Reg::R10,
        Reg::R11,
    ]),
};

pub static WIN64: HostAbi = HostAbi {
    name: "win64",
    arg_regs: &[Reg::Rcx, Reg::Rdx, Reg::R8, Reg::R9],
    shadow_space: 32,
    call_scratch: Reg::R11,
    return_reg: Reg::Rax,
    call_clobbered: RegSet::of(&[
        Reg::Rax,
        Reg::Rcx,
        Reg::Rdx,
        Reg::R8,
        Reg::R9,
        Reg::R10,
        Reg::R11,
    ]),
};

/// All arguments pushed right to left, caller cleans up.
pub static STACK: HostAbi = HostAbi {
    name: "stack",
    arg_regs: &[],
    shadow_space: 0,
    call_scratch: Reg::R11,
    return_reg: Reg::Rax,
    call_clobbered: RegSet::of(&[
        Reg::Rax,
        Reg::Rcx,
        Reg::Rdx,
        Reg::Rsi,
        Reg::Rdi,
        Reg::R8,
        Reg::R9,
        Reg::R10,
        Reg::R11,
    ]),
};

impl HostAbi {
    /// Convention used by `extern "C"` on this host.
    pub fn native() -> &'static HostAbi {
        if cfg!(windows) {
            &WIN64
        } else {
            &SYSV_AMD64
        }
    }

    pub fn passes_in_registers(&self) -> bool {
        !self.arg_regs.is_empty()
    }
}

/// Most arguments a bridged call takes, not counting the recovery
/// placeholder of exception-enabled calls.
pub const MAX_CALL_ARGS: usize = 2;

/// A runtime helper: `func` is called with `ctx` as its first argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Helper {
    pub func: usize,
    pub ctx: usize,
}

impl Helper {
    pub fn new(func: usize, ctx: usize) -> Self {
        Self { func, ctx }
    }
}

/// A call argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallArg {
    Imm(u64),
    Reg(Reg),
    /// 32-bit value at `[base+disp]`, zero-extended.
    Mem32 { base: Reg, disp: i32 },
}

/// Where the callee address comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTarget {
    Abs(usize),
    Reg(Reg),
    Mem { base: Reg, disp: i32 },
}

/// Layout of an emitted call sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    /// Offset of the first instruction of the sequence.
    pub start: usize,
    /// Offset just past the call instruction (the pushed return address).
    pub return_offset: usize,
    /// Bytes of stack allocated around the call and released after it.
    pub stack_bytes: u32,
}

#[derive(Clone, Copy)]
enum Operand {
    Arg(CallArg),
    Placeholder,
}

/// Emits calls for one host convention.
#[derive(Debug, Clone, Copy)]
pub struct AbiBridge {
    abi: &'static HostAbi,
}

impl AbiBridge {
    pub fn new(abi: &'static HostAbi) -> Self {
        Self { abi }
    }

    pub fn native() -> Self {
        Self::new(HostAbi::native())
    }

    pub fn abi(&self) -> &'static HostAbi {
        self.abi
    }

    /// Emit a call to `target` with up to two arguments.
    pub fn call(&self, buf: &mut CodeBuffer, target: CallTarget, args: &[CallArg]) -> CallSite {
        assert!(args.len() <= MAX_CALL_ARGS, "at most {MAX_CALL_ARGS} call arguments");
        let ops: Vec<Operand> = args.iter().map(|&a| Operand::Arg(a)).collect();
        self.emit_call(buf, target, &ops).0
    }

    /// Call a [`Helper`], passing its context first and `arg` second.
    pub fn call_helper(&self, buf: &mut CodeBuffer, helper: Helper, arg: Option<CallArg>) -> CallSite {
        let ctx = CallArg::Imm(helper.ctx as u64);
        match arg {
            Some(a) => self.call(buf, CallTarget::Abs(helper.func), &[ctx, a]),
            None => self.call(buf, CallTarget::Abs(helper.func), &[ctx]),
        }
    }

    /// Emit an exception-enabled call.
    ///
    /// A zero recovery-address operand is appended after `args` and
    /// registered with `registry` (patched at finalization to a stub that
    /// enters the already-raised trampoline). The helper returns null to
    /// continue, or hands back the recovery address after raising the
    /// guest exception itself, in which case control transfers there.
    pub fn call_exc(
        &self,
        buf: &mut CodeBuffer,
        registry: &mut BackpatchRegistry,
        target: CallTarget,
        args: &[CallArg],
        icount: u32,
    ) -> CallSite {
        assert!(args.len() <= MAX_CALL_ARGS, "at most {MAX_CALL_ARGS} call arguments");
        let mut ops: Vec<Operand> = args.iter().map(|&a| Operand::Arg(a)).collect();
        ops.push(Operand::Placeholder);
        let (site, fixup) = self.emit_call(buf, target, &ops);
        if let Some(fixup) = fixup {
            registry.add_exc_placeholder(fixup, icount);
        }

        let ret = self.abi.return_reg;
        emit_test_rr(buf, true, ret, ret);
        let resume = emit_jcc_fixup(buf, X86Cond::Je);
        emit_jmp_reg(buf, ret);
        buf.bind_rel32(resume);
        site
    }

    fn emit_call(
        &self,
        buf: &mut CodeBuffer,
        target: CallTarget,
        ops: &[Operand],
    ) -> (CallSite, Option<usize>) {
        if self.abi.passes_in_registers() {
            self.emit_register_call(buf, target, ops)
        } else {
            self.emit_stack_call(buf, target, ops)
        }
    }

    fn emit_register_call(
        &self,
        buf: &mut CodeBuffer,
        target: CallTarget,
        ops: &[Operand],
    ) -> (CallSite, Option<usize>) {
        let start = buf.offset();
        assert!(ops.len() <= self.abi.arg_regs.len());
        let dsts = &self.abi.arg_regs[..ops.len()];
        match target {
            CallTarget::Reg(r) => {
                assert!(!dsts.contains(&r), "call target {r:?} aliases an argument register")
            }
            CallTarget::Mem { base, .. } => {
                assert!(!dsts.contains(&base), "call target base {base:?} aliases an argument register")
            }
            CallTarget::Abs(_) => {}
        }

        let mut moves = Vec::with_capacity(ops.len());
        for (op, &dst) in ops.iter().zip(dsts) {
            match *op {
                Operand::Arg(CallArg::Reg(src)) if src != dst => moves.push((dst, src)),
                Operand::Arg(CallArg::Mem32 { base, .. }) => assert!(
                    !dsts.contains(&base),
                    "memory argument base {base:?} aliases an argument register"
                ),
                _ => {}
            }
        }
        emit_parallel_moves(buf, &mut moves);

        let mut fixup = None;
        for (op, &dst) in ops.iter().zip(dsts) {
            match *op {
                Operand::Arg(CallArg::Mem32 { base, disp }) => emit_load(buf, false, dst, base, disp),
                Operand::Arg(CallArg::Imm(v)) => emit_mov_ri(buf, true, dst, v),
                Operand::Placeholder => fixup = Some(emit_movabs_fixup(buf, dst)),
                Operand::Arg(CallArg::Reg(_)) => {}
            }
        }

        let shadow = self.abi.shadow_space;
        if shadow > 0 {
            emit_arith_ri(buf, ArithOp::Sub, true, Reg::Rsp, shadow as i32);
        }
        self.emit_call_insn(buf, target, shadow as i32);
        let return_offset = buf.offset();
        if shadow > 0 {
            emit_arith_ri(buf, ArithOp::Add, true, Reg::Rsp, shadow as i32);
        }
        let site = CallSite {
            start,
            return_offset,
            stack_bytes: shadow,
        };
        (site, fixup)
    }

    fn emit_stack_call(
        &self,
        buf: &mut CodeBuffer,
        target: CallTarget,
        ops: &[Operand],
    ) -> (CallSite, Option<usize>) {
        let start = buf.offset();
        let scratch = self.abi.call_scratch;
        match target {
            CallTarget::Reg(r) => {
                assert!(r != scratch, "call target aliases the call scratch register")
            }
            CallTarget::Mem { base, .. } => assert!(
                base != scratch,
                "call target base aliases the call scratch register"
            ),
            CallTarget::Abs(_) => {}
        }
        for op in ops {
            match *op {
                Operand::Arg(CallArg::Reg(r)) => {
                    assert!(r != scratch, "argument aliases the call scratch register")
                }
                Operand::Arg(CallArg::Mem32 { base, .. }) => assert!(
                    base != scratch,
                    "memory argument base aliases the call scratch register"
                ),
                _ => {}
            }
        }

        let pushed = ops.len() * 8;
        let pad = (STACK_ALIGN - pushed % STACK_ALIGN) % STACK_ALIGN + self.abi.shadow_space as usize;
        if pad > 0 {
            emit_arith_ri(buf, ArithOp::Sub, true, Reg::Rsp, pad as i32);
        }

        let mut depth = pad as i32;
        let mut fixup = None;
        for op in ops.iter().rev() {
            match *op {
                Operand::Arg(CallArg::Imm(v)) => {
                    let sv = v as i64;
                    if sv >= i32::MIN as i64 && sv <= i32::MAX as i64 {
                        emit_push_imm(buf, sv as i32);
                    } else {
                        emit_mov_ri(buf, true, scratch, v);
                        emit_push(buf, scratch);
                    }
                }
                Operand::Arg(CallArg::Reg(r)) => emit_push(buf, r),
                Operand::Arg(CallArg::Mem32 { base, disp }) => {
                    let disp = if base == Reg::Rsp { disp + depth } else { disp };
                    emit_load(buf, false, scratch, base, disp);
                    emit_push(buf, scratch);
                }
                Operand::Placeholder => {
                    fixup = Some(emit_movabs_fixup(buf, scratch));
                    emit_push(buf, scratch);
                }
            }
            depth += 8;
        }

        self.emit_call_insn(buf, target, depth);
        let return_offset = buf.offset();
        if depth > 0 {
            emit_arith_ri(buf, ArithOp::Add, true, Reg::Rsp, depth);
        }
        let site = CallSite {
            start,
            return_offset,
            stack_bytes: depth as u32,
        };
        (site, fixup)
    }

    /// `rsp_adjust` is how far `rsp` has moved since the sequence began,
    /// so rsp-relative targets still name the same slot.
    fn emit_call_insn(&self, buf: &mut CodeBuffer, target: CallTarget, rsp_adjust: i32) {
        match target {
            CallTarget::Abs(addr) => {
                emit_mov_ri(buf, true, self.abi.call_scratch, addr as u64);
                emit_call_reg(buf, self.abi.call_scratch);
            }
            CallTarget::Reg(r) => emit_call_reg(buf, r),
            CallTarget::Mem { base, disp } => {
                let disp = if base == Reg::Rsp { disp + rsp_adjust } else { disp };
                emit_call_mem(buf, base, disp);
            }
        }
    }
}

/// Emit register-to-register moves so that no source is overwritten
/// before it is read. Cycles are broken with `xchg`.
fn emit_parallel_moves(buf: &mut CodeBuffer, moves: &mut Vec<(Reg, Reg)>) {
    while !moves.is_empty() {
        let ready = (0..moves.len()).find(|&i| {
            let dst = moves[i].0;
            !moves.iter().enumerate().any(|(j, m)| j != i && m.1 == dst)
        });
        match ready {
            Some(i) => {
                let (dst, src) = moves.remove(i);
                emit_mov_rr(buf, true, dst, src);
            }
            None => {
                let (dst, src) = moves.remove(0);
                emit_xchg(buf, true, dst, src);
                for m in moves.iter_mut() {
                    if m.1 == dst {
                        m.1 = src;
                    } else if m.1 == src {
                        m.1 = dst;
                    }
                }
                moves.retain(|m| m.0 != m.1);
            }
        }
    }
}

/// Emit the block prologue: save callee-saved state, bind [`BASE_REG`]
/// to the guest register file (the block's first argument) and reserve
/// the scratch area.
pub fn emit_prologue(buf: &mut CodeBuffer, abi: &HostAbi) {
    for &reg in CALLEE_SAVED {
        emit_push(buf, reg);
    }
    match abi.arg_regs.first() {
        Some(&arg0) => emit_mov_rr(buf, true, BASE_REG, arg0),
        None => {
            // Return address plus the saved registers sit above the argument.
            let disp = ((CALLEE_SAVED.len() + 1) * 8) as i32;
            emit_load(buf, true, BASE_REG, Reg::Rsp, disp);
        }
    }
    emit_arith_ri(buf, ArithOp::Sub, true, Reg::Rsp, FRAME_SCRATCH as i32);
}

/// Emit the block epilogue. The next entry point is already in the
/// return register.
pub fn emit_epilogue(buf: &mut CodeBuffer) {
    emit_arith_ri(buf, ArithOp::Add, true, Reg::Rsp, FRAME_SCRATCH as i32);
    for &reg in CALLEE_SAVED.iter().rev() {
        emit_pop(buf, reg);
    }
    emit_ret(buf);
}
