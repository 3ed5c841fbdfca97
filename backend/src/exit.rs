//! Block-termination sequences.
//!
//! Every exit commits the cycles consumed by the block, leaves the next
//! guest PC in the register file and returns the next entry point (or
//! null when the successor is not compiled yet) to the dispatcher.

use xlat_core::{ExitDescriptor, PcSource};

use crate::abi::{emit_epilogue, AbiBridge, CallArg, Helper};
use crate::binding::RegisterBindingPlan;
use crate::code_buffer::CodeBuffer;
use crate::x86_64::emitter::*;
use crate::x86_64::regs::Reg;

/// Resident part of the instruction-cache slot table.
///
/// Slot `i` holds the entry point for guest address
/// `base + (i << shift)`; `slots` is the host address of slot 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcacheWindow {
    pub base: u32,
    pub size: u32,
    pub slots: usize,
    pub shift: u8,
}

impl IcacheWindow {
    /// A window that never matches; every dispatch calls the resolver.
    pub const DISABLED: IcacheWindow = IcacheWindow {
        base: 0,
        size: 0,
        slots: 0,
        shift: 0,
    };

    pub fn slot_of(&self, pc: u32) -> Option<usize> {
        let off = pc.wrapping_sub(self.base);
        if pc >= self.base && off < self.size {
            Some((off >> self.shift) as usize)
        } else {
            None
        }
    }

    fn slot_addr(&self, idx: usize) -> u64 {
        (self.slots + idx * 8) as u64
    }
}

/// How a block ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Jump to a constant PC. `endpc` is the address following the last
    /// instruction executed.
    Abs { pc: u32, endpc: u32 },
    /// Like `Abs`, but the PC is formed at run time as
    /// `current PC + (pc - block_start)`.
    Rel { pc: u32, endpc: u32 },
    /// Continue at the PC already written to the register file.
    PcSet { endpc: u32 },
    /// Continue at the staged new PC (delayed branch target).
    NewPcSet { endpc: u32 },
    /// Raise guest exception `code` at instruction `pc`.
    Exception { code: u32, pc: u32 },
}

/// Per-block exit emitter.
#[derive(Debug, Clone, Copy)]
pub struct ExitGen<'a> {
    pub bridge: AbiBridge,
    pub plan: &'a RegisterBindingPlan,
    pub block_start: u32,
    /// log2 of the guest instruction width.
    pub insn_shift: u8,
    /// Cycles charged per guest instruction.
    pub cycle_period: u32,
    pub window: IcacheWindow,
    /// `fn(ctx, pc) -> entry` lookup used on an ICache miss.
    pub resolve: Helper,
    /// `fn(ctx, code)` guest exception delivery.
    pub raise: Helper,
}

impl ExitGen<'_> {
    /// Cycles consumed by the instructions in `[block_start, endpc)`.
    pub fn cycles_to(&self, endpc: u32) -> u32 {
        let insns = endpc.wrapping_sub(self.block_start) >> self.insn_shift;
        match insns.checked_mul(self.cycle_period) {
            Some(cycles) => cycles,
            None => panic!("cycle count for {insns} instructions overflows u32"),
        }
    }

    /// Emit `exit` followed by the block epilogue.
    pub fn emit(&self, buf: &mut CodeBuffer, exit: Exit) -> ExitDescriptor {
        let desc = match exit {
            Exit::Abs { pc, endpc } => self.exit_abs(buf, pc, endpc),
            Exit::Rel { pc, endpc } => self.exit_rel(buf, pc, endpc),
            Exit::PcSet { endpc } => self.exit_pcset(buf, endpc),
            Exit::NewPcSet { endpc } => self.exit_newpcset(buf, endpc),
            Exit::Exception { code, pc } => self.exit_exc(buf, code, pc),
        };
        emit_epilogue(buf);
        desc
    }

    fn exit_abs(&self, buf: &mut CodeBuffer, pc: u32, endpc: u32) -> ExitDescriptor {
        self.plan.store_imm(buf, self.plan.pc, pc);
        let desc = self.dispatch_const(buf, pc, CallArg::Imm(pc as u64));
        self.commit_cycles(buf, endpc);
        desc
    }

    fn exit_rel(&self, buf: &mut CodeBuffer, pc: u32, endpc: u32) -> ExitDescriptor {
        let delta = pc.wrapping_sub(self.block_start);
        emit_mov_ri(buf, false, Reg::Rcx, delta as u64);
        emit_arith_rm(buf, ArithOp::Add, false, Reg::Rcx, self.plan.pc.base, self.plan.pc.disp);
        self.plan.store(buf, Reg::Rcx, self.plan.pc);
        let desc = self.dispatch_const(buf, pc, CallArg::Reg(Reg::Rcx));
        self.commit_cycles(buf, endpc);
        desc
    }

    fn exit_pcset(&self, buf: &mut CodeBuffer, endpc: u32) -> ExitDescriptor {
        self.commit_cycles(buf, endpc);
        self.plan.load(buf, Reg::Rax, self.plan.pc);
        self.emit_dispatch_reg(buf);
        ExitDescriptor::RegisterIndirect(PcSource::Pc)
    }

    fn exit_newpcset(&self, buf: &mut CodeBuffer, endpc: u32) -> ExitDescriptor {
        self.plan.load(buf, Reg::Rax, self.plan.new_pc);
        self.plan.store(buf, Reg::Rax, self.plan.pc);
        self.commit_cycles(buf, endpc);
        self.emit_dispatch_reg(buf);
        ExitDescriptor::RegisterIndirect(PcSource::NewPc)
    }

    fn exit_exc(&self, buf: &mut CodeBuffer, code: u32, pc: u32) -> ExitDescriptor {
        let delta = pc.wrapping_sub(self.block_start);
        if delta != 0 {
            self.plan.add_imm(buf, self.plan.pc, delta as i32);
        }
        self.commit_cycles(buf, pc);
        self.bridge
            .call_helper(buf, self.raise, Some(CallArg::Imm(code as u64)));
        self.plan.load(buf, Reg::Rax, self.plan.pc);
        self.emit_dispatch_reg(buf);
        ExitDescriptor::Exception(code, pc)
    }

    /// `add [slice_cycle], cycles_to(endpc)`; nothing when zero.
    pub fn commit_cycles(&self, buf: &mut CodeBuffer, endpc: u32) {
        let cycles = self.cycles_to(endpc);
        assert!(cycles <= i32::MAX as u32, "cycle delta {cycles} overflows imm32");
        if cycles != 0 {
            self.plan.add_imm(buf, self.plan.slice_cycle, cycles as i32);
        }
    }

    /// Next entry for a compile-time PC: read the ICache slot when `pc`
    /// is resident, otherwise call the resolver with `pc_arg`.
    fn dispatch_const(&self, buf: &mut CodeBuffer, pc: u32, pc_arg: CallArg) -> ExitDescriptor {
        match self.window.slot_of(pc) {
            Some(idx) => {
                emit_movabs(buf, Reg::Rax, self.window.slot_addr(idx));
                emit_load(buf, true, Reg::Rax, Reg::Rax, 0);
                ExitDescriptor::StaticViaICache(pc, idx)
            }
            None => {
                self.bridge.call_helper(buf, self.resolve, Some(pc_arg));
                ExitDescriptor::Static(pc)
            }
        }
    }

    /// Next entry for the guest PC held in `eax`; result in `rax`.
    /// The window test happens at run time.
    pub fn emit_dispatch_reg(&self, buf: &mut CodeBuffer) {
        if self.window.size == 0 {
            self.bridge
                .call_helper(buf, self.resolve, Some(CallArg::Reg(Reg::Rax)));
            return;
        }
        emit_mov_rr(buf, false, Reg::Rcx, Reg::Rax);
        emit_arith_ri(buf, ArithOp::Sub, false, Reg::Rcx, self.window.base as i32);
        emit_arith_ri(buf, ArithOp::Cmp, false, Reg::Rcx, self.window.size as i32);
        let miss = emit_jcc_fixup(buf, X86Cond::Jae);
        if self.window.shift != 0 {
            emit_shift_ri(buf, ShiftOp::Shr, false, Reg::Rcx, self.window.shift);
        }
        emit_movabs(buf, Reg::Rdx, self.window.slots as u64);
        emit_load_sib(buf, true, Reg::Rax, Reg::Rdx, Reg::Rcx, 3, 0);
        let done = emit_jmp_fixup(buf);
        buf.bind_rel32(miss);
        self.bridge
            .call_helper(buf, self.resolve, Some(CallArg::Reg(Reg::Rax)));
        buf.bind_rel32(done);
    }
}
