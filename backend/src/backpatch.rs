//! Fault-guard sites and the shared exception trampolines.
//!
//! A guarded instruction emits only a test and a `jcc` to a target that
//! does not exist yet. Finalization appends one shared trampoline per
//! flavour, a short per-site stub that loads the site's exception code
//! and instruction count into the transfer registers, and points every
//! site at its stub.

use std::ops::Range;

use tracing::trace;
use xlat_core::{BackpatchSite, ExcCode, FixupKind};

use crate::abi::{emit_epilogue, CallArg};
use crate::code_buffer::CodeBuffer;
use crate::exit::ExitGen;
use crate::x86_64::emitter::*;
use crate::x86_64::regs::{Reg, XFER_CODE, XFER_ICOUNT};

/// Sites recorded for the block being compiled, in insertion order.
#[derive(Debug, Default)]
pub struct BackpatchRegistry {
    sites: Vec<BackpatchSite>,
}

/// Result of [`BackpatchRegistry::finalize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedSites {
    pub sites: Vec<BackpatchSite>,
    /// Arena range holding both trampolines and every stub. Empty when
    /// the block has no sites.
    pub trampolines: Range<usize>,
}

impl BackpatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn sites(&self) -> &[BackpatchSite] {
        &self.sites
    }

    /// Emit `jcc <trampoline>` taken when `cond` holds, raising `code`
    /// with `icount` instructions completed.
    pub fn add_guard(&mut self, buf: &mut CodeBuffer, cond: X86Cond, code: u32, icount: u32) {
        let fixup_offset = emit_jcc_fixup(buf, cond);
        self.sites.push(BackpatchSite {
            fixup_offset,
            kind: FixupKind::Rel32,
            exc: ExcCode::Fixed(code),
            icount,
        });
    }

    /// Register the recovery-address operand of an exception-enabled call.
    pub fn add_exc_placeholder(&mut self, fixup_offset: usize, icount: u32) {
        self.sites.push(BackpatchSite {
            fixup_offset,
            kind: FixupKind::Abs64,
            exc: ExcCode::DispatchOnly,
            icount,
        });
    }

    /// Emit the trampolines and stubs and patch every site. Leaves the
    /// registry empty.
    pub fn finalize(&mut self, buf: &mut CodeBuffer, exits: &ExitGen<'_>) -> FinalizedSites {
        let sites = std::mem::take(&mut self.sites);
        let start = buf.offset();
        if sites.is_empty() {
            return FinalizedSites {
                sites,
                trampolines: start..start,
            };
        }

        let raise = buf.offset();
        emit_raise_trampoline(buf, exits);
        let preexc = buf.offset();
        emit_preexc_trampoline(buf, exits);

        for site in &sites {
            let stub = buf.offset();
            let target = match site.exc {
                ExcCode::Fixed(code) => {
                    emit_mov_ri(buf, false, XFER_CODE, code as u64);
                    raise
                }
                ExcCode::DispatchOnly => preexc,
            };
            emit_mov_ri(buf, false, XFER_ICOUNT, site.icount as u64);
            emit_jmp(buf, target);

            match site.kind {
                FixupKind::Rel32 => buf.patch_rel32(site.fixup_offset, stub),
                FixupKind::Abs64 => buf.patch_abs64(site.fixup_offset, stub),
            }
            trace!(
                fixup = site.fixup_offset,
                stub,
                icount = site.icount,
                exc = ?site.exc,
                "backpatched site"
            );
        }

        FinalizedSites {
            sites,
            trampolines: start..buf.offset(),
        }
    }
}

/// `ecx = icount << shift; eax = icount * period`, then add `ecx` to the
/// PC slot at `pc_disp` and `eax` to the cycle counter.
fn emit_site_accounting(buf: &mut CodeBuffer, exits: &ExitGen<'_>, pc_disp: i32) {
    let plan = exits.plan;
    emit_mov_rr(buf, false, Reg::Rcx, XFER_ICOUNT);
    if exits.insn_shift != 0 {
        emit_shift_ri(buf, ShiftOp::Shl, false, Reg::Rcx, exits.insn_shift);
    }
    emit_arith_mr(buf, ArithOp::Add, false, plan.pc.base, pc_disp, Reg::Rcx);
    if exits.cycle_period != 1 {
        emit_imul_ri(buf, false, XFER_ICOUNT, XFER_ICOUNT, exits.cycle_period as i32);
    }
    emit_arith_mr(
        buf,
        ArithOp::Add,
        false,
        plan.slice_cycle.base,
        plan.slice_cycle.disp,
        XFER_ICOUNT,
    );
}

/// Guard fired: move PC to the faulting instruction, charge the
/// completed instructions, deliver the exception and dispatch to the
/// handler.
fn emit_raise_trampoline(buf: &mut CodeBuffer, exits: &ExitGen<'_>) {
    let plan = exits.plan;
    emit_site_accounting(buf, exits, plan.pc.disp);
    exits
        .bridge
        .call_helper(buf, exits.raise, Some(CallArg::Reg(XFER_CODE)));
    plan.load(buf, Reg::Rax, plan.pc);
    exits.emit_dispatch_reg(buf);
    emit_epilogue(buf);
}

/// A helper already raised the exception and saved the block-start PC:
/// fix up the saved PC, charge the completed instructions and dispatch.
fn emit_preexc_trampoline(buf: &mut CodeBuffer, exits: &ExitGen<'_>) {
    let plan = exits.plan;
    emit_site_accounting(buf, exits, plan.spc.disp);
    plan.load(buf, Reg::Rax, plan.pc);
    exits.emit_dispatch_reg(buf);
    emit_epilogue(buf);
}
