use xlat_core::guest::{
    gpr_offset, OFFSET_NEW_PC, OFFSET_PC, OFFSET_SLICE_CYCLE, OFFSET_SPC, OFFSET_SR,
};
use xlat_core::NUM_GPRS;

use crate::abi::CallArg;
use crate::code_buffer::CodeBuffer;
use crate::x86_64::emitter::{emit_arith_mi, emit_load, emit_store, emit_store_imm, ArithOp};
use crate::x86_64::regs::{Reg, BASE_REG};

/// Where a guest register lives while a block runs: a 32-bit slot at
/// `[base + disp]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub base: Reg,
    pub disp: i32,
}

impl Slot {
    pub fn as_arg(self) -> CallArg {
        CallArg::Mem32 {
            base: self.base,
            disp: self.disp,
        }
    }
}

/// Compile-time mapping of guest architectural state to host operands.
///
/// Shared read-only by every block; all guest state is kept in the
/// register file addressed through [`BASE_REG`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterBindingPlan {
    gprs: [Slot; NUM_GPRS],
    pub pc: Slot,
    pub new_pc: Slot,
    pub spc: Slot,
    pub slice_cycle: Slot,
    pub sr: Slot,
}

const fn slot(offset: usize) -> Slot {
    Slot {
        base: BASE_REG,
        disp: offset as i32,
    }
}

const fn standard_gprs() -> [Slot; NUM_GPRS] {
    let mut out = [slot(0); NUM_GPRS];
    let mut i = 0;
    while i < NUM_GPRS {
        out[i] = slot(gpr_offset(i));
        i += 1;
    }
    out
}

/// The plan every block uses.
pub static STANDARD_PLAN: RegisterBindingPlan = RegisterBindingPlan {
    gprs: standard_gprs(),
    pc: slot(OFFSET_PC),
    new_pc: slot(OFFSET_NEW_PC),
    spc: slot(OFFSET_SPC),
    slice_cycle: slot(OFFSET_SLICE_CYCLE),
    sr: slot(OFFSET_SR),
};

impl RegisterBindingPlan {
    pub fn gpr(&self, n: usize) -> Slot {
        self.gprs[n]
    }

    /// `mov dst32, guest_slot`
    pub fn load(&self, buf: &mut CodeBuffer, dst: Reg, slot: Slot) {
        emit_load(buf, false, dst, slot.base, slot.disp);
    }

    /// `mov guest_slot, src32`
    pub fn store(&self, buf: &mut CodeBuffer, src: Reg, slot: Slot) {
        emit_store(buf, false, src, slot.base, slot.disp);
    }

    /// `mov guest_slot, imm32`
    pub fn store_imm(&self, buf: &mut CodeBuffer, slot: Slot, imm: u32) {
        emit_store_imm(buf, false, slot.base, slot.disp, imm as i32);
    }

    /// `add guest_slot, imm32`
    pub fn add_imm(&self, buf: &mut CodeBuffer, slot: Slot, imm: i32) {
        emit_arith_mi(buf, ArithOp::Add, false, slot.base, slot.disp, imm);
    }
}
