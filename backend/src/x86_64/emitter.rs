#![allow(non_upper_case_globals)]

use crate::code_buffer::CodeBuffer;
use crate::x86_64::regs::Reg;

// -- Prefix flags --

pub const P_EXT: u32 = 0x100; // 0x0F prefix
pub const P_REXW: u32 = 0x1000; // REX.W = 1

// -- Opcode constants --

pub const OPC_ARITH_EvIb: u32 = 0x83;
pub const OPC_ARITH_EvIz: u32 = 0x81;
pub const OPC_ARITH_GvEv: u32 = 0x03;

pub const OPC_SHIFT_1: u32 = 0xD1;
pub const OPC_SHIFT_Ib: u32 = 0xC1;

pub const OPC_MOVL_EvGv: u32 = 0x89;
pub const OPC_MOVL_GvEv: u32 = 0x8B;
pub const OPC_MOVL_EvIz: u32 = 0xC7;
pub const OPC_MOVL_Iv: u32 = 0xB8;

pub const OPC_JCC_long: u32 = 0x80 | P_EXT;
pub const OPC_JMP_long: u32 = 0xE9;

pub const OPC_TESTL: u32 = 0x85;
pub const OPC_GRP5: u32 = 0xFF;
pub const OPC_IMUL_GvEvIb: u32 = 0x6B;
pub const OPC_IMUL_GvEvIz: u32 = 0x69;
pub const OPC_XCHG_EvGv: u32 = 0x87;
pub const OPC_PUSH_r32: u32 = 0x50;
pub const OPC_POP_r32: u32 = 0x58;
pub const OPC_PUSH_Iz: u32 = 0x68;
pub const OPC_PUSH_Ib: u32 = 0x6A;
pub const OPC_RET: u32 = 0xC3;

/// Arithmetic sub-opcodes (/r field of 0x81/0x83, shifted into GvEv).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ArithOp {
    Add = 0,
    Or = 1,
    Adc = 2,
    Sbb = 3,
    And = 4,
    Sub = 5,
    Xor = 6,
    Cmp = 7,
}

/// Shift sub-opcodes (/r field of 0xC1/0xD1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShiftOp {
    Rol = 0,
    Ror = 1,
    Shl = 4,
    Shr = 5,
    Sar = 7,
}

/// Group 5 extension codes (/r field of 0xFF).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Ext5Op {
    CallN = 2,
    JmpN = 4,
}

/// x86 condition codes for Jcc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum X86Cond {
    Jo = 0x0,
    Jno = 0x1,
    Jb = 0x2,
    Jae = 0x3,
    Je = 0x4,
    Jne = 0x5,
    Jbe = 0x6,
    Ja = 0x7,
    Js = 0x8,
    Jns = 0x9,
    Jp = 0xA,
    Jnp = 0xB,
    Jl = 0xC,
    Jge = 0xD,
    Jle = 0xE,
    Jg = 0xF,
}

impl X86Cond {
    /// Return the inverted condition (conditions pair up on the low bit).
    pub fn invert(self) -> Self {
        use X86Cond::*;
        match self {
            Jo => Jno,
            Jno => Jo,
            Jb => Jae,
            Jae => Jb,
            Je => Jne,
            Jne => Je,
            Jbe => Ja,
            Ja => Jbe,
            Js => Jns,
            Jns => Js,
            Jp => Jnp,
            Jnp => Jp,
            Jl => Jge,
            Jge => Jl,
            Jle => Jg,
            Jg => Jle,
        }
    }
}

#[inline]
fn rexw_flag(rexw: bool) -> u32 {
    if rexw {
        P_REXW
    } else {
        0
    }
}

/// Emit REX prefix, escape byte and opcode. `r`, `index` and `rm` are
/// raw register numbers (0-15); pass 0 for unused fields.
fn emit_rex_opc(buf: &mut CodeBuffer, opc: u32, r: u8, index: u8, rm: u8) {
    let mut rex: u8 = 0;
    if opc & P_REXW != 0 {
        rex |= 0x08;
    }
    if r >= 8 {
        rex |= 0x04;
    }
    if index >= 8 {
        rex |= 0x02;
    }
    if rm >= 8 {
        rex |= 0x01;
    }
    if rex != 0 {
        buf.emit_u8(0x40 | rex);
    }
    if opc & P_EXT != 0 {
        buf.emit_u8(0x0F);
    }
    buf.emit_u8(opc as u8);
}

/// Emit opcode with REX prefix.
pub fn emit_opc(buf: &mut CodeBuffer, opc: u32, r: u8, rm: u8) {
    emit_rex_opc(buf, opc, r, 0, rm);
}

/// Emit opcode + ModR/M for a register-register operation.
pub fn emit_modrm(buf: &mut CodeBuffer, opc: u32, r: Reg, rm: Reg) {
    emit_opc(buf, opc, r as u8, rm as u8);
    buf.emit_u8(0xC0 | (r.low3() << 3) | rm.low3());
}

/// Emit opcode + ModR/M with an /r extension on a register operand.
pub fn emit_modrm_ext(buf: &mut CodeBuffer, opc: u32, ext: u8, rm: Reg) {
    emit_opc(buf, opc, ext, rm as u8);
    buf.emit_u8(0xC0 | (ext << 3) | rm.low3());
}

/// ModR/M (+SIB) + displacement for `[base + offset]`. `r3` is the
/// already-truncated reg field. RBP/R13 need an explicit disp8, RSP/R12
/// need a SIB byte.
fn emit_mem_operand(buf: &mut CodeBuffer, r3: u8, base: Reg, offset: i32) {
    let b3 = base.low3();
    if offset == 0 && b3 != 5 {
        buf.emit_u8((r3 << 3) | b3);
        if b3 == 4 {
            buf.emit_u8(0x24);
        }
    } else if (-128..=127).contains(&offset) {
        buf.emit_u8(0x40 | (r3 << 3) | b3);
        if b3 == 4 {
            buf.emit_u8(0x24);
        }
        buf.emit_u8(offset as u8);
    } else {
        buf.emit_u8(0x80 | (r3 << 3) | b3);
        if b3 == 4 {
            buf.emit_u8(0x24);
        }
        buf.emit_u32(offset as u32);
    }
}

/// Emit opcode + ModR/M + displacement for `[base + offset]`.
pub fn emit_modrm_offset(buf: &mut CodeBuffer, opc: u32, r: Reg, base: Reg, offset: i32) {
    emit_opc(buf, opc, r as u8, base as u8);
    emit_mem_operand(buf, r.low3(), base, offset);
}

/// Emit opcode + ModR/M with an /r extension for `[base + offset]`.
pub fn emit_modrm_ext_offset(buf: &mut CodeBuffer, opc: u32, ext: u8, base: Reg, offset: i32) {
    emit_opc(buf, opc, ext, base as u8);
    emit_mem_operand(buf, ext, base, offset);
}

/// Emit opcode + ModR/M + SIB for `[base + index*(1<<shift) + offset]`.
pub fn emit_modrm_sib(
    buf: &mut CodeBuffer,
    opc: u32,
    r: Reg,
    base: Reg,
    index: Reg,
    shift: u8,
    offset: i32,
) {
    assert!(index != Reg::Rsp, "rsp cannot be an index register");
    emit_rex_opc(buf, opc, r as u8, index as u8, base as u8);

    let r3 = r.low3();
    let sib = (shift << 6) | (index.low3() << 3) | base.low3();
    if offset == 0 && base.low3() != 5 {
        buf.emit_u8((r3 << 3) | 0x04);
        buf.emit_u8(sib);
    } else if (-128..=127).contains(&offset) {
        buf.emit_u8(0x44 | (r3 << 3));
        buf.emit_u8(sib);
        buf.emit_u8(offset as u8);
    } else {
        buf.emit_u8(0x84 | (r3 << 3));
        buf.emit_u8(sib);
        buf.emit_u32(offset as u32);
    }
}

// -- Arithmetic --

/// Emit `op dst, imm` (auto-selects imm8 vs imm32).
pub fn emit_arith_ri(buf: &mut CodeBuffer, op: ArithOp, rexw: bool, dst: Reg, imm: i32) {
    let w = rexw_flag(rexw);
    if (-128..=127).contains(&imm) {
        emit_modrm_ext(buf, OPC_ARITH_EvIb | w, op as u8, dst);
        buf.emit_u8(imm as u8);
    } else {
        emit_modrm_ext(buf, OPC_ARITH_EvIz | w, op as u8, dst);
        buf.emit_u32(imm as u32);
    }
}

/// Emit `op dst, [base+offset]` (load-op).
pub fn emit_arith_rm(
    buf: &mut CodeBuffer,
    op: ArithOp,
    rexw: bool,
    dst: Reg,
    base: Reg,
    offset: i32,
) {
    let opc = (OPC_ARITH_GvEv + ((op as u32) << 3)) | rexw_flag(rexw);
    emit_modrm_offset(buf, opc, dst, base, offset);
}

/// Emit `op dword [base+offset], src` (store-op).
pub fn emit_arith_mr(
    buf: &mut CodeBuffer,
    op: ArithOp,
    rexw: bool,
    base: Reg,
    offset: i32,
    src: Reg,
) {
    let opc = (0x01 + ((op as u32) << 3)) | rexw_flag(rexw);
    emit_modrm_offset(buf, opc, src, base, offset);
}

/// Emit `op dword [base+offset], imm`.
pub fn emit_arith_mi(
    buf: &mut CodeBuffer,
    op: ArithOp,
    rexw: bool,
    base: Reg,
    offset: i32,
    imm: i32,
) {
    let w = rexw_flag(rexw);
    if (-128..=127).contains(&imm) {
        emit_modrm_ext_offset(buf, OPC_ARITH_EvIb | w, op as u8, base, offset);
        buf.emit_u8(imm as u8);
    } else {
        emit_modrm_ext_offset(buf, OPC_ARITH_EvIz | w, op as u8, base, offset);
        buf.emit_u32(imm as u32);
    }
}

/// Emit `shift dst, imm8`.
pub fn emit_shift_ri(buf: &mut CodeBuffer, op: ShiftOp, rexw: bool, dst: Reg, imm: u8) {
    let w = rexw_flag(rexw);
    if imm == 1 {
        emit_modrm_ext(buf, OPC_SHIFT_1 | w, op as u8, dst);
    } else {
        emit_modrm_ext(buf, OPC_SHIFT_Ib | w, op as u8, dst);
        buf.emit_u8(imm);
    }
}

/// Emit three-operand IMUL: `dst = src * imm`.
pub fn emit_imul_ri(buf: &mut CodeBuffer, rexw: bool, dst: Reg, src: Reg, imm: i32) {
    let w = rexw_flag(rexw);
    if (-128..=127).contains(&imm) {
        emit_modrm(buf, OPC_IMUL_GvEvIb | w, dst, src);
        buf.emit_u8(imm as u8);
    } else {
        emit_modrm(buf, OPC_IMUL_GvEvIz | w, dst, src);
        buf.emit_u32(imm as u32);
    }
}

/// Emit `test r1, r2`.
pub fn emit_test_rr(buf: &mut CodeBuffer, rexw: bool, r1: Reg, r2: Reg) {
    emit_modrm(buf, OPC_TESTL | rexw_flag(rexw), r1, r2);
}

// -- Data movement --

/// Emit `mov dst, src` (32-bit or 64-bit).
pub fn emit_mov_rr(buf: &mut CodeBuffer, rexw: bool, dst: Reg, src: Reg) {
    emit_modrm(buf, OPC_MOVL_EvGv | rexw_flag(rexw), src, dst);
}

/// Emit `mov reg, imm` using the shortest encoding.
pub fn emit_mov_ri(buf: &mut CodeBuffer, rexw: bool, reg: Reg, val: u64) {
    if val == 0 {
        // xor r32, r32
        emit_modrm(buf, 0x31, reg, reg);
    } else if !rexw || val <= u32::MAX as u64 {
        emit_opc(buf, OPC_MOVL_Iv + (reg.low3() as u32), 0, reg as u8);
        buf.emit_u32(val as u32);
    } else if val as i64 >= i32::MIN as i64 && val as i64 <= i32::MAX as i64 {
        emit_modrm_ext(buf, OPC_MOVL_EvIz | P_REXW, 0, reg);
        buf.emit_u32(val as u32);
    } else {
        emit_movabs(buf, reg, val);
    }
}

/// Emit the 10-byte `movabs reg, imm64` form unconditionally.
pub fn emit_movabs(buf: &mut CodeBuffer, reg: Reg, val: u64) {
    emit_opc(buf, (OPC_MOVL_Iv + (reg.low3() as u32)) | P_REXW, 0, reg as u8);
    buf.emit_u64(val);
}

/// Emit `movabs reg, 0` and reserve the immediate for an absolute patch.
/// Returns the arena offset of the immediate.
pub fn emit_movabs_fixup(buf: &mut CodeBuffer, reg: Reg) -> usize {
    emit_opc(buf, (OPC_MOVL_Iv + (reg.low3() as u32)) | P_REXW, 0, reg as u8);
    buf.reserve_abs64()
}

/// Emit `mov dst, [base+offset]`.
pub fn emit_load(buf: &mut CodeBuffer, rexw: bool, dst: Reg, base: Reg, offset: i32) {
    emit_modrm_offset(buf, OPC_MOVL_GvEv | rexw_flag(rexw), dst, base, offset);
}

/// Emit `mov [base+offset], src`.
pub fn emit_store(buf: &mut CodeBuffer, rexw: bool, src: Reg, base: Reg, offset: i32) {
    emit_modrm_offset(buf, OPC_MOVL_EvGv | rexw_flag(rexw), src, base, offset);
}

/// Emit `mov [base+offset], imm32`.
pub fn emit_store_imm(buf: &mut CodeBuffer, rexw: bool, base: Reg, offset: i32, imm: i32) {
    emit_modrm_ext_offset(buf, OPC_MOVL_EvIz | rexw_flag(rexw), 0, base, offset);
    buf.emit_u32(imm as u32);
}

/// Emit `mov dst, [base + index*(1<<shift) + offset]`.
pub fn emit_load_sib(
    buf: &mut CodeBuffer,
    rexw: bool,
    dst: Reg,
    base: Reg,
    index: Reg,
    shift: u8,
    offset: i32,
) {
    emit_modrm_sib(
        buf,
        OPC_MOVL_GvEv | rexw_flag(rexw),
        dst,
        base,
        index,
        shift,
        offset,
    );
}

/// Emit `xchg r1, r2`.
pub fn emit_xchg(buf: &mut CodeBuffer, rexw: bool, r1: Reg, r2: Reg) {
    emit_modrm(buf, OPC_XCHG_EvGv | rexw_flag(rexw), r1, r2);
}

// -- Branches --

/// Emit `jcc rel32` with a reserved displacement. Returns the fixup offset.
pub fn emit_jcc_fixup(buf: &mut CodeBuffer, cond: X86Cond) -> usize {
    emit_opc(buf, OPC_JCC_long + (cond as u32), 0, 0);
    buf.reserve_rel32()
}

/// Emit `jmp rel32` with a reserved displacement. Returns the fixup offset.
pub fn emit_jmp_fixup(buf: &mut CodeBuffer) -> usize {
    buf.emit_u8(OPC_JMP_long as u8);
    buf.reserve_rel32()
}

/// Emit `jmp rel32` to an already emitted arena offset.
pub fn emit_jmp(buf: &mut CodeBuffer, target_offset: usize) {
    buf.emit_u8(OPC_JMP_long as u8);
    let after = buf.offset() + 4;
    let disp = target_offset as i64 - after as i64;
    buf.emit_u32(disp as i32 as u32);
}

/// Emit indirect `jmp reg`.
pub fn emit_jmp_reg(buf: &mut CodeBuffer, reg: Reg) {
    emit_modrm_ext(buf, OPC_GRP5, Ext5Op::JmpN as u8, reg);
}

/// Emit indirect `call reg`.
pub fn emit_call_reg(buf: &mut CodeBuffer, reg: Reg) {
    emit_modrm_ext(buf, OPC_GRP5, Ext5Op::CallN as u8, reg);
}

/// Emit indirect `call [base+offset]`.
pub fn emit_call_mem(buf: &mut CodeBuffer, base: Reg, offset: i32) {
    emit_modrm_ext_offset(buf, OPC_GRP5, Ext5Op::CallN as u8, base, offset);
}

// -- Stack --

/// Emit `push reg`.
pub fn emit_push(buf: &mut CodeBuffer, reg: Reg) {
    emit_opc(buf, OPC_PUSH_r32 + (reg.low3() as u32), 0, reg as u8);
}

/// Emit `pop reg`.
pub fn emit_pop(buf: &mut CodeBuffer, reg: Reg) {
    emit_opc(buf, OPC_POP_r32 + (reg.low3() as u32), 0, reg as u8);
}

/// Emit `push imm` (sign-extended to 64 bits).
pub fn emit_push_imm(buf: &mut CodeBuffer, imm: i32) {
    if (-128..=127).contains(&imm) {
        buf.emit_u8(OPC_PUSH_Ib as u8);
        buf.emit_u8(imm as u8);
    } else {
        buf.emit_u8(OPC_PUSH_Iz as u8);
        buf.emit_u32(imm as u32);
    }
}

/// Emit `ret`.
pub fn emit_ret(buf: &mut CodeBuffer) {
    buf.emit_u8(OPC_RET as u8);
}
