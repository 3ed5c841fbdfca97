//! A tiny 16-bit guest ISA for driving the compiler.
//!
//! ```text
//! 0000  NOP
//! 1rii  ADDI  r, #ii        r += sext(ii)
//! 2rii  CHK   r, #ii        guest exception EXC_CHECK if r > ii (unsigned)
//! 3r00  HCALL r             helper raises EXC_HCALL itself if r != 0
//! 4ddd  BRA   disp12        pc = next + sext(ddd) * 2
//! 5r00  JMP   r             pc = r
//! 6r00  JMPD  r             new_pc = r; pc = new_pc
//! 7.ii  TRAPA #ii           guest exception ii << 2
//! 8rdd  BNEZ  r, disp8      if r != 0: pc = next + sext(dd) * 2
//! 9000  PROBE               record the guest PC recovered from the host stack
//! F000  END                 end the block
//! ```
//! Anything else raises EXC_ILLEGAL.

use std::collections::HashMap;
use std::ptr;
use std::sync::Arc;

use xlat_backend::x86_64::emitter::{emit_arith_mi, ArithOp};
use xlat_backend::{CallArg, CallTarget, Exit, Helper, NativePcResolver, Reg, X86Cond};
use xlat_core::{GuestRegs, NativePcStrategy, Result};
use xlat_exec::{run_slice, BlockCompiler, BlockContext, GuestTranslator, InsnFlow, SliceExit, TranslationCache};

pub const INSN_WIDTH: u32 = 2;
pub const EXC_CHECK: u32 = 0xE0;
pub const EXC_HCALL: u32 = 0x1C0;
pub const EXC_ILLEGAL: u32 = 0x180;
/// Exception handler address.
pub const VBR: u32 = 0x8000;

pub const NOP: u16 = 0x0000;
pub const END: u16 = 0xF000;
pub const PROBE: u16 = 0x9000;

pub const fn addi(r: u16, imm: i8) -> u16 {
    0x1000 | (r << 8) | (imm as u8 as u16)
}

pub const fn chk(r: u16, imm: u8) -> u16 {
    0x2000 | (r << 8) | imm as u16
}

pub const fn hcall(r: u16) -> u16 {
    0x3000 | (r << 8)
}

pub const fn bra(disp: i16) -> u16 {
    0x4000 | (disp as u16 & 0x0FFF)
}

pub const fn jmp(r: u16) -> u16 {
    0x5000 | (r << 8)
}

pub const fn jmpd(r: u16) -> u16 {
    0x6000 | (r << 8)
}

pub const fn trapa(imm: u8) -> u16 {
    0x7000 | imm as u16
}

pub const fn bnez(r: u16, disp: i8) -> u16 {
    0x8000 | (r << 8) | (disp as u8 as u16)
}

/// One delivered guest exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Raised {
    pub code: u32,
    /// Guest PC in the register file when the exception was raised.
    pub pc: u32,
    pub cycles: u32,
}

/// State reachable from helpers through their context pointer.
pub struct Machine {
    pub regs: GuestRegs,
    pub raised: Vec<Raised>,
    pub sampled_pcs: Vec<Option<u32>>,
    pub virtual_lookups: u32,
    cache: *const TranslationCache,
    resolver: NativePcResolver,
}

pub struct TestGuest {
    mem: HashMap<u32, u16>,
    pub machine: Box<Machine>,
    pub period: u32,
    /// Compile exits against the address-translating resolver.
    pub mmu: bool,
    pub blocks_translated: u32,
}

impl TestGuest {
    pub fn new(cache: &Arc<TranslationCache>) -> Self {
        Self {
            mem: HashMap::new(),
            machine: Box::new(Machine {
                regs: GuestRegs::default(),
                raised: Vec::new(),
                sampled_pcs: Vec::new(),
                virtual_lookups: 0,
                cache: Arc::as_ptr(cache),
                resolver: NativePcResolver::new(NativePcStrategy::Unwind),
            }),
            period: 1,
            mmu: false,
            blocks_translated: 0,
        }
    }

    pub fn load(&mut self, addr: u32, insns: &[u16]) -> &mut Self {
        for (i, &insn) in insns.iter().enumerate() {
            self.mem.insert(addr + i as u32 * INSN_WIDTH, insn);
        }
        self
    }

    pub fn regs(&mut self) -> &mut GuestRegs {
        &mut self.machine.regs
    }

    pub fn regs_ptr(&mut self) -> *mut GuestRegs {
        ptr::addr_of_mut!(self.machine.regs)
    }

    fn machine_ptr(&mut self) -> u64 {
        ptr::addr_of_mut!(*self.machine) as u64
    }

    fn fetch(&self, pc: u32) -> u16 {
        self.mem.get(&pc).copied().unwrap_or(NOP)
    }

    /// Run one time slice.
    pub fn run(&mut self, compiler: &mut BlockCompiler, budget: u32) -> Result<SliceExit> {
        let regs = self.regs_ptr();
        unsafe { run_slice(compiler, self, regs, budget) }
    }
}

fn sext(value: u16, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value as i32) << shift) >> shift
}

impl GuestTranslator for TestGuest {
    fn insn_width(&self) -> u32 {
        INSN_WIDTH
    }

    fn cycle_period(&self) -> u32 {
        self.period
    }

    fn raise_exception(&self) -> Helper {
        Helper::new(raise as *const () as usize, &*self.machine as *const Machine as usize)
    }

    fn resolve_virtual(&self) -> Option<Helper> {
        self.mmu.then(|| {
            Helper::new(
                resolve_virtual as *const () as usize,
                &*self.machine as *const Machine as usize,
            )
        })
    }

    fn translate_insn(&mut self, ctx: &mut BlockContext<'_>, pc: u32) -> InsnFlow {
        if ctx.icount() == 0 {
            self.blocks_translated += 1;
        }
        let insn = self.fetch(pc);
        let r = ((insn >> 8) & 0xF) as usize;
        let imm = (insn & 0xFF) as u8;
        let next = pc.wrapping_add(INSN_WIDTH);
        let plan = ctx.plan();

        match insn >> 12 {
            0x0 => {}
            0x1 => plan.add_imm(ctx.buf(), plan.gpr(r), imm as i8 as i32),
            0x2 => {
                let slot = plan.gpr(r);
                emit_arith_mi(ctx.buf(), ArithOp::Cmp, false, slot.base, slot.disp, imm as i32);
                ctx.guard(X86Cond::Ja, EXC_CHECK);
            }
            0x3 => {
                let m = self.machine_ptr();
                ctx.call_exc(
                    CallTarget::Abs(hcall_helper as *const () as usize),
                    &[CallArg::Imm(m), plan.gpr(r).as_arg()],
                );
            }
            0x4 => {
                let target = next.wrapping_add((sext(insn & 0x0FFF, 12) * 2) as u32);
                ctx.exit(Exit::Abs { pc: target, endpc: next });
            }
            0x5 => {
                plan.load(ctx.buf(), Reg::Rax, plan.gpr(r));
                plan.store(ctx.buf(), Reg::Rax, plan.pc);
                ctx.exit(Exit::PcSet { endpc: next });
            }
            0x6 => {
                plan.load(ctx.buf(), Reg::Rax, plan.gpr(r));
                plan.store(ctx.buf(), Reg::Rax, plan.new_pc);
                ctx.exit(Exit::NewPcSet { endpc: next });
            }
            0x7 => ctx.exit(Exit::Exception {
                code: (imm as u32) << 2,
                pc,
            }),
            0x8 => {
                let slot = plan.gpr(r);
                emit_arith_mi(ctx.buf(), ArithOp::Cmp, false, slot.base, slot.disp, 0);
                let target = next.wrapping_add((imm as i8 as i32 * 2) as u32);
                ctx.exit_if(X86Cond::Jne, Exit::Abs { pc: target, endpc: next });
            }
            0x9 => {
                let m = self.machine_ptr();
                ctx.call_helper(Helper::new(sample_pc as *const () as usize, m as usize), None);
            }
            0xF => return InsnFlow::Stop,
            _ => ctx.exit(Exit::Exception {
                code: EXC_ILLEGAL,
                pc,
            }),
        }
        InsnFlow::Continue
    }
}

extern "C" fn raise(m: *mut Machine, code: u32) {
    let m = unsafe { &mut *m };
    m.raised.push(Raised {
        code,
        pc: m.regs.pc,
        cycles: m.regs.slice_cycle,
    });
    m.regs.spc = m.regs.pc;
    m.regs.pc = VBR;
}

extern "C" fn hcall_helper(m: *mut Machine, value: u32, recovery: *const u8) -> *const u8 {
    if value == 0 {
        return ptr::null();
    }
    raise(m, EXC_HCALL);
    recovery
}

extern "C" fn resolve_virtual(m: *mut Machine, pc: u32) -> *const u8 {
    let m = unsafe { &mut *m };
    m.virtual_lookups += 1;
    unsafe { &*m.cache }.lookup_entry(pc)
}

#[inline(never)]
extern "C" fn sample_pc(m: *mut Machine) {
    let m = unsafe { &mut *m };
    let cache = unsafe { &*m.cache };
    let pc = cache
        .current_guest_pc(&m.resolver, ptr::addr_of!(m.regs))
        .ok();
    m.sampled_pcs.push(pc);
}
