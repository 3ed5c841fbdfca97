//! Block compilation, the translation cache and the dispatch loop.
//!
//! The guest layer plugs in through [`GuestTranslator`]; everything
//! host-specific lives in `xlat_backend`.

pub mod block;
pub mod cache;
pub mod compiler;
pub mod exec_loop;
pub mod icache;

pub use block::{execute_entry, BlockFn, TranslatedBlock};
pub use cache::TranslationCache;
pub use compiler::{BlockCompiler, BlockContext};
pub use exec_loop::{run_slice, SliceExit};
pub use icache::IcacheSlots;

use xlat_backend::Helper;

/// Whether the block continues after an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsnFlow {
    Continue,
    /// End the block after this instruction (an implicit exit to the
    /// following address is added if none was emitted).
    Stop,
}

/// Guest ISA layer consumed by the block compiler.
pub trait GuestTranslator {
    /// Instruction width in bytes; a power of two.
    fn insn_width(&self) -> u32;

    /// Cycles charged per instruction.
    fn cycle_period(&self) -> u32;

    /// `fn(ctx, code)` delivering a guest exception at the PC held in
    /// the register file: saves that PC in `spc` and moves `pc` to the
    /// handler.
    fn raise_exception(&self) -> Helper;

    /// Address-translation-aware block resolver, when translation is
    /// enabled for the code being compiled.
    fn resolve_virtual(&self) -> Option<Helper> {
        None
    }

    /// Emit host code for the instruction at `pc`.
    fn translate_insn(&mut self, ctx: &mut BlockContext<'_>, pc: u32) -> InsnFlow;
}
