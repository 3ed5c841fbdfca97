pub mod emitter;
pub mod regs;

pub use emitter::X86Cond;
pub use regs::{Reg, RegSet};
