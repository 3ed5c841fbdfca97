//! x86-64 code generation for the translation runtime: the emission
//! arena, the host ABI bridge, block exits, fault-guard backpatching and
//! native-PC recovery.

pub mod abi;
pub mod backpatch;
pub mod binding;
pub mod code_buffer;
pub mod exec_mem;
pub mod exit;
pub mod native_pc;
pub mod x86_64;

pub use abi::{
    emit_epilogue, emit_prologue, AbiBridge, CallArg, CallSite, CallTarget, Helper, HostAbi,
    STACK, SYSV_AMD64, WIN64,
};
pub use backpatch::{BackpatchRegistry, FinalizedSites};
pub use binding::{RegisterBindingPlan, Slot, STANDARD_PLAN};
pub use code_buffer::{CodeBuffer, Relocation};
pub use exec_mem::ExecRegion;
pub use exit::{Exit, ExitGen, IcacheWindow};
pub use native_pc::{scan_frame_chain, NativePcResolver};
pub use x86_64::{Reg, RegSet, X86Cond};
