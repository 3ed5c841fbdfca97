mod abi;
mod code_buffer;
#[cfg(all(target_arch = "x86_64", unix))]
mod exec_mem;
