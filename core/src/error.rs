use std::io;

use thiserror::Error;

/// Errors surfaced by compilation and recovery.
///
/// Guest faults tripped by guards never appear here: they are
/// delivered inside generated code as ordinary guest exceptions.
#[derive(Debug, Error)]
pub enum XlatError {
    /// The emission arena filled up mid-block. The partial code was
    /// discarded; retry after flushing the cache.
    #[error("code buffer exhausted compiling block at {pc:#010x} (capacity {capacity} bytes)")]
    CompileCapacityExceeded { pc: u32, capacity: usize },

    /// Mapping or protecting executable memory failed.
    #[error("executable memory: {0}")]
    ExecMap(#[from] io::Error),

    /// A host trap could not be attributed to any compiled block.
    /// `ip` is the candidate address, if the stack walk found one.
    #[error("host trap not inside translated code (candidate ip {ip:x?})")]
    NativePcNotFound { ip: Option<usize> },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, XlatError>;
