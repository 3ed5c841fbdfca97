use crate::error::{Result, XlatError};

/// How a host instruction pointer inside generated code is recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NativePcStrategy {
    /// Walk unwind metadata outward from the current frame.
    #[default]
    Unwind,
    /// Walk the saved frame-pointer chain looking for the register-file
    /// base sentinel. Requires helpers built with frame pointers.
    FrameScan,
}

/// Runtime configuration for one translation engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XlatConfig {
    /// Maximum bytes of host code for one block, trampolines included.
    pub code_capacity: usize,
    /// Guest instruction cap per block.
    pub max_block_insns: u32,
    /// Guest base address of the resident ICache window.
    pub icache_base: u32,
    /// Size in bytes of the ICache window (0 disables direct lookup).
    pub icache_size: u32,
    pub native_pc_strategy: NativePcStrategy,
    /// Total host-code bytes the translation cache may hold before a
    /// compile is refused and the cache must be flushed.
    pub cache_capacity: usize,
}

/// Default per-block arena size.
pub const DEFAULT_CODE_CAPACITY: usize = 64 * 1024;
/// Default instruction cap per block.
pub const DEFAULT_MAX_BLOCK_INSNS: u32 = 512;
/// Default translation cache budget: 16 MiB.
pub const DEFAULT_CACHE_CAPACITY: usize = 16 * 1024 * 1024;

impl Default for XlatConfig {
    fn default() -> Self {
        Self {
            code_capacity: DEFAULT_CODE_CAPACITY,
            max_block_insns: DEFAULT_MAX_BLOCK_INSNS,
            icache_base: 0,
            icache_size: 0x1_0000,
            native_pc_strategy: NativePcStrategy::default(),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl XlatConfig {
    pub fn with_code_capacity(mut self, bytes: usize) -> Self {
        self.code_capacity = bytes;
        self
    }

    pub fn with_max_block_insns(mut self, n: u32) -> Self {
        self.max_block_insns = n;
        self
    }

    pub fn with_icache_window(mut self, base: u32, size: u32) -> Self {
        self.icache_base = base;
        self.icache_size = size;
        self
    }

    pub fn with_cache_capacity(mut self, bytes: usize) -> Self {
        self.cache_capacity = bytes;
        self
    }

    pub fn with_native_pc_strategy(mut self, strategy: NativePcStrategy) -> Self {
        self.native_pc_strategy = strategy;
        self
    }

    /// Reject configurations generated code cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.code_capacity < 256 {
            return Err(XlatError::InvalidConfig(format!(
                "code_capacity {} is below the 256-byte minimum",
                self.code_capacity
            )));
        }
        if self.max_block_insns == 0 {
            return Err(XlatError::InvalidConfig(
                "max_block_insns must be at least 1".into(),
            ));
        }
        if self.cache_capacity < self.code_capacity {
            return Err(XlatError::InvalidConfig(format!(
                "cache_capacity {} cannot hold one {}-byte block",
                self.cache_capacity, self.code_capacity
            )));
        }
        if self.icache_base.checked_add(self.icache_size).is_none() {
            return Err(XlatError::InvalidConfig(format!(
                "icache window {:#x}+{:#x} wraps the address space",
                self.icache_base, self.icache_size
            )));
        }
        Ok(())
    }
}
