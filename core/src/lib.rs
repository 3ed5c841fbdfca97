//! Shared types for the dynamic-translation runtime.
//!
//! Everything here is host-independent: the guest register-file layout
//! that generated code addresses through fixed offsets, the metadata a
//! compiled block carries around, configuration, and the error type.

pub mod block;
pub mod config;
pub mod error;
pub mod guest;

pub use block::{
    BackpatchSite, ExcCode, ExitDescriptor, FixupKind, PcSource, RecoveryRecord,
};
pub use config::{NativePcStrategy, XlatConfig};
pub use error::{Result, XlatError};
pub use guest::{GuestRegs, NUM_GPRS};
