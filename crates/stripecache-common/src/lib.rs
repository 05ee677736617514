//! StripeCache Common - Shared types and utilities
//!
//! This crate provides the error and diagnostics types, block units,
//! content keys and parsed configuration records used across all
//! StripeCache components.

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod types;
pub mod units;

pub use config::{SpanConfig, ToolConfig, VolumeConfig, VolumeSize};
pub use diagnostics::{Diagnostic, Diagnostics, Severity};
pub use error::{Error, Result};
pub use types::*;
pub use units::{Blocks, CacheBlocks, StoreBlocks, StripeBlocks};
