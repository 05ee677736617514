//! Error types for StripeCache
//!
//! This module defines the common error types used throughout the system.
//! The variants follow the failure classes of the storage core: device,
//! format, consistency, structure and allocation errors.

use std::path::PathBuf;
use thiserror::Error;

/// Common result type for StripeCache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for StripeCache
#[derive(Debug, Error)]
pub enum Error {
    // Device errors
    #[error("device error on {path}: {context}: {source}")]
    Device {
        path: PathBuf,
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("short {op} on {path} at offset {offset}: {transferred} of {requested} bytes")]
    ShortTransfer {
        op: &'static str,
        path: PathBuf,
        offset: u64,
        requested: usize,
        transferred: usize,
    },

    #[error("misaligned I/O on {path}: offset {offset} size {size} alignment {alignment}")]
    Misaligned {
        path: PathBuf,
        offset: u64,
        size: usize,
        alignment: u64,
    },

    #[error("unsupported device {0}")]
    UnsupportedDevice(String),

    // Format errors
    #[error("format error: {0}")]
    Format(String),

    #[error("invalid magic for {what}: expected {expected:#010x}, found {found:#010x}")]
    BadMagic {
        what: &'static str,
        expected: u32,
        found: u32,
    },

    #[error("{what} truncated: need {need} bytes, have {have}")]
    Truncated {
        what: &'static str,
        need: usize,
        have: usize,
    },

    // Consistency errors
    #[error("no self-consistent metadata copy: A {a_head}:{a_foot} B {b_head}:{b_foot}")]
    NoValidCopy {
        a_head: u32,
        a_foot: u32,
        b_head: u32,
        b_foot: u32,
    },

    #[error("consistency error: {0}")]
    Consistency(String),

    // Structural errors
    #[error("cycle detected in segment {segment}: {chain}")]
    Cycle { segment: usize, chain: String },

    // Allocation errors
    #[error("failed to allocate stripe of {requested} - no free block large enough")]
    NoFreeStripe { requested: String },

    #[error("directory segment {segment} is full")]
    SegmentFull { segment: usize },

    #[error("stripe {stripe} has no room for {need} more bytes")]
    StripeFull { stripe: String, need: u64 },

    #[error("span {0} already initialized with a valid header")]
    AlreadyInitialized(String),

    #[error("span not found: {0}")]
    SpanNotFound(String),

    #[error("no stripes available for routing")]
    NoStripes,

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a device error with context
    pub fn device(path: impl Into<PathBuf>, context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Device {
            path: path.into(),
            context: context.into(),
            source,
        }
    }

    /// Create a format error
    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this is a device (I/O) failure
    #[must_use]
    pub const fn is_device(&self) -> bool {
        matches!(
            self,
            Self::Device { .. } | Self::ShortTransfer { .. } | Self::Misaligned { .. } | Self::UnsupportedDevice(_)
        )
    }

    /// Check if this error means on-disk data was not recognized
    #[must_use]
    pub const fn is_format(&self) -> bool {
        matches!(self, Self::Format(_) | Self::BadMagic { .. } | Self::Truncated { .. })
    }

    /// Check if this is an allocation failure
    #[must_use]
    pub const fn is_allocation(&self) -> bool {
        matches!(
            self,
            Self::NoFreeStripe { .. }
                | Self::SegmentFull { .. }
                | Self::StripeFull { .. }
                | Self::AlreadyInitialized(_)
        )
    }
}
