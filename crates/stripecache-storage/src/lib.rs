//! StripeCache Storage - On-disk cache core
//!
//! This crate implements the storage side of the cache:
//! - Positioned device I/O with read-only and read-write handles
//! - Bit-exact span header, stripe metadata, directory entry and Doc layouts
//! - The per-stripe directory hash table with freelist and chain repair
//! - Dual-copy (A/B) stripe metadata with crash-consistent sync
//! - Volumes and the proportional-share stripe allocator
//! - The cache aggregate, key routing and the parallel scan

pub mod cache;
pub mod dir;
pub mod layout;
pub mod raw_io;
pub mod scan;
pub mod span;
pub mod stripe;
pub mod volume;

// Re-exports
pub use cache::{Cache, Retrieval, StripeOutcome, StripeResult, url_key, url_port};
pub use dir::{DirCheckReport, DirEntry, DirLocation, Directory, WriteCursor};
pub use layout::{
    CACHE_BLOCK_SIZE, DOC_MAGIC, Doc, SPAN_HEADER_OFFSET, SPAN_MAGIC, STORE_BLOCK_SIZE,
    STRIPE_BLOCK_SIZE, STRIPE_META_MAGIC, SpanHeader, StripeDescriptor, StripeMeta,
};
pub use raw_io::{Access, AlignedBuffer, Device, DeviceOptions, Geometry, ReadOnly, ReadWrite};
pub use scan::{ScanReport, scan_spans};
pub use span::Span;
pub use stripe::{
    ChainReport, CopyId, DirGeometry, Fragment, FreelistReport, LoadOutcome, MetaCopy, MetaState,
    ProbeHit, Stripe,
};
pub use volume::{StripeRef, Volume, VolumeAllocator, VolumeMap, VolumeTarget};
