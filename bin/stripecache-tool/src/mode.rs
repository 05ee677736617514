//! Read-only versus read-write command behavior

use std::path::Path;
use stripecache_common::{Diagnostics, Result};
use stripecache_storage::{Access, Cache, ReadOnly, ReadWrite, StripeRef};

const NOT_WRITING: &str = "writing not enabled, nothing was saved (use --write)";

/// Commands whose effect depends on whether the spans are writable
pub trait Mode: Access + Sized {
    fn allocate_empty_spans(cache: &mut Cache<Self>) -> Diagnostics;
    fn init_span(cache: &mut Cache<Self>, path: &Path) -> Result<Diagnostics>;
    fn clear_spans(cache: &mut Cache<Self>, device: Option<&Path>) -> Result<Diagnostics>;
    /// Save repaired directories
    fn persist(cache: &mut Cache<Self>, stripes: &[StripeRef]) -> Diagnostics;
}

impl Mode for ReadOnly {
    fn allocate_empty_spans(cache: &mut Cache<Self>) -> Diagnostics {
        let (_, mut diags) = cache.fill_empty_spans();
        diags.info(NOT_WRITING);
        diags
    }

    fn init_span(cache: &mut Cache<Self>, path: &Path) -> Result<Diagnostics> {
        let (_, mut diags) = cache.allocate_span(path)?;
        diags.info(NOT_WRITING);
        Ok(diags)
    }

    fn clear_spans(_cache: &mut Cache<Self>, _device: Option<&Path>) -> Result<Diagnostics> {
        let mut diags = Diagnostics::new();
        diags.info(NOT_WRITING);
        Ok(diags)
    }

    fn persist(_cache: &mut Cache<Self>, stripes: &[StripeRef]) -> Diagnostics {
        let mut diags = Diagnostics::new();
        diags.info(format!("{} stripes repaired in memory; {NOT_WRITING}", stripes.len()));
        diags
    }
}

impl Mode for ReadWrite {
    fn allocate_empty_spans(cache: &mut Cache<Self>) -> Diagnostics {
        cache.allocate_empty_spans()
    }

    fn init_span(cache: &mut Cache<Self>, path: &Path) -> Result<Diagnostics> {
        cache.init_span(path)
    }

    fn clear_spans(cache: &mut Cache<Self>, device: Option<&Path>) -> Result<Diagnostics> {
        cache.clear_spans(device)
    }

    fn persist(cache: &mut Cache<Self>, stripes: &[StripeRef]) -> Diagnostics {
        cache.sync_stripes(stripes)
    }
}
