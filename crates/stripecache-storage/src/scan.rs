//! Parallel cache scan
//!
//! One thread per span. Each thread loads the metadata and directory of
//! its own stripes and reads the fragment behind every valid head entry;
//! spans share nothing, so no locking is involved.

use crate::dir::dir_mask_tag;
use crate::layout::DOC_MAGIC;
use crate::raw_io::{Access, Device};
use crate::span::Span;
use crate::stripe::{LoadOutcome, ProbeHit, Stripe};
use crate::volume::StripeRef;
use serde::Serialize;
use std::thread;
use stripecache_common::Result;
use tracing::{debug, info, warn};

/// What a scan found in one stripe
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub span: usize,
    pub stripe: usize,
    pub name: String,
    /// Valid directory entries
    pub entries: u64,
    /// Head fragments read back with matching preamble and key
    pub docs_ok: u64,
    /// Head fragments that failed to read or did not match their entry
    pub docs_bad: u64,
    /// Object bytes in good fragments
    pub bytes: u64,
    /// Set when the stripe could not be scanned at all
    pub error: Option<String>,
}

impl ScanReport {
    #[must_use]
    pub const fn stripe_ref(&self) -> StripeRef {
        StripeRef {
            span: self.span,
            stripe: self.stripe,
        }
    }
}

/// Scan all spans, one thread each. Reports come back in span order.
pub fn scan_spans<A: Access>(spans: &mut [Span<A>]) -> Vec<ScanReport> {
    thread::scope(|scope| {
        let handles: Vec<_> = spans
            .iter_mut()
            .enumerate()
            .map(|(i, span)| scope.spawn(move || scan_span(i, span)))
            .collect();
        handles
            .into_iter()
            .enumerate()
            .flat_map(|(i, h)| {
                h.join().unwrap_or_else(|_| {
                    warn!(span = i, "scan thread panicked");
                    vec![ScanReport {
                        span: i,
                        error: Some("scan thread panicked".to_owned()),
                        ..ScanReport::default()
                    }]
                })
            })
            .collect()
    })
}

/// Scan the in-use stripes of one span
pub fn scan_span<A: Access>(idx: usize, span: &mut Span<A>) -> Vec<ScanReport> {
    let (dev, stripes) = span.parts_mut();
    let reports: Vec<_> = stripes
        .iter_mut()
        .enumerate()
        .filter(|(_, s)| !s.is_free())
        .map(|(i, stripe)| {
            let mut report = ScanReport {
                span: idx,
                stripe: i,
                name: stripe.hash_text().to_owned(),
                ..ScanReport::default()
            };
            if let Err(e) = scan_stripe(dev, stripe, &mut report) {
                warn!(stripe = %report.name, error = %e, "stripe scan failed");
                report.error = Some(e.to_string());
            }
            report
        })
        .collect();
    info!(span = idx, stripes = reports.len(), "span scanned");
    reports
}

fn scan_stripe<A: Access>(dev: &Device<A>, stripe: &mut Stripe, report: &mut ScanReport) -> Result<()> {
    if stripe.load_meta(dev)? == LoadOutcome::Uninitialized {
        report.error = Some("not initialized".to_owned());
        return Ok(());
    }
    stripe.load_dir(dev)?;

    let stripe = &*stripe;
    let Some(dir) = stripe.directory() else {
        return Ok(());
    };
    for location in dir.live_entries(stripe.cursor()) {
        report.entries += 1;
        if !location.entry.head() {
            continue;
        }
        let hit = ProbeHit {
            location,
            offset: stripe.fragment_offset(&location.entry),
            size: location.entry.approx_size(),
        };
        match stripe.read_fragment(dev, &hit) {
            Ok(fragment)
                if fragment.doc.magic == DOC_MAGIC
                    && dir_mask_tag(fragment.doc.first_key.slice32(2)) == location.entry.tag() =>
            {
                report.docs_ok += 1;
                report.bytes += fragment.doc.data_len() as u64;
            }
            Ok(fragment) => {
                debug!(
                    stripe = %report.name,
                    offset = hit.offset,
                    magic = fragment.doc.magic,
                    "fragment does not match its entry"
                );
                report.docs_bad += 1;
            }
            Err(e) => {
                debug!(stripe = %report.name, offset = hit.offset, error = %e, "fragment unreadable");
                report.docs_bad += 1;
            }
        }
    }
    Ok(())
}
