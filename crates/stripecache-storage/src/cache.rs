//! The cache aggregate
//!
//! A `Cache` owns every configured span, the volumes assembled from their
//! stripes and the global list of in-use stripes keys are routed over.
//! Commands that need to write take a `Cache<ReadWrite>`; the same
//! commands on a `Cache<ReadOnly>` run entirely in memory.

use crate::dir::DirCheckReport;
use crate::layout::DOC_MAGIC;
use crate::raw_io::{Access, Device, DeviceOptions, ReadOnly, ReadWrite};
use crate::scan::{ScanReport, scan_spans};
use crate::span::Span;
use crate::stripe::{ChainReport, CopyId, Fragment, FreelistReport, LoadOutcome, Stripe};
use crate::volume::{StripeRef, Volume, VolumeAllocator, VolumeMap, credited};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use stripecache_common::{CacheKey, Diagnostics, Error, Result, StoreBlocks, StripeBlocks, ToolConfig};
use stripecache_placement::{RouteTarget, StripeHashTable};
use tracing::{debug, error, info, warn};

/// Port a URL is fetched from: the explicit authority port, else the
/// scheme default
#[must_use]
pub fn url_port(url: &str) -> i32 {
    let (scheme, rest) = url.split_once("://").unwrap_or(("http", url));
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host = authority.rsplit_once('@').map_or(authority, |(_, host)| host);
    if let Some((_, port)) = host.rsplit_once(':')
        && let Ok(port) = port.parse::<u16>()
    {
        return i32::from(port);
    }
    if scheme.eq_ignore_ascii_case("https") { 443 } else { 80 }
}

/// Content key of a URL
#[must_use]
pub fn url_key(url: &str) -> CacheKey {
    CacheKey::for_url(url, url_port(url))
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

/// What happened to one stripe during a maintenance pass
#[derive(Debug)]
pub enum StripeOutcome<T> {
    Done(T),
    /// No metadata on disk
    Uninitialized,
    Failed(Error),
}

impl<T> StripeOutcome<T> {
    pub const fn done(&self) -> Option<&T> {
        match self {
            Self::Done(v) => Some(v),
            _ => None,
        }
    }
}

/// Per-stripe result of a maintenance pass
#[derive(Debug)]
pub struct StripeResult<T> {
    pub stripe: StripeRef,
    pub name: String,
    pub outcome: StripeOutcome<T>,
}

/// Result of fetching a URL's first fragment
#[derive(Debug)]
pub struct Retrieval {
    pub key: CacheKey,
    pub stripe: StripeRef,
    /// `None` on a directory miss
    pub fragment: Option<Fragment>,
}

/// All spans and volumes of one cache
#[derive(Debug)]
pub struct Cache<A: Access = ReadOnly> {
    config: ToolConfig,
    spans: Vec<Span<A>>,
    volumes: VolumeMap,
    /// In-use stripes in span order
    stripes: Vec<StripeRef>,
    routing: Option<StripeHashTable>,
}

impl<A: Access> Cache<A> {
    /// Open every configured span. A span that cannot be opened is
    /// reported as fatal and left out; the others still load.
    pub fn load(config: ToolConfig, options: DeviceOptions) -> (Self, Diagnostics) {
        let mut diags = Diagnostics::new();
        let mut spans = Vec::with_capacity(config.spans.len());
        for sc in &config.spans {
            match Span::<A>::open(sc, options, config.average_object_size) {
                Ok(span) => spans.push(span),
                Err(e) => {
                    error!(span = %sc.path.display(), error = %e, "failed to load span");
                    diags.fatal(format!("span {}: {e}", sc.path.display()));
                }
            }
        }
        let percent = config.total_percent();
        if percent > 100 {
            warn!(percent, "volume percentages exceed 100");
            diags.warn(format!("volume percentages add up to {percent}%, more than 100%"));
        }
        (Self::from_spans(config, spans), diags)
    }

    /// Assemble a cache from spans already loaded
    pub fn from_spans(config: ToolConfig, spans: Vec<Span<A>>) -> Self {
        let mut cache = Self {
            config,
            spans,
            volumes: VolumeMap::new(),
            stripes: Vec::new(),
            routing: None,
        };
        cache.rebuild_index();
        cache
    }

    pub const fn config(&self) -> &ToolConfig {
        &self.config
    }

    pub fn spans(&self) -> &[Span<A>] {
        &self.spans
    }

    pub fn span_mut(&mut self, idx: usize) -> Option<&mut Span<A>> {
        self.spans.get_mut(idx)
    }

    pub const fn volumes(&self) -> &VolumeMap {
        &self.volumes
    }

    /// The global list of in-use stripes
    pub fn stripes(&self) -> &[StripeRef] {
        &self.stripes
    }

    pub fn stripe(&self, r: StripeRef) -> Option<&Stripe> {
        self.spans.get(r.span)?.stripes().get(r.stripe)
    }

    /// Configured capacity in whole stripe blocks
    pub fn total_capacity(&self) -> StripeBlocks {
        credited(
            self.spans
                .iter()
                .map(Span::stripe_capacity)
                .fold(StoreBlocks::new(0), |acc, len| acc + len),
        )
    }

    fn rebuild_index(&mut self) {
        self.volumes.clear();
        self.stripes.clear();
        for (si, span) in self.spans.iter().enumerate() {
            for (i, stripe) in span.stripes().iter().enumerate() {
                if stripe.is_free() {
                    continue;
                }
                let r = StripeRef { span: si, stripe: i };
                self.stripes.push(r);
                self.volumes
                    .entry(stripe.vol_idx())
                    .or_insert_with(|| Volume::new(stripe.vol_idx()))
                    .add(r, stripe.len());
            }
        }

        let targets: Vec<_> = self
            .stripes
            .iter()
            .filter_map(|&r| self.stripe(r))
            .map(|s| RouteTarget::new(s.hash_id(), s.len()))
            .collect();
        self.routing = match StripeHashTable::build(&targets) {
            Ok(table) => Some(table),
            Err(e) => {
                debug!(error = %e, "no routing table");
                None
            }
        };
        debug!(
            spans = self.spans.len(),
            stripes = self.stripes.len(),
            volumes = self.volumes.len(),
            "cache index rebuilt"
        );
    }

    /// Spans matching `device`, or every span
    fn select_spans(&self, device: Option<&Path>) -> Result<Vec<usize>> {
        match device {
            None => Ok((0..self.spans.len()).collect()),
            Some(path) => self
                .spans
                .iter()
                .position(|s| s.path() == path)
                .map(|i| vec![i])
                .ok_or_else(|| Error::SpanNotFound(path.display().to_string())),
        }
    }

    fn allocator(&self) -> VolumeAllocator {
        VolumeAllocator::new(&self.config.volumes, self.total_capacity())
    }

    /// Allocate every span without stripes in use. Returns the spans that
    /// received stripes.
    pub fn fill_empty_spans(&mut self) -> (Vec<usize>, Diagnostics) {
        let mut alloc = self.allocator();
        alloc.load_sizes(&self.volumes);
        let mut diags = Diagnostics::new();
        let mut touched = Vec::new();
        for (i, span) in self.spans.iter_mut().enumerate() {
            if !span.is_empty() {
                debug!(span = %span.path().display(), "span in use, skipping");
                continue;
            }
            diags.merge(alloc.allocate_for(span));
            if !span.is_empty() {
                touched.push(i);
            }
        }
        self.rebuild_index();
        (touched, diags)
    }

    /// Discard every allocation and derive the layout from scratch, in
    /// memory only
    pub fn fill_all_spans(&mut self) -> (Vec<usize>, Diagnostics) {
        let mut alloc = self.allocator();
        alloc.clear_sizes();
        let mut diags = Diagnostics::new();
        let mut touched = Vec::new();
        for (i, span) in self.spans.iter_mut().enumerate() {
            span.clear();
            diags.merge(alloc.allocate_for(span));
            if !span.is_empty() {
                touched.push(i);
            }
        }
        self.rebuild_index();
        (touched, diags)
    }

    /// Allocate the uninitialized span at `path`, in memory only
    pub fn allocate_span(&mut self, path: &Path) -> Result<(usize, Diagnostics)> {
        let idx = self.select_spans(Some(path))?[0];
        let mut alloc = self.allocator();
        alloc.load_sizes(&self.volumes);
        let span = &mut self.spans[idx];
        if span.is_initialized() {
            return Err(Error::AlreadyInitialized(path.display().to_string()));
        }
        let diags = alloc.allocate_for(span);
        self.rebuild_index();
        Ok((idx, diags))
    }

    /// Run `f` on every loaded in-use stripe of the selected spans
    fn visit<T>(
        &mut self,
        device: Option<&Path>,
        with_dir: bool,
        mut f: impl FnMut(&Device<A>, &mut Stripe) -> Result<T>,
    ) -> Result<Vec<StripeResult<T>>> {
        let mut out = Vec::new();
        for si in self.select_spans(device)? {
            let (dev, stripes) = self.spans[si].parts_mut();
            for (i, stripe) in stripes.iter_mut().enumerate() {
                if stripe.is_free() {
                    continue;
                }
                let outcome = match stripe.load_meta(dev) {
                    Ok(LoadOutcome::Uninitialized) => StripeOutcome::Uninitialized,
                    Ok(LoadOutcome::Loaded(_)) => {
                        let loaded = if with_dir { stripe.load_dir(dev).map(|_| ()) } else { Ok(()) };
                        match loaded.and_then(|()| f(dev, stripe)) {
                            Ok(v) => StripeOutcome::Done(v),
                            Err(e) => StripeOutcome::Failed(e),
                        }
                    }
                    Err(e) => StripeOutcome::Failed(e),
                };
                if let StripeOutcome::Failed(e) = &outcome {
                    warn!(stripe = %stripe.hash_text(), error = %e, "stripe unusable");
                }
                out.push(StripeResult {
                    stripe: StripeRef { span: si, stripe: i },
                    name: stripe.hash_text().to_owned(),
                    outcome,
                });
            }
        }
        Ok(out)
    }

    /// Load the metadata copies of every in-use stripe
    pub fn load_meta(&mut self, device: Option<&Path>) -> Result<Vec<StripeResult<CopyId>>> {
        self.visit(device, false, |_, stripe| {
            stripe
                .active()
                .ok_or_else(|| Error::internal("loaded stripe has no active copy"))
        })
    }

    /// Read-only directory audit
    pub fn dir_check(&mut self, device: Option<&Path>) -> Result<Vec<StripeResult<DirCheckReport>>> {
        self.visit(device, true, |_, stripe| stripe.dir_check())
    }

    /// Detect and repair freelist loops, in memory
    pub fn check_freelists(&mut self, device: Option<&Path>) -> Result<Vec<StripeResult<FreelistReport>>> {
        self.visit(device, true, |_, stripe| stripe.check_freelists())
    }

    /// Clean every bucket chain, in memory
    pub fn walk_bucket_chains(&mut self, device: Option<&Path>) -> Result<Vec<StripeResult<ChainReport>>> {
        self.visit(device, true, |_, stripe| stripe.walk_bucket_chains())
    }

    /// Stripe a key is routed to
    pub fn key_to_stripe(&self, key: &CacheKey) -> Result<StripeRef> {
        let table = self.routing.as_ref().ok_or(Error::NoStripes)?;
        table
            .key_to_stripe(key)
            .and_then(|i| self.stripes.get(i).copied())
            .ok_or(Error::NoStripes)
    }

    /// Key of `url` and the stripe serving it
    pub fn find(&self, url: &str) -> Result<(CacheKey, StripeRef)> {
        let key = url_key(url);
        let r = self.key_to_stripe(&key)?;
        debug!(url, %key, span = r.span, stripe = r.stripe, "url routed");
        Ok((key, r))
    }

    /// Look `url` up in its stripe's directory and read the first fragment
    pub fn retrieve(&mut self, url: &str) -> Result<Retrieval> {
        let (key, r) = self.find(url)?;
        let (dev, stripes) = self.spans[r.span].parts_mut();
        let Some(stripe) = stripes.get_mut(r.stripe) else {
            return Err(Error::internal(format!("stripe index {} out of range", r.stripe)));
        };
        if stripe.load_meta(dev)? == LoadOutcome::Uninitialized {
            return Err(Error::Consistency(format!("stripe {} is not initialized", stripe.hash_text())));
        }
        stripe.load_dir(dev)?;

        let fragment = match stripe.probe(&key)? {
            None => None,
            Some(hit) => {
                let fragment = stripe.read_fragment(dev, &hit)?;
                if fragment.doc.magic != DOC_MAGIC {
                    return Err(Error::BadMagic {
                        what: "doc",
                        expected: DOC_MAGIC,
                        found: fragment.doc.magic,
                    });
                }
                // a tag collision points at another object
                if fragment.doc.key == key {
                    Some(fragment)
                } else {
                    debug!(url, found = %fragment.doc.key, "directory tag collision");
                    None
                }
            }
        };
        Ok(Retrieval { key, stripe: r, fragment })
    }

    /// Walk every stripe of every span in parallel
    pub fn scan(&mut self) -> Vec<ScanReport> {
        scan_spans(&mut self.spans)
    }
}

impl Cache<ReadWrite> {
    /// Write the headers of `spans` and fresh metadata for their stripes
    pub fn write_back(&mut self, spans: &[usize]) -> Diagnostics {
        let mut diags = Diagnostics::new();
        let now = unix_now();
        for &si in spans {
            let Some(span) = self.spans.get_mut(si) else {
                continue;
            };
            let name = span.path().display().to_string();
            if let Err(e) = span.update_header() {
                error!(span = %name, error = %e, "span header write failed");
                diags.fatal(format!("span {name}: {e}"));
                continue;
            }
            let (dev, stripes) = span.parts_mut();
            for stripe in stripes.iter_mut().filter(|s| !s.is_free()) {
                stripe.initialize_meta(now);
                if let Err(e) = stripe.update_header_footer(dev) {
                    error!(stripe = %stripe.hash_text(), error = %e, "stripe metadata write failed");
                    diags.fatal(format!("stripe {}: {e}", stripe.hash_text()));
                }
            }
            info!(span = %name, "span written");
        }
        diags
    }

    /// Allocate and initialize every empty span
    pub fn allocate_empty_spans(&mut self) -> Diagnostics {
        let (touched, mut diags) = self.fill_empty_spans();
        if touched.is_empty() {
            diags.info("no empty span needed space");
        }
        diags.merge(self.write_back(&touched));
        diags
    }

    /// Allocate and initialize the uninitialized span at `path`
    pub fn init_span(&mut self, path: &Path) -> Result<Diagnostics> {
        let (idx, mut diags) = self.allocate_span(path)?;
        diags.merge(self.write_back(&[idx]));
        Ok(diags)
    }

    /// Destroy the headers and stripe metadata of the selected spans
    pub fn clear_spans(&mut self, device: Option<&Path>) -> Result<Diagnostics> {
        let mut diags = Diagnostics::new();
        for si in self.select_spans(device)? {
            let span = &mut self.spans[si];
            if let Err(e) = span.clear_permanently() {
                error!(span = %span.path().display(), error = %e, "span clear failed");
                diags.fatal(format!("span {}: {e}", span.path().display()));
            }
        }
        self.rebuild_index();
        Ok(diags)
    }

    /// Persist the loaded directories of `stripes`
    pub fn sync_stripes(&mut self, stripes: &[StripeRef]) -> Diagnostics {
        let mut diags = Diagnostics::new();
        for r in stripes {
            let Some(span) = self.spans.get_mut(r.span) else {
                continue;
            };
            let (dev, list) = span.parts_mut();
            let Some(stripe) = list.get_mut(r.stripe) else {
                continue;
            };
            match stripe.sync_dir(dev) {
                Ok(copy) => diags.info(format!("stripe {} saved to copy {copy}", stripe.hash_text())),
                Err(e) => diags.fatal(format!("stripe {}: {e}", stripe.hash_text())),
            }
        }
        diags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::STRIPE_BLOCK_SIZE;
    use stripecache_common::{Severity, SpanConfig, VolumeConfig};
    use tempfile::{NamedTempFile, TempDir};

    fn span_file(stripe_blocks: u64) -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        file.as_file().set_len(stripe_blocks * STRIPE_BLOCK_SIZE).unwrap();
        file
    }

    fn config(files: &[&NamedTempFile], volumes: Vec<VolumeConfig>) -> ToolConfig {
        ToolConfig {
            spans: files.iter().map(|f| SpanConfig::new(f.path())).collect(),
            volumes,
            ..ToolConfig::default()
        }
    }

    #[test]
    fn test_url_port() {
        assert_eq!(url_port("http://example.com/a"), 80);
        assert_eq!(url_port("https://example.com/a"), 443);
        assert_eq!(url_port("http://example.com:8080/a?b=c"), 8080);
        assert_eq!(url_port("http://user:pw@example.com/"), 80);
        assert_eq!(url_port("https://[::1]:8443/"), 8443);
        assert_eq!(url_port("https://[::1]/"), 443);
        assert_eq!(url_key("http://example.com/"), CacheKey::for_url("http://example.com/", 80));
    }

    #[test]
    fn test_missing_span_is_fatal_but_others_load() {
        let dir = TempDir::new().unwrap();
        let good = span_file(3);
        let mut cfg = config(&[&good], vec![VolumeConfig::percent(1, 100)]);
        cfg.spans.push(SpanConfig::new(dir.path().join("missing")));

        let (cache, diags) = Cache::<ReadOnly>::load(cfg, DeviceOptions::default());
        assert!(diags.has_fatal());
        assert_eq!(cache.spans().len(), 1);
        assert!(cache.stripes().is_empty());
        assert!(matches!(cache.find("http://example.com/"), Err(Error::NoStripes)));
    }

    #[test]
    fn test_percentages_over_100_warn() {
        let f = span_file(3);
        let cfg = config(&[&f], vec![VolumeConfig::percent(1, 70), VolumeConfig::percent(2, 40)]);
        let (_, diags) = Cache::<ReadOnly>::load(cfg, DeviceOptions::default());
        assert!(!diags.has_fatal());
        assert_eq!(diags.count(Severity::Warning), 1);
    }

    #[test]
    fn test_simulated_allocation_builds_volumes() {
        let (a, b) = (span_file(3), span_file(3));
        let cfg = config(&[&a, &b], vec![VolumeConfig::percent(1, 50), VolumeConfig::percent(2, 50)]);
        let (mut cache, _) = Cache::<ReadOnly>::load(cfg, DeviceOptions::default());
        assert_eq!(cache.total_capacity().count(), 5);

        let (touched, diags) = cache.fill_all_spans();
        assert_eq!(touched, vec![0, 1]);
        assert!(!diags.has_fatal());
        assert_eq!(cache.stripes().len(), 4);
        assert_eq!(cache.volumes().len(), 2);
        for v in cache.volumes().values() {
            assert_eq!(v.stripes.len(), 2);
        }

        let (_, r) = cache.find("http://example.com/index.html").unwrap();
        assert!(cache.stripes().contains(&r));
        assert_eq!(cache.find("http://example.com/index.html").unwrap().1, r);

        // nothing reached the disk
        let (again, _) = Cache::<ReadOnly>::load(cache.config().clone(), DeviceOptions::default());
        assert!(again.stripes().is_empty());
    }

    #[test]
    fn test_allocate_write_back_and_reload() {
        let f = span_file(3);
        let cfg = config(&[&f], vec![VolumeConfig::percent(1, 100)]);
        let (mut cache, _) = Cache::<ReadWrite>::load(cfg.clone(), DeviceOptions::default());
        let diags = cache.allocate_empty_spans();
        assert!(!diags.has_fatal(), "{diags}");
        assert_eq!(cache.stripes().len(), 1);

        // the span is now in use
        let again = cache.allocate_empty_spans();
        assert_eq!(again.count(Severity::Info), 1);
        assert!(matches!(
            cache.init_span(f.path()),
            Err(Error::AlreadyInitialized(_))
        ));

        let (mut ro, diags) = Cache::<ReadOnly>::load(cfg, DeviceOptions::default());
        assert!(diags.is_empty());
        assert!(ro.spans()[0].is_initialized());
        assert_eq!(ro.stripes().len(), 1);

        let loaded = ro.load_meta(None).unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(matches!(loaded[0].outcome, StripeOutcome::Done(CopyId::A)));

        let checks = ro.dir_check(Some(f.path())).unwrap();
        let report = checks[0].outcome.done().unwrap();
        assert!(report.is_sound());
        assert_eq!(report.in_use, 0);

        let dir = TempDir::new().unwrap();
        assert!(matches!(
            ro.dir_check(Some(&dir.path().join("nope"))),
            Err(Error::SpanNotFound(_))
        ));
    }

    #[test]
    fn test_init_span_then_retrieve() {
        let f = span_file(3);
        let cfg = config(&[&f], vec![VolumeConfig::percent(1, 100)]);
        let (mut cache, _) = Cache::<ReadWrite>::load(cfg.clone(), DeviceOptions::default());
        assert!(!cache.init_span(f.path()).unwrap().has_fatal());

        let url = "http://example.com/logo.png";
        let (key, r) = cache.find(url).unwrap();
        let (dev, stripes) = cache.span_mut(r.span).unwrap().parts_mut();
        stripes[r.stripe].write_doc(dev, &key, b"hdr", b"payload").unwrap();
        stripes[r.stripe].sync_dir(dev).unwrap();

        let (mut ro, _) = Cache::<ReadOnly>::load(cfg, DeviceOptions::default());
        let hit = ro.retrieve(url).unwrap();
        assert_eq!(hit.stripe, r);
        let fragment = hit.fragment.unwrap();
        assert_eq!(fragment.header(), b"hdr");
        assert_eq!(fragment.data(), b"payload");
        assert!(fragment.is_complete());

        let miss = ro.retrieve("http://example.com/other.png").unwrap();
        assert!(miss.fragment.is_none());
    }

    #[test]
    fn test_uninitialized_stripes_report() {
        let f = span_file(3);
        let cfg = config(&[&f], vec![VolumeConfig::percent(1, 100)]);
        let (mut cache, _) = Cache::<ReadOnly>::load(cfg, DeviceOptions::default());
        cache.fill_empty_spans();
        let results = cache.walk_bucket_chains(None).unwrap();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0].outcome, StripeOutcome::Uninitialized));
        assert!(cache.retrieve("http://example.com/").is_err());
    }

    #[test]
    fn test_clear_spans() {
        let f = span_file(3);
        let cfg = config(&[&f], vec![VolumeConfig::percent(1, 100)]);
        let (mut cache, _) = Cache::<ReadWrite>::load(cfg.clone(), DeviceOptions::default());
        cache.allocate_empty_spans();
        let diags = cache.clear_spans(None).unwrap();
        assert!(diags.is_empty());
        assert!(cache.stripes().is_empty());

        let (ro, _) = Cache::<ReadOnly>::load(cfg, DeviceOptions::default());
        assert!(!ro.spans()[0].is_initialized());
        assert!(ro.spans()[0].is_empty());
    }

    #[test]
    fn test_repairs_are_synced() {
        let f = span_file(3);
        let cfg = config(&[&f], vec![VolumeConfig::percent(1, 100)]);
        let (mut cache, _) = Cache::<ReadWrite>::load(cfg.clone(), DeviceOptions::default());
        cache.allocate_empty_spans();

        let results = cache.check_freelists(None).unwrap();
        let report = results[0].outcome.done().unwrap();
        assert!(report.repaired.is_empty());

        let refs: Vec<_> = results.iter().map(|r| r.stripe).collect();
        let diags = cache.sync_stripes(&refs);
        assert_eq!(diags.count(Severity::Info), 1);

        let (mut ro, _) = Cache::<ReadOnly>::load(cfg, DeviceOptions::default());
        let loaded = ro.load_meta(None).unwrap();
        assert!(matches!(loaded[0].outcome, StripeOutcome::Done(CopyId::B)));
    }
}
