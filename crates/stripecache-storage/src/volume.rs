//! Volumes and the proportional-share allocator
//!
//! Volumes are logical groupings of stripes across spans. The allocator
//! hands out free span space in passes: every under-provisioned volume
//! gets a share weighted by how far it is from its target, so the most
//! starved volumes fill first and nobody overshoots.

use crate::raw_io::Access;
use crate::span::Span;
use std::collections::BTreeMap;
use stripecache_common::{Diagnostics, StoreBlocks, StripeBlocks, VolumeConfig, VolumeId};
use tracing::{debug, info};

/// Fixed-point scale of the deficit ratio
const DEFICIT_SCALE: u128 = 1000;

/// Position of a stripe in the cache's span list
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StripeRef {
    pub span: usize,
    pub stripe: usize,
}

/// A logical volume
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Volume {
    pub idx: VolumeId,
    /// Sum of the owned stripe lengths
    pub size: StoreBlocks,
    pub stripes: Vec<StripeRef>,
}

impl Volume {
    #[must_use]
    pub const fn new(idx: VolumeId) -> Self {
        Self {
            idx,
            size: StoreBlocks::new(0),
            stripes: Vec::new(),
        }
    }

    pub fn add(&mut self, stripe: StripeRef, len: StoreBlocks) {
        self.stripes.push(stripe);
        self.size += len;
    }
}

/// Volumes by index
pub type VolumeMap = BTreeMap<VolumeId, Volume>;

/// Allocation size credited to a volume for a stripe. Partial stripe
/// blocks are not counted.
#[must_use]
pub fn credited(len: StoreBlocks) -> StripeBlocks {
    StripeBlocks::round_down(len.bytes())
}

/// Per-volume allocation state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VolumeTarget {
    pub config: VolumeConfig,
    /// Resolved target
    pub alloc: StripeBlocks,
    /// Currently allocated
    pub size: StripeBlocks,
    deficit: u128,
    shares: u128,
}

impl VolumeTarget {
    /// Blocks still missing
    #[must_use]
    pub const fn delta(&self) -> StripeBlocks {
        self.alloc.saturating_sub(self.size)
    }
}

/// Distributes free span space among volume targets
#[derive(Clone, Debug, Default)]
pub struct VolumeAllocator {
    targets: Vec<VolumeTarget>,
}

impl VolumeAllocator {
    /// Resolve `configs` against the total configured capacity
    #[must_use]
    pub fn new(configs: &[VolumeConfig], total: StripeBlocks) -> Self {
        let targets = configs
            .iter()
            .map(|config| VolumeTarget {
                config: *config,
                alloc: config.resolve(total),
                size: StripeBlocks::new(0),
                deficit: 0,
                shares: 0,
            })
            .collect();
        Self { targets }
    }

    /// Take current sizes from existing volumes
    pub fn load_sizes(&mut self, volumes: &VolumeMap) {
        for t in &mut self.targets {
            t.size = volumes
                .get(&t.config.volume)
                .map_or(StripeBlocks::new(0), |v| credited(v.size));
        }
    }

    /// Forget current sizes, as when every span is being reallocated
    pub fn clear_sizes(&mut self) {
        for t in &mut self.targets {
            t.size = StripeBlocks::new(0);
        }
    }

    pub fn targets(&self) -> &[VolumeTarget] {
        &self.targets
    }

    /// Hand out the free space of one span. Volumes are served most
    /// starved first; each gets its share of what is left, rounded up and
    /// capped at what it still needs. A span forced to a volume only
    /// serves that volume.
    pub fn allocate_for<A: Access>(&mut self, span: &mut Span<A>) -> Diagnostics {
        let mut diags = Diagnostics::new();
        let forced = span.forced_volume();
        let span_blocks = u128::from(credited(span.free_space()).count());
        let mut span_used: u128 = 0;
        let mut total_shares: u128 = 0;

        for t in &mut self.targets {
            let delta = u128::from(t.delta().count());
            let eligible = forced.is_none_or(|v| v == t.config.volume);
            if delta > 0 && eligible {
                t.deficit = delta * DEFICIT_SCALE / u128::from(t.alloc.count());
                t.shares = delta * t.deficit;
            } else {
                t.deficit = 0;
                t.shares = 0;
            }
            total_shares += t.shares;
        }
        if total_shares == 0 {
            debug!(span = %span.path().display(), "no volume needs space");
            return diags;
        }

        self.targets.sort_by(|a, b| b.deficit.cmp(&a.deficit));

        for t in &mut self.targets {
            if t.shares == 0 {
                continue;
            }
            let remaining = span_blocks.saturating_sub(span_used);
            let share = (remaining * t.shares).div_ceil(total_shares);
            let n = share.min(u128::from(t.delta().count())) as u64;
            total_shares -= t.shares;
            if n == 0 {
                continue;
            }

            match span.alloc_stripe(t.config.volume, StripeBlocks::new(n)) {
                Ok(i) => {
                    let got = credited(span.stripes()[i].len());
                    t.size += got;
                    span_used += u128::from(got.count());
                    info!(
                        span = %span.path().display(),
                        volume = t.config.volume,
                        blocks = got.count(),
                        "allocated stripe"
                    );
                }
                Err(e) => diags.warn(format!("volume {}: {e}", t.config.volume)),
            }
        }
        diags
    }
}
