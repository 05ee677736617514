//! Spans
//!
//! A span is one device or file. Its header at `SPAN_HEADER_OFFSET`
//! describes how the space after the header is cut into stripes.

use crate::layout::{SPAN_HEADER_OFFSET, STORE_BLOCK_SIZE, STRIPE_BLOCK_SIZE, SpanHeader, StripeDescriptor};
use crate::raw_io::{Access, AlignedBuffer, Device, DeviceOptions, ReadOnly, ReadWrite};
use crate::stripe::{STRIPE_TYPE_HTTP, Stripe};
use std::path::{Path, PathBuf};
use stripecache_common::{Error, Result, SpanConfig, StoreBlocks, StripeBlocks, VolumeId};
use tracing::{debug, info, warn};

/// A device and its stripes
#[derive(Debug)]
pub struct Span<A: Access = ReadOnly> {
    device: Device<A>,
    path: PathBuf,
    /// Reserved prefix; the header starts here
    base: u64,
    /// First byte after the header
    offset: u64,
    len: StoreBlocks,
    header: Option<SpanHeader>,
    stripes: Vec<Stripe>,
    free_space: StoreBlocks,
    forced_volume: Option<VolumeId>,
    average_object_size: u64,
}

impl<A: Access> Span<A> {
    /// Open the device named by `config` and load its header
    pub fn open(config: &SpanConfig, options: DeviceOptions, average_object_size: u64) -> Result<Self> {
        let device = Device::<A>::open(&config.path, options)?;
        Self::load(device, config.volume, average_object_size)
    }

    /// Read the span header. A device without a recognizable header loads
    /// as a single free stripe.
    pub fn load(device: Device<A>, forced_volume: Option<VolumeId>, average_object_size: u64) -> Result<Self> {
        let path = device.path().to_path_buf();
        let mut span = Self {
            len: StoreBlocks::round_down(device.size()),
            device,
            path,
            base: SPAN_HEADER_OFFSET,
            offset: SPAN_HEADER_OFFSET,
            header: None,
            stripes: Vec::new(),
            free_space: StoreBlocks::new(0),
            forced_volume,
            average_object_size,
        };

        match span.read_header() {
            Ok(Some(header)) => {
                if let Err(e) = span.adopt(header) {
                    warn!(span = %span.path.display(), error = %e, "rejecting span header");
                    span.clear();
                }
            }
            Ok(None) => span.clear(),
            Err(e) if e.is_format() => {
                warn!(span = %span.path.display(), error = %e, "rejecting span header");
                span.clear();
            }
            Err(e) => return Err(e),
        }
        Ok(span)
    }

    fn read_header(&self) -> Result<Option<SpanHeader>> {
        let block = STORE_BLOCK_SIZE as usize;
        let mut buf = AlignedBuffer::new(block);
        let n = self.device.read_at(self.base, buf.as_mut_slice())?;
        if n < block {
            debug!(span = %self.path.display(), "device too small for a span header");
            return Ok(None);
        }

        let count = match SpanHeader::peek_descriptor_count(buf.as_slice()) {
            Ok(count) => count,
            Err(Error::BadMagic { found, .. }) => {
                debug!(span = %self.path.display(), magic = found, "no span header");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let room = self.device.size().saturating_sub(self.base);
        let size = SpanHeader::size_for(count);
        if size > room {
            return Err(Error::format(format!(
                "span header claims {count} descriptors ({size} bytes), device has {room} bytes after the base"
            )));
        }
        let size = size as usize;
        if size > block {
            let mut big = AlignedBuffer::new(size);
            self.device.read_exact_at(self.base, big.as_mut_slice())?;
            buf = big;
        }
        SpanHeader::from_bytes(buf.as_slice()).map(Some)
    }

    /// Build stripes from a parsed header
    fn adopt(&mut self, header: SpanHeader) -> Result<()> {
        let offset = self.base + header.size();
        let mut next = offset;
        for d in &header.stripes {
            if d.offset < next {
                return Err(Error::format(format!(
                    "stripe at {} overlaps the previous one ending at {next}",
                    d.offset
                )));
            }
            next = d.offset + d.len.bytes();
        }
        if next > header.num_blocks.bytes() {
            return Err(Error::format(format!(
                "stripes end at {next}, past the span length {}",
                header.num_blocks.bytes()
            )));
        }
        if header.num_blocks.bytes() > self.device.size() {
            warn!(
                span = %self.path.display(),
                recorded = header.num_blocks.bytes(),
                actual = self.device.size(),
                "span header records more space than the device has"
            );
        }

        self.offset = offset;
        self.len = header.num_blocks;
        self.free_space = StoreBlocks::new(0);
        self.stripes = header
            .stripes
            .iter()
            .map(|d| Stripe::from_descriptor(&self.path, d, self.average_object_size))
            .collect();
        for d in header.stripes.iter().filter(|d| d.free) {
            self.free_space += d.len;
        }
        debug!(
            span = %self.path.display(),
            stripes = header.stripes.len(),
            used = header.num_used,
            free = header.num_free,
            "span header loaded"
        );
        self.header = Some(header);
        Ok(())
    }

    /// Reset to a single free stripe. The header area is sized for the
    /// largest number of stripes the span could hold.
    pub fn clear(&mut self) {
        self.header = None;
        self.stripes.clear();
        self.free_space = StoreBlocks::new(0);
        self.len = StoreBlocks::round_down(self.device.size());

        let total = self.len.bytes();
        let eff = total.saturating_sub(self.base);
        let n = eff.saturating_sub(SpanHeader::BASE_SIZE as u64)
            / (STRIPE_BLOCK_SIZE + StripeDescriptor::SIZE as u64)
            + 1;
        self.offset = self.base + SpanHeader::size_for(n as usize);

        let len = StoreBlocks::round_down(total.saturating_sub(self.offset));
        if len.is_zero() {
            warn!(span = %self.path.display(), size = total, "span too small for any stripe");
            return;
        }
        self.stripes
            .push(Stripe::new(&self.path, self.offset, len, 0, 0, self.average_object_size));
        self.free_space = len;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub const fn device(&self) -> &Device<A> {
        &self.device
    }

    pub const fn base(&self) -> u64 {
        self.base
    }

    /// Start of the stripe area
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    pub const fn len(&self) -> StoreBlocks {
        self.len
    }

    pub const fn header(&self) -> Option<&SpanHeader> {
        self.header.as_ref()
    }

    /// A valid header was loaded or written
    pub const fn is_initialized(&self) -> bool {
        self.header.is_some()
    }

    pub fn stripes(&self) -> &[Stripe] {
        &self.stripes
    }

    pub const fn free_space(&self) -> StoreBlocks {
        self.free_space
    }

    pub const fn forced_volume(&self) -> Option<VolumeId> {
        self.forced_volume
    }

    pub const fn average_object_size(&self) -> u64 {
        self.average_object_size
    }

    /// No stripe belongs to a volume
    pub fn is_empty(&self) -> bool {
        self.stripes.iter().all(Stripe::is_free)
    }

    /// Combined length of all stripes, free or not
    pub fn stripe_capacity(&self) -> StoreBlocks {
        StoreBlocks::new(self.stripes.iter().map(|s| s.len().count()).sum())
    }

    /// The device together with mutable stripes, for stripe I/O
    pub fn parts_mut(&mut self) -> (&Device<A>, &mut [Stripe]) {
        (&self.device, &mut self.stripes)
    }

    /// Carve a stripe of `len` for `vol_idx` out of the first free stripe
    /// large enough. The free stripe is used whole when at most one
    /// stripe block would remain. Returns the new stripe's index.
    pub fn alloc_stripe(&mut self, vol_idx: VolumeId, len: StripeBlocks) -> Result<usize> {
        let want: StoreBlocks = len.convert_down();
        let idx = self
            .stripes
            .iter()
            .position(|s| s.is_free() && want.count() <= s.len().count())
            .ok_or_else(|| Error::NoFreeStripe {
                requested: format!("{} stripe blocks on {}", len.count(), self.path.display()),
            })?;

        let free = &self.stripes[idx];
        let one_block: StoreBlocks = StripeBlocks::new(1).convert_down();
        if free.len().count() <= want.count() + one_block.count() {
            let got = free.len();
            self.stripes[idx].assign(vol_idx, STRIPE_TYPE_HTTP);
            self.free_space = self.free_space.saturating_sub(got);
            info!(span = %self.path.display(), volume = vol_idx, blocks = got.count(), "assigned whole stripe");
        } else {
            let (start, rest) = (free.start(), free.len().saturating_sub(want));
            let aos = self.average_object_size;
            let taken = Stripe::new(&self.path, start, want, vol_idx, STRIPE_TYPE_HTTP, aos);
            self.stripes[idx] = Stripe::new(&self.path, start + want.bytes(), rest, 0, 0, aos);
            self.stripes.insert(idx, taken);
            self.free_space = self.free_space.saturating_sub(want);
            info!(span = %self.path.display(), volume = vol_idx, blocks = want.count(), "split stripe");
        }
        Ok(idx)
    }

    /// Recompute the header from the stripes in memory
    pub fn rebuild_header(&mut self) -> &SpanHeader {
        let mut volumes = [0u64; 4];
        for s in self.stripes.iter().filter(|s| !s.is_free()) {
            let v = usize::from(s.vol_idx());
            volumes[v / 64] |= 1 << (v % 64);
        }
        let num_used = self.stripes.iter().filter(|s| !s.is_free()).count() as u32;
        let header = SpanHeader {
            num_volumes: volumes.iter().map(|w| w.count_ones()).sum(),
            num_free: self.stripes.len() as u32 - num_used,
            num_used,
            num_blocks: self.len,
            stripes: self.stripes.iter().map(Stripe::descriptor).collect(),
        };
        self.header.insert(header)
    }
}

impl Span<ReadWrite> {
    /// Rewrite the header from the current stripes
    pub fn update_header(&mut self) -> Result<()> {
        let bytes = self.rebuild_header().to_bytes();
        let mut buf = AlignedBuffer::new(bytes.len());
        buf.copy_from(&bytes);
        self.device.write_at(self.base, buf.as_slice())?;
        self.device.sync()?;
        info!(span = %self.path.display(), stripes = self.stripes.len(), "span header written");
        Ok(())
    }

    /// Destroy the header and every stripe's metadata on disk
    pub fn clear_permanently(&mut self) -> Result<()> {
        let zero = AlignedBuffer::new(STORE_BLOCK_SIZE as usize);
        self.device.write_at(self.base, zero.as_slice())?;
        for stripe in &mut self.stripes {
            stripe.clear(&self.device)?;
        }
        self.device.sync()?;
        info!(span = %self.path.display(), "span cleared");
        self.clear();
        Ok(())
    }
}
