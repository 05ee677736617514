//! Stripes
//!
//! A stripe is a contiguous region of a span holding two metadata copies
//! (A and B, each a HEAD, a directory and a FOOT) followed by the fragment
//! area. Writers always finish a copy's HEAD before its FOOT, so a copy
//! whose HEAD and FOOT disagree on `sync_serial` was interrupted and is
//! ignored in favor of the other one.

use crate::dir::{
    ChainWalk, DIR_DEPTH, DirCheckReport, DirEntry, DirLocation, Directory, MAX_BUCKETS_PER_SEGMENT,
    SIZEOF_DIR, WriteCursor,
};
use crate::layout::{
    CACHE_BLOCK_SIZE, CACHE_DB_MAJOR_VERSION, DOC_MAGIC, Doc, STORE_BLOCK_SIZE, StripeDescriptor, StripeMeta,
};
use crate::raw_io::{Access, AlignedBuffer, Device, ReadWrite};
use bytes::Bytes;
use std::fmt;
use std::path::Path;
use stripecache_common::{CacheKey, Error, Result, StoreBlocks, VolumeId, units::align_up};
use tracing::{debug, info, warn};

/// Bytes read per step while searching for FOOT A. A multiple of both the
/// store block and the entry size.
const META_SCAN_CHUNK: u64 = 256 * STORE_BLOCK_SIZE * SIZEOF_DIR as u64;

/// Stripe type recorded for allocated stripes
pub const STRIPE_TYPE_HTTP: u8 = 1;

/// One of the two metadata copies
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CopyId {
    A,
    B,
}

impl CopyId {
    pub const ALL: [Self; 2] = [Self::A, Self::B];

    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::A => 0,
            Self::B => 1,
        }
    }

    /// Copy written by a directory sync with this serial
    #[must_use]
    pub const fn for_serial(serial: u32) -> Self {
        if serial % 2 == 1 { Self::B } else { Self::A }
    }
}

impl fmt::Display for CopyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::B => write!(f, "B"),
        }
    }
}

/// Directory sizing of a stripe
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirGeometry {
    pub segments: usize,
    /// Buckets per segment
    pub buckets: usize,
    /// HEAD region length
    pub header_len: u64,
    /// Length of one metadata copy (HEAD, directory, FOOT)
    pub dir_len: u64,
    /// Absolute offset of the fragment area
    pub content: u64,
}

impl DirGeometry {
    /// Size the directory for a stripe at `start` of `len` store blocks.
    ///
    /// The header length depends on the segment count, which depends on
    /// the byte budget left after the header, so the computation is
    /// repeated until it settles. Three rounds are always enough.
    #[must_use]
    pub fn compute(start: u64, len: StoreBlocks, average_object_size: u64) -> Self {
        let aos = average_object_size.max(1);
        let mut geo = Self {
            segments: 1,
            buckets: 1,
            header_len: 0,
            dir_len: 0,
            content: start,
        };
        for _ in 0..3 {
            let budget = len.bytes().saturating_sub(geo.content - start);
            let total = (budget / aos / DIR_DEPTH as u64).max(1);
            let segments = total.div_ceil(MAX_BUCKETS_PER_SEGMENT as u64);
            geo.segments = segments as usize;
            geo.buckets = total.div_ceil(segments) as usize;
            geo.header_len = StripeMeta::header_len(geo.segments);
            geo.dir_len = geo.header_len
                + align_up(Directory::byte_len(geo.segments, geo.buckets) as u64, STORE_BLOCK_SIZE)
                + align_up(StripeMeta::SIZE as u64, STORE_BLOCK_SIZE);
            geo.content = start + 2 * geo.dir_len;
        }
        geo
    }

    #[must_use]
    pub const fn entries(&self) -> usize {
        self.segments * self.buckets * DIR_DEPTH
    }

    /// Directory region length within a copy
    #[must_use]
    pub const fn dir_region_len(&self) -> u64 {
        self.dir_len - self.header_len - STORE_BLOCK_SIZE
    }
}

/// On-disk state of one metadata copy
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetaCopy {
    pub head_pos: u64,
    pub foot_pos: u64,
    pub head: Option<StripeMeta>,
    pub foot: Option<StripeMeta>,
    /// Freelist heads stored after the HEAD record
    pub freelist: Vec<u16>,
}

impl MetaCopy {
    /// HEAD and FOOT both present with the same serial
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        matches!((self.head, self.foot), (Some(h), Some(f)) if h.sync_serial == f.sync_serial)
    }

    fn serial(&self) -> u32 {
        self.head.map_or(0, |h| h.sync_serial)
    }

    fn forget(&mut self) {
        self.head = None;
        self.foot = None;
        self.freelist.clear();
    }
}

/// Which metadata copy is authoritative
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetaState {
    NoValidCopy,
    ACopyActive,
    BCopyActive,
}

impl MetaState {
    /// The consistent copy with the higher serial wins; ties go to A.
    #[must_use]
    pub fn select(a: &MetaCopy, b: &MetaCopy) -> Self {
        match (a.is_consistent(), b.is_consistent()) {
            (true, true) if a.serial() >= b.serial() => Self::ACopyActive,
            (true, true) | (false, true) => Self::BCopyActive,
            (true, false) => Self::ACopyActive,
            (false, false) => Self::NoValidCopy,
        }
    }

    #[must_use]
    pub const fn active(self) -> Option<CopyId> {
        match self {
            Self::NoValidCopy => None,
            Self::ACopyActive => Some(CopyId::A),
            Self::BCopyActive => Some(CopyId::B),
        }
    }
}

/// Result of reading a stripe's metadata
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadOutcome {
    /// No valid HEAD A; the stripe was never initialized
    Uninitialized,
    Loaded(CopyId),
}

/// A directory hit with its byte range
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProbeHit {
    pub location: DirLocation,
    /// Absolute device offset of the fragment
    pub offset: u64,
    /// Upper bound of the fragment length
    pub size: u64,
}

/// A fragment read from disk
#[derive(Clone, Debug)]
pub struct Fragment {
    pub doc: Doc,
    pub bytes: Bytes,
}

impl Fragment {
    /// Opaque header following the preamble
    #[must_use]
    pub fn header(&self) -> &[u8] {
        let end = self.doc.prefix_len().min(self.bytes.len());
        &self.bytes[Doc::SIZE.min(end)..end]
    }

    /// Object data carried by this fragment
    #[must_use]
    pub fn data(&self) -> &[u8] {
        let end = (self.doc.len as usize).min(self.bytes.len());
        &self.bytes[self.doc.prefix_len().min(end)..end]
    }

    /// The whole fragment was read
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.doc.len as usize <= self.bytes.len()
    }
}

/// Doc `len` and `hlen` for a fragment, which must fit in 32 bits
fn doc_lengths(header_len: usize, data_len: usize) -> Result<(u32, u32)> {
    let raw_len = Doc::SIZE as u64 + header_len as u64 + data_len as u64;
    match (u32::try_from(raw_len), u32::try_from(header_len)) {
        (Ok(len), Ok(hlen)) => Ok((len, hlen)),
        _ => Err(Error::format(format!("fragment of {raw_len} bytes is too large for a doc"))),
    }
}

/// Outcome of a freelist check over all segments
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FreelistReport {
    /// Freelist length per segment after repair
    pub lengths: Vec<usize>,
    /// Segments that were reinitialized
    pub repaired: Vec<usize>,
}

impl FreelistReport {
    /// The loops that were repaired
    #[must_use]
    pub fn cycles(&self) -> Vec<Error> {
        self.repaired
            .iter()
            .map(|&segment| Error::Cycle {
                segment,
                chain: "freelist".to_owned(),
            })
            .collect()
    }
}

/// Outcome of cleaning every bucket chain
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChainReport {
    pub cleaned: usize,
    /// Segments that were reinitialized
    pub reset: Vec<usize>,
}

impl ChainReport {
    #[must_use]
    pub fn changed(&self) -> bool {
        self.cleaned > 0 || !self.reset.is_empty()
    }

    /// The broken chains that caused a segment reset
    #[must_use]
    pub fn cycles(&self) -> Vec<Error> {
        self.reset
            .iter()
            .map(|&segment| Error::Cycle {
                segment,
                chain: "bucket chain".to_owned(),
            })
            .collect()
    }
}

/// Serialized form of one metadata copy
struct MetaImage {
    head: Bytes,
    dir: Vec<u8>,
    foot: Vec<u8>,
}

/// A stripe and its metadata
#[derive(Clone, Debug)]
pub struct Stripe {
    start: u64,
    len: StoreBlocks,
    vol_idx: VolumeId,
    kind: u8,
    geometry: DirGeometry,
    hash_text: String,
    hash_id: CacheKey,
    copies: [MetaCopy; 2],
    active: Option<CopyId>,
    live: StripeMeta,
    directory: Option<Directory>,
}

impl Stripe {
    pub fn new(
        span_path: &Path,
        start: u64,
        len: StoreBlocks,
        vol_idx: VolumeId,
        kind: u8,
        average_object_size: u64,
    ) -> Self {
        let hash_text = format!("{} {}:{}", span_path.display(), start, len.count());
        let hash_id = CacheKey::digest(&hash_text);
        let mut stripe = Self {
            start,
            len,
            vol_idx,
            kind,
            geometry: DirGeometry::compute(start, len, average_object_size),
            hash_text,
            hash_id,
            copies: [MetaCopy::default(), MetaCopy::default()],
            active: None,
            live: StripeMeta::default(),
            directory: None,
        };
        stripe.reset_positions();
        stripe
    }

    /// Stripe built from a span header descriptor
    pub fn from_descriptor(span_path: &Path, d: &StripeDescriptor, average_object_size: u64) -> Self {
        Self::new(span_path, d.offset, d.len, d.vol_idx, d.kind, average_object_size)
    }

    fn reset_positions(&mut self) {
        for copy in CopyId::ALL {
            let head = self.start + copy.index() as u64 * self.geometry.dir_len;
            let c = &mut self.copies[copy.index()];
            c.head_pos = head;
            c.foot_pos = head + self.geometry.dir_len - STORE_BLOCK_SIZE;
        }
    }

    pub const fn start(&self) -> u64 {
        self.start
    }

    pub const fn len(&self) -> StoreBlocks {
        self.len
    }

    /// Absolute end offset
    pub const fn end(&self) -> u64 {
        self.start + self.len.bytes()
    }

    pub const fn vol_idx(&self) -> VolumeId {
        self.vol_idx
    }

    pub const fn kind(&self) -> u8 {
        self.kind
    }

    pub const fn is_free(&self) -> bool {
        self.vol_idx == 0
    }

    /// Hand the stripe to a volume
    pub fn assign(&mut self, vol_idx: VolumeId, kind: u8) {
        self.vol_idx = vol_idx;
        self.kind = kind;
    }

    pub const fn geometry(&self) -> &DirGeometry {
        &self.geometry
    }

    pub const fn content(&self) -> u64 {
        self.geometry.content
    }

    pub fn hash_text(&self) -> &str {
        &self.hash_text
    }

    pub const fn hash_id(&self) -> CacheKey {
        self.hash_id
    }

    pub const fn copies(&self) -> &[MetaCopy; 2] {
        &self.copies
    }

    pub const fn copy(&self, copy: CopyId) -> &MetaCopy {
        &self.copies[copy.index()]
    }

    pub const fn active(&self) -> Option<CopyId> {
        self.active
    }

    /// Metadata of the active copy, as updated in memory
    pub const fn live_meta(&self) -> Option<&StripeMeta> {
        match self.active {
            Some(_) => Some(&self.live),
            None => None,
        }
    }

    pub const fn directory(&self) -> Option<&Directory> {
        self.directory.as_ref()
    }

    pub fn descriptor(&self) -> StripeDescriptor {
        StripeDescriptor {
            offset: self.start,
            len: self.len,
            vol_idx: self.vol_idx,
            kind: self.kind,
            free: self.is_free(),
        }
    }

    pub const fn cursor(&self) -> WriteCursor {
        WriteCursor::new(
            self.live.phase,
            self.geometry.content,
            self.live.write_pos,
            self.live.agg_pos,
        )
    }

    /// Absolute offset of the fragment an entry points at
    #[must_use]
    pub const fn fragment_offset(&self, e: &DirEntry) -> u64 {
        self.geometry.content + (e.offset() - 1) * CACHE_BLOCK_SIZE
    }

    fn dir(&self) -> Result<&Directory> {
        self.directory
            .as_ref()
            .ok_or_else(|| Error::internal(format!("stripe {}: directory not loaded", self.hash_text)))
    }

    fn dir_mut(&mut self) -> Result<&mut Directory> {
        match self.directory.as_mut() {
            Some(dir) => Ok(dir),
            None => Err(Error::internal(format!("stripe {}: directory not loaded", self.hash_text))),
        }
    }

    /// Read a metadata record at `pos`. A short read or a record with the
    /// wrong magic or version yields `None`; device failures propagate.
    fn read_meta<A: Access>(dev: &Device<A>, pos: u64, len: usize) -> Result<Option<(StripeMeta, AlignedBuffer)>> {
        let mut buf = AlignedBuffer::new(len);
        let n = dev.read_at(pos, buf.as_mut_slice())?;
        if n < len {
            return Ok(None);
        }
        let meta = StripeMeta::from_bytes(buf.as_slice())?;
        Ok(meta.is_valid().then_some((meta, buf)))
    }

    /// Search forward from HEAD A for its FOOT
    fn scan_for_foot<A: Access>(&self, dev: &Device<A>, head: &StripeMeta) -> Result<Option<(u64, StripeMeta)>> {
        let limit = self.start + self.len.bytes() / 16;
        let mut pos = self.start + STORE_BLOCK_SIZE;
        let mut buf = AlignedBuffer::new(META_SCAN_CHUNK as usize);

        while pos < limit {
            let want = align_up(limit - pos, STORE_BLOCK_SIZE).min(META_SCAN_CHUNK) as usize;
            let n = dev.read_at(pos, &mut buf.as_mut_slice()[..want])?;
            debug!(pos, bytes = n, "scanning for metadata footer");
            let data = &buf.as_slice()[..n];
            for off in (0..n).step_by(STORE_BLOCK_SIZE as usize) {
                if off + StripeMeta::SIZE > n {
                    break;
                }
                let meta = StripeMeta::from_bytes(&data[off..])?;
                if meta.is_valid() && meta.version == head.version {
                    return Ok(Some((pos + off as u64, meta)));
                }
            }
            if n < want {
                break;
            }
            pos += n as u64;
        }
        Ok(None)
    }

    /// Read all four metadata records and select the active copy
    pub fn load_meta<A: Access>(&mut self, dev: &Device<A>) -> Result<LoadOutcome> {
        self.active = None;
        self.directory = None;
        self.live = StripeMeta::default();
        for c in &mut self.copies {
            c.forget();
        }
        self.reset_positions();

        let header_len = self.geometry.header_len as usize;
        let segments = self.geometry.segments;

        let Some((a_head, buf)) = Self::read_meta(dev, self.start, header_len)? else {
            debug!(stripe = %self.hash_text, "no metadata header");
            return Ok(LoadOutcome::Uninitialized);
        };
        self.copies[0].head = Some(a_head);
        self.copies[0].freelist = StripeMeta::freelist_from_head(buf.as_slice(), segments)?;

        match self.scan_for_foot(dev, &a_head)? {
            Some((pos, foot)) => {
                if pos != self.copies[0].foot_pos {
                    warn!(
                        stripe = %self.hash_text,
                        found = pos,
                        expected = self.copies[0].foot_pos,
                        "metadata footer not where the directory size puts it"
                    );
                }
                self.copies[0].foot_pos = pos;
                self.copies[0].foot = Some(foot);
            }
            None => warn!(stripe = %self.hash_text, "footer A not found"),
        }

        let delta = self.copies[0].foot_pos - self.copies[0].head_pos;
        let b_head_pos = self.copies[0].foot_pos + STORE_BLOCK_SIZE;
        self.copies[1].head_pos = b_head_pos;
        self.copies[1].foot_pos = b_head_pos + delta;

        if let Some((b_head, buf)) = Self::read_meta(dev, b_head_pos, header_len)? {
            self.copies[1].head = Some(b_head);
            self.copies[1].freelist = StripeMeta::freelist_from_head(buf.as_slice(), segments)?;
            if let Some((b_foot, _)) = Self::read_meta(dev, b_head_pos + delta, STORE_BLOCK_SIZE as usize)?
                && b_foot.version == b_head.version
            {
                self.copies[1].foot = Some(b_foot);
            }
        }

        let state = MetaState::select(&self.copies[0], &self.copies[1]);
        let Some(copy) = state.active() else {
            let serial = |m: Option<StripeMeta>| m.map_or(0, |m| m.sync_serial);
            return Err(Error::NoValidCopy {
                a_head: serial(self.copies[0].head),
                a_foot: serial(self.copies[0].foot),
                b_head: serial(self.copies[1].head),
                b_foot: serial(self.copies[1].foot),
            });
        };
        let Some(head) = self.copies[copy.index()].head else {
            return Err(Error::internal("active metadata copy has no header"));
        };
        self.live = head;
        self.active = Some(copy);
        debug!(stripe = %self.hash_text, %copy, serial = head.sync_serial, "metadata loaded");
        Ok(LoadOutcome::Loaded(copy))
    }

    /// Fresh metadata and an empty directory, in memory only
    pub fn initialize_meta(&mut self, create_time: i64) {
        self.reset_positions();
        self.live = StripeMeta::fresh(self.geometry.content, create_time);
        let dir = Directory::new(self.geometry.segments, self.geometry.buckets);
        for c in &mut self.copies {
            c.head = Some(self.live);
            c.foot = Some(self.live);
            c.freelist = dir.freelist().to_vec();
        }
        self.directory = Some(dir);
        self.active = Some(CopyId::A);
    }

    /// Read the active copy's directory and freelist
    pub fn load_dir<A: Access>(&mut self, dev: &Device<A>) -> Result<&Directory> {
        let copy = self.active.ok_or_else(|| {
            Error::Consistency(format!("stripe {} has no active metadata copy", self.hash_text))
        })?;
        let c = &self.copies[copy.index()];
        let (segments, buckets) = (self.geometry.segments, self.geometry.buckets);
        let mut buf = AlignedBuffer::new(self.geometry.dir_region_len() as usize);
        dev.read_exact_at(c.head_pos + self.geometry.header_len, buf.as_mut_slice())?;
        let dir = Directory::from_parts(segments, buckets, buf.as_slice(), c.freelist.clone())?;
        debug!(stripe = %self.hash_text, %copy, entries = dir.len(), "directory loaded");
        Ok(self.directory.insert(dir))
    }

    fn image(&self) -> Result<MetaImage> {
        let dir = self.dir()?;
        let mut dir_bytes = dir.to_bytes();
        dir_bytes.resize(self.geometry.dir_region_len() as usize, 0);
        let mut foot = self.live.to_bytes().to_vec();
        foot.resize(STORE_BLOCK_SIZE as usize, 0);
        Ok(MetaImage {
            head: self
                .live
                .to_head_bytes(dir.freelist(), self.geometry.header_len as usize),
            dir: dir_bytes,
            foot,
        })
    }

    /// HEAD, then directory, then FOOT
    fn write_copy(&mut self, dev: &Device<ReadWrite>, copy: CopyId, image: &MetaImage) -> Result<()> {
        let c = &self.copies[copy.index()];
        let (head_pos, foot_pos) = (c.head_pos, c.foot_pos);
        write_aligned(dev, head_pos, &image.head)?;
        write_aligned(dev, head_pos + self.geometry.header_len, &image.dir)?;
        write_aligned(dev, foot_pos, &image.foot)?;

        let freelist = self.dir()?.freelist().to_vec();
        let c = &mut self.copies[copy.index()];
        c.head = Some(self.live);
        c.foot = Some(self.live);
        c.freelist = freelist;
        Ok(())
    }

    /// Write both metadata copies, A first
    pub fn update_header_footer(&mut self, dev: &Device<ReadWrite>) -> Result<()> {
        self.reset_positions();
        let image = self.image()?;
        for copy in CopyId::ALL {
            self.write_copy(dev, copy, &image)?;
        }
        self.active = Some(CopyId::A);
        info!(
            stripe = %self.hash_text,
            segments = self.geometry.segments,
            buckets = self.geometry.buckets,
            "stripe metadata written"
        );
        Ok(())
    }

    /// Persist the directory into the copy chosen by the new serial,
    /// leaving the other copy intact
    pub fn sync_dir(&mut self, dev: &Device<ReadWrite>) -> Result<CopyId> {
        self.live.sync_serial = self.live.sync_serial.wrapping_add(1);
        self.live.dirty = 0;
        let copy = CopyId::for_serial(self.live.sync_serial);
        let image = self.image()?;
        self.write_copy(dev, copy, &image)?;
        self.active = Some(copy);
        info!(stripe = %self.hash_text, %copy, serial = self.live.sync_serial, "directory synced");
        Ok(copy)
    }

    /// Zero the four metadata blocks
    pub fn clear(&mut self, dev: &Device<ReadWrite>) -> Result<()> {
        let zero = vec![0u8; STORE_BLOCK_SIZE as usize];
        let end = self.end();
        for c in &self.copies {
            for pos in [c.head_pos, c.foot_pos] {
                if pos + STORE_BLOCK_SIZE <= end {
                    write_aligned(dev, pos, &zero)?;
                }
            }
        }
        for c in &mut self.copies {
            c.forget();
        }
        self.active = None;
        self.directory = None;
        self.live = StripeMeta::default();
        debug!(stripe = %self.hash_text, "stripe metadata cleared");
        Ok(())
    }

    /// Look `key` up in the loaded directory
    pub fn probe(&self, key: &CacheKey) -> Result<Option<ProbeHit>> {
        let cursor = self.cursor();
        Ok(self.dir()?.probe(key, &cursor).map(|location| ProbeHit {
            location,
            offset: self.fragment_offset(&location.entry),
            size: location.entry.approx_size(),
        }))
    }

    /// Read the fragment a probe found
    pub fn read_fragment<A: Access>(&self, dev: &Device<A>, hit: &ProbeHit) -> Result<Fragment> {
        let len = hit.size.min(self.end().saturating_sub(hit.offset)) as usize;
        if len < Doc::SIZE {
            return Err(Error::Truncated {
                what: "fragment",
                need: Doc::SIZE,
                have: len,
            });
        }
        let mut buf = AlignedBuffer::new(align_up(len as u64, CACHE_BLOCK_SIZE) as usize);
        let n = dev.read_at(hit.offset, buf.as_mut_slice())?;
        let bytes = Bytes::copy_from_slice(&buf.as_slice()[..n.min(len)]);
        let doc = Doc::from_bytes(&bytes)?;
        Ok(Fragment { doc, bytes })
    }

    /// Append a single-fragment object at the write cursor and enter it in
    /// the directory
    pub fn write_doc(&mut self, dev: &Device<ReadWrite>, key: &CacheKey, header: &[u8], data: &[u8]) -> Result<ProbeHit> {
        self.dir()?;
        let (doc_len, hlen) = doc_lengths(header.len(), data.len())?;
        let len = align_up(u64::from(doc_len), CACHE_BLOCK_SIZE);
        let pos = self.live.write_pos;
        if pos + len > self.end() {
            return Err(Error::StripeFull {
                stripe: self.hash_text.clone(),
                need: len,
            });
        }

        let doc = Doc {
            magic: DOC_MAGIC,
            len: doc_len,
            total_len: data.len() as u64,
            first_key: *key,
            key: *key,
            hlen,
            doc_type: 1,
            v_major: CACHE_DB_MAJOR_VERSION as u8,
            v_minor: 0,
            sync_serial: self.live.sync_serial,
            write_serial: self.live.write_serial,
            pinned: 0,
            checksum: 0,
        };
        let mut buf = AlignedBuffer::new(len as usize);
        let out = buf.as_mut_slice();
        out[..Doc::SIZE].copy_from_slice(&doc.to_bytes());
        out[Doc::SIZE..Doc::SIZE + header.len()].copy_from_slice(header);
        out[Doc::SIZE + header.len()..doc_len as usize].copy_from_slice(data);
        dev.write_at(pos, buf.as_slice())?;

        let block = (pos - self.geometry.content) / CACHE_BLOCK_SIZE + 1;
        let entry = DirEntry::fragment(block, len, self.live.phase, true)?;
        let location = self.dir_mut()?.insert(key, entry)?;

        self.live.last_write_pos = pos;
        self.live.write_pos = pos + len;
        self.live.agg_pos = self.live.write_pos;
        self.live.write_serial = self.live.write_serial.wrapping_add(1);
        self.live.dirty = 1;
        Ok(ProbeHit {
            location,
            offset: pos,
            size: location.entry.approx_size(),
        })
    }

    pub fn insert(&mut self, key: &CacheKey, entry: DirEntry) -> Result<DirLocation> {
        let location = self.dir_mut()?.insert(key, entry)?;
        self.live.dirty = 1;
        Ok(location)
    }

    pub fn delete(&mut self, key: &CacheKey, offset: u64) -> Result<bool> {
        let removed = self.dir_mut()?.delete(key, offset);
        if removed {
            self.live.dirty = 1;
        }
        Ok(removed)
    }

    /// Drop stale entries from every chain, resetting looping segments
    pub fn walk_bucket_chains(&mut self) -> Result<ChainReport> {
        let cursor = self.cursor();
        let dir = self.dir_mut()?;
        let mut report = ChainReport::default();
        for s in 0..dir.segments() {
            let ChainWalk { cleaned, reset } = dir.walk_bucket_chain(s, &cursor);
            report.cleaned += cleaned;
            if reset {
                report.reset.push(s);
            }
        }
        if report.changed() {
            self.live.dirty = 1;
        }
        Ok(report)
    }

    /// Detect and repair freelist loops in every segment
    pub fn check_freelists(&mut self) -> Result<FreelistReport> {
        let dir = self.dir_mut()?;
        let mut report = FreelistReport::default();
        for s in 0..dir.segments() {
            if dir.check_loop(s) {
                report.repaired.push(s);
            }
            report.lengths.push(dir.freelist_scan(s).len);
        }
        if !report.repaired.is_empty() {
            self.live.dirty = 1;
        }
        Ok(report)
    }

    /// Read-only directory audit
    pub fn dir_check(&self) -> Result<DirCheckReport> {
        let cursor = self.cursor();
        Ok(self.dir()?.check(&cursor))
    }
}

fn write_aligned(dev: &Device<ReadWrite>, pos: u64, data: &[u8]) -> Result<()> {
    let mut buf = AlignedBuffer::new(data.len());
    buf.copy_from(data);
    dev.write_at(pos, buf.as_slice())
}
