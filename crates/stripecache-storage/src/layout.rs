//! On-disk layout definitions
//!
//! Span Layout:
//! ```text
//! +------------------+  offset 0
//! |    Reserved      |  1 store block, never touched
//! +------------------+  SPAN_HEADER_OFFSET (8 KiB)
//! |   Span Header    |  magic, counts, stripe descriptor table
//! +------------------+  span offset (header rounded up to store blocks)
//! |    Stripe 0      |  see below
//! +------------------+
//! |    Stripe 1..    |
//! +------------------+
//! ```
//!
//! Stripe Layout:
//! ```text
//! +------------------+  start
//! |  A head + free   |  StripeMeta followed by one freelist head per segment
//! |  A directory     |  segments x buckets x DIR_DEPTH entries, 10 bytes each
//! |  A foot          |  StripeMeta, 1 store block
//! +------------------+  start + dirlen
//! |  B head + free   |
//! |  B directory     |
//! |  B foot          |
//! +------------------+  content = start + 2 * dirlen
//! |  Fragments       |  Doc records addressed by directory entries
//! +------------------+
//! ```
//!
//! All multi-byte fields are little-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use stripecache_common::{CacheKey, Error, Result, StoreBlocks, VolumeId, units::align_up};

/// Smallest unit of data-region addressing
pub const CACHE_BLOCK_SIZE: u64 = 512;

/// Unit of metadata layout
pub const STORE_BLOCK_SIZE: u64 = 8 * 1024;

/// Unit of volume allocation
pub const STRIPE_BLOCK_SIZE: u64 = 128 * 1024 * 1024;

/// Byte offset of the span header on the device
pub const SPAN_HEADER_OFFSET: u64 = STORE_BLOCK_SIZE;

/// Span header magic
pub const SPAN_MAGIC: u32 = 0xABCD_1237;

/// Stripe metadata magic
pub const STRIPE_META_MAGIC: u32 = 0xF1D0_F00D;

/// Metadata version written by this crate
pub const CACHE_DB_MAJOR_VERSION: u16 = 24;
pub const CACHE_DB_MINOR_VERSION: u16 = 1;

/// Highest minor version accepted on read
pub const MAX_ACCEPTED_MINOR_VERSION: u16 = 2;

/// Fragment (Doc) magic
pub const DOC_MAGIC: u32 = 0x5F12_9B13;

/// Default hardware sector size recorded in new metadata
pub const DEFAULT_SECTOR_SIZE: u32 = 512;

#[inline]
const fn round_to_store_block(bytes: u64) -> u64 {
    align_up(bytes, STORE_BLOCK_SIZE)
}

/// Stripe descriptor stored in the span header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StripeDescriptor {
    /// Byte offset of the stripe from the start of the device
    pub offset: u64,
    /// Stripe length
    pub len: StoreBlocks,
    /// Owning volume, 0 for free stripes
    pub vol_idx: VolumeId,
    /// 3-bit stripe type
    pub kind: u8,
    /// Free flag
    pub free: bool,
}

impl StripeDescriptor {
    /// Serialized size in bytes
    pub const SIZE: usize = 24;

    const TYPE_MASK: u32 = 0x7;
    const FREE_BIT: u32 = 1 << 3;

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.offset);
        buf.put_u64_le(self.len.count());
        buf.put_i32_le(i32::from(self.vol_idx));
        let mut bits = u32::from(self.kind) & Self::TYPE_MASK;
        if self.free {
            bits |= Self::FREE_BIT;
        }
        buf.put_u32_le(bits);
    }

    fn get(buf: &mut &[u8]) -> Result<Self> {
        let offset = buf.get_u64_le();
        let len = StoreBlocks::new(buf.get_u64_le());
        let raw_vol = buf.get_i32_le();
        let bits = buf.get_u32_le();

        let vol_idx = VolumeId::try_from(raw_vol)
            .map_err(|_| Error::format(format!("stripe descriptor volume index {raw_vol} out of range")))?;
        let free = bits & Self::FREE_BIT != 0;
        if free != (vol_idx == 0) {
            return Err(Error::format(format!(
                "stripe descriptor at {offset}: free flag {free} does not match volume {vol_idx}"
            )));
        }

        Ok(Self {
            offset,
            len,
            vol_idx,
            kind: (bits & Self::TYPE_MASK) as u8,
            free,
        })
    }
}

/// Span header stored at `SPAN_HEADER_OFFSET`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpanHeader {
    /// Number of distinct volumes among used stripes
    pub num_volumes: u32,
    pub num_free: u32,
    pub num_used: u32,
    /// Span length
    pub num_blocks: StoreBlocks,
    pub stripes: Vec<StripeDescriptor>,
}

impl SpanHeader {
    /// Size of the fixed fields
    pub const FIXED_SIZE: usize = 32;

    /// Size of the header record as laid out with one inline descriptor
    pub const BASE_SIZE: usize = Self::FIXED_SIZE + StripeDescriptor::SIZE;

    /// On-disk size, rounded to store blocks, of a header with `n` descriptors
    #[must_use]
    pub const fn size_for(n: usize) -> u64 {
        let n = if n == 0 { 1 } else { n };
        round_to_store_block((Self::BASE_SIZE + (n - 1) * StripeDescriptor::SIZE) as u64)
    }

    /// On-disk size of this header
    #[must_use]
    pub fn size(&self) -> u64 {
        Self::size_for(self.stripes.len())
    }

    /// Number of descriptors claimed by a raw header block, when the magic
    /// and counts check out. Used to decide whether a second read is needed.
    pub fn peek_descriptor_count(data: &[u8]) -> Result<usize> {
        if data.len() < Self::FIXED_SIZE {
            return Err(Error::Truncated {
                what: "span header",
                need: Self::FIXED_SIZE,
                have: data.len(),
            });
        }
        let mut buf = data;
        let magic = buf.get_u32_le();
        if magic != SPAN_MAGIC {
            return Err(Error::BadMagic {
                what: "span header",
                expected: SPAN_MAGIC,
                found: magic,
            });
        }
        let _num_volumes = buf.get_u32_le();
        let num_free = buf.get_u32_le();
        let num_used = buf.get_u32_le();
        let num_diskvol_blks = buf.get_u32_le();
        if u64::from(num_diskvol_blks) != u64::from(num_used) + u64::from(num_free) {
            return Err(Error::format(format!(
                "span header counts inconsistent: {num_diskvol_blks} descriptors, {num_used} used + {num_free} free"
            )));
        }
        Ok(num_diskvol_blks as usize)
    }

    /// Serialize, padded to `size()`
    pub fn to_bytes(&self) -> Bytes {
        let size = self.size() as usize;
        let mut buf = BytesMut::with_capacity(size);

        buf.put_u32_le(SPAN_MAGIC);
        buf.put_u32_le(self.num_volumes);
        buf.put_u32_le(self.num_free);
        buf.put_u32_le(self.num_used);
        buf.put_u32_le(self.stripes.len() as u32);
        buf.put_u32_le(0);
        buf.put_u64_le(self.num_blocks.count());
        for sd in &self.stripes {
            sd.put(&mut buf);
        }

        buf.resize(size, 0);
        buf.freeze()
    }

    /// Parse a header. `data` must hold the whole descriptor table.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let n = Self::peek_descriptor_count(data)?;
        let need = Self::FIXED_SIZE + n * StripeDescriptor::SIZE;
        if data.len() < need {
            return Err(Error::Truncated {
                what: "span descriptor table",
                need,
                have: data.len(),
            });
        }

        let mut buf = &data[4..];
        let num_volumes = buf.get_u32_le();
        let num_free = buf.get_u32_le();
        let num_used = buf.get_u32_le();
        let _num_diskvol_blks = buf.get_u32_le();
        let _pad = buf.get_u32_le();
        let num_blocks = StoreBlocks::new(buf.get_u64_le());

        let mut stripes = Vec::with_capacity(n);
        for _ in 0..n {
            stripes.push(StripeDescriptor::get(&mut buf)?);
        }

        Ok(Self {
            num_volumes,
            num_free,
            num_used,
            num_blocks,
            stripes,
        })
    }
}

/// Metadata format version
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
}

impl Version {
    pub const CURRENT: Self = Self {
        major: CACHE_DB_MAJOR_VERSION,
        minor: CACHE_DB_MINOR_VERSION,
    };

    /// Whether a stripe written with this version can be read
    #[must_use]
    pub const fn is_supported(self) -> bool {
        self.major <= CACHE_DB_MAJOR_VERSION && self.minor <= MAX_ACCEPTED_MINOR_VERSION
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Stripe metadata record (one HEAD or FOOT instance)
///
/// Positions are absolute byte offsets on the device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StripeMeta {
    pub magic: u32,
    pub version: Version,
    /// Creation time (Unix seconds)
    pub create_time: i64,
    pub write_pos: u64,
    pub last_write_pos: u64,
    pub agg_pos: u64,
    pub generation: u32,
    pub phase: bool,
    /// Number of times the write cursor wrapped
    pub cycle: u32,
    pub sync_serial: u32,
    pub write_serial: u32,
    pub dirty: u32,
    pub sector_size: u32,
}

impl StripeMeta {
    /// Size of the record including the inline first freelist slot
    pub const SIZE: usize = 80;

    /// Offset of the per-segment freelist heads in a HEAD block
    pub const FREELIST_OFFSET: usize = 72;

    /// A fresh record with all cursors at `content`
    #[must_use]
    pub fn fresh(content: u64, create_time: i64) -> Self {
        Self {
            magic: STRIPE_META_MAGIC,
            version: Version::CURRENT,
            create_time,
            write_pos: content,
            last_write_pos: content,
            agg_pos: content,
            generation: 0,
            phase: false,
            cycle: 0,
            sync_serial: 0,
            write_serial: 0,
            dirty: 0,
            sector_size: DEFAULT_SECTOR_SIZE,
        }
    }

    /// Magic and version check applied to every candidate block
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.magic == STRIPE_META_MAGIC && self.version.is_supported()
    }

    /// Length of the HEAD region: record plus one freelist head per segment
    #[must_use]
    pub const fn header_len(segments: usize) -> u64 {
        let extra = if segments == 0 { 0 } else { segments - 1 };
        round_to_store_block((Self::SIZE + 2 * extra) as u64)
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        self.put(&mut buf);
        buf.resize(Self::SIZE, 0);
        buf.freeze()
    }

    /// Serialize a HEAD region of `len` bytes with the freelist heads
    /// packed after the fixed fields
    pub fn to_head_bytes(&self, freelist: &[u16], len: usize) -> Bytes {
        let total = len
            .max(Self::SIZE)
            .max(Self::FREELIST_OFFSET + 2 * freelist.len());
        let mut buf = BytesMut::with_capacity(total);
        self.put(&mut buf);
        debug_assert_eq!(buf.len(), Self::FREELIST_OFFSET);
        for head in freelist {
            buf.put_u16_le(*head);
        }
        buf.resize(total, 0);
        buf.freeze()
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.magic);
        buf.put_u16_le(self.version.major);
        buf.put_u16_le(self.version.minor);
        buf.put_i64_le(self.create_time);
        buf.put_u64_le(self.write_pos);
        buf.put_u64_le(self.last_write_pos);
        buf.put_u64_le(self.agg_pos);
        buf.put_u32_le(self.generation);
        buf.put_u32_le(u32::from(self.phase));
        buf.put_u32_le(self.cycle);
        buf.put_u32_le(self.sync_serial);
        buf.put_u32_le(self.write_serial);
        buf.put_u32_le(self.dirty);
        buf.put_u32_le(self.sector_size);
        buf.put_u32_le(0);
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::FREELIST_OFFSET {
            return Err(Error::Truncated {
                what: "stripe metadata",
                need: Self::FREELIST_OFFSET,
                have: data.len(),
            });
        }
        let mut buf = data;
        let meta = Self {
            magic: buf.get_u32_le(),
            version: Version {
                major: buf.get_u16_le(),
                minor: buf.get_u16_le(),
            },
            create_time: buf.get_i64_le(),
            write_pos: buf.get_u64_le(),
            last_write_pos: buf.get_u64_le(),
            agg_pos: buf.get_u64_le(),
            generation: buf.get_u32_le(),
            phase: buf.get_u32_le() != 0,
            cycle: buf.get_u32_le(),
            sync_serial: buf.get_u32_le(),
            write_serial: buf.get_u32_le(),
            dirty: buf.get_u32_le(),
            sector_size: buf.get_u32_le(),
        };
        Ok(meta)
    }

    /// Read the freelist heads that follow a HEAD record
    pub fn freelist_from_head(data: &[u8], segments: usize) -> Result<Vec<u16>> {
        let need = Self::FREELIST_OFFSET + 2 * segments;
        if data.len() < need {
            return Err(Error::Truncated {
                what: "stripe freelist",
                need,
                have: data.len(),
            });
        }
        let mut buf = &data[Self::FREELIST_OFFSET..need];
        Ok((0..segments).map(|_| buf.get_u16_le()).collect())
    }
}

/// Fragment preamble
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Doc {
    pub magic: u32,
    /// Fragment length including preamble and header, unrounded
    pub len: u32,
    /// Total length of the object
    pub total_len: u64,
    pub first_key: CacheKey,
    pub key: CacheKey,
    /// Length of the opaque header following the preamble
    pub hlen: u32,
    pub doc_type: u8,
    pub v_major: u8,
    pub v_minor: u8,
    pub sync_serial: u32,
    pub write_serial: u32,
    /// Pinned until (Unix seconds)
    pub pinned: u32,
    pub checksum: u32,
}

impl Doc {
    pub const SIZE: usize = 72;

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(Error::Truncated {
                what: "doc preamble",
                need: Self::SIZE,
                have: data.len(),
            });
        }
        let mut buf = data;
        let magic = buf.get_u32_le();
        if magic != DOC_MAGIC {
            return Err(Error::BadMagic {
                what: "doc",
                expected: DOC_MAGIC,
                found: magic,
            });
        }
        let len = buf.get_u32_le();
        let total_len = buf.get_u64_le();
        let mut first_key = [0u8; 16];
        buf.copy_to_slice(&mut first_key);
        let mut key = [0u8; 16];
        buf.copy_to_slice(&mut key);
        let hlen = buf.get_u32_le();
        let doc_type = buf.get_u8();
        let v_major = buf.get_u8();
        let v_minor = buf.get_u8();
        let _unused = buf.get_u8();

        let doc = Self {
            magic,
            len,
            total_len,
            first_key: CacheKey::from_bytes(first_key),
            key: CacheKey::from_bytes(key),
            hlen,
            doc_type,
            v_major,
            v_minor,
            sync_serial: buf.get_u32_le(),
            write_serial: buf.get_u32_le(),
            pinned: buf.get_u32_le(),
            checksum: buf.get_u32_le(),
        };

        if (doc.len as usize) < doc.prefix_len() {
            return Err(Error::format(format!(
                "doc length {} shorter than its prefix {}",
                doc.len,
                doc.prefix_len()
            )));
        }
        Ok(doc)
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u32_le(self.magic);
        buf.put_u32_le(self.len);
        buf.put_u64_le(self.total_len);
        buf.put_slice(self.first_key.as_bytes());
        buf.put_slice(self.key.as_bytes());
        buf.put_u32_le(self.hlen);
        buf.put_u8(self.doc_type);
        buf.put_u8(self.v_major);
        buf.put_u8(self.v_minor);
        buf.put_u8(0);
        buf.put_u32_le(self.sync_serial);
        buf.put_u32_le(self.write_serial);
        buf.put_u32_le(self.pinned);
        buf.put_u32_le(self.checksum);
        buf.freeze()
    }

    /// Preamble plus header length
    #[must_use]
    pub const fn prefix_len(&self) -> usize {
        Self::SIZE + self.hlen as usize
    }

    /// Bytes of object data in this fragment
    #[must_use]
    pub const fn data_len(&self) -> usize {
        (self.len as usize).saturating_sub(self.prefix_len())
    }

    /// Whether this fragment holds the entire object
    #[must_use]
    pub const fn single_fragment(&self) -> bool {
        self.data_len() as u64 == self.total_len
    }
}
