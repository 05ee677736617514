//! Block units
//!
//! On-disk sizes are counted in several block sizes at once. Keeping the
//! scale in the type stops a store-block count from being mixed up with a
//! stripe-block count.
//!
//! ```text
//! CacheBlocks   512 B     directory entry offsets, fragment sizes
//! StoreBlocks   8 KiB     metadata regions, stripe lengths
//! StripeBlocks  128 MiB   volume allocation granularity
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

/// A count of `SCALE`-byte blocks
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Blocks<const SCALE: u64>(u64);

/// 512 byte blocks
pub type CacheBlocks = Blocks<512>;
/// 8 KiB blocks
pub type StoreBlocks = Blocks<{ 8 * 1024 }>;
/// 128 MiB blocks
pub type StripeBlocks = Blocks<{ 128 * 1024 * 1024 }>;

impl<const SCALE: u64> Blocks<SCALE> {
    /// Bytes per block
    pub const SCALE: u64 = SCALE;

    #[must_use]
    pub const fn new(count: u64) -> Self {
        Self(count)
    }

    #[must_use]
    pub const fn count(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn bytes(self) -> u64 {
        self.0 * SCALE
    }

    /// Smallest block count covering `bytes`
    #[must_use]
    pub const fn round_up(bytes: u64) -> Self {
        Self(bytes.div_ceil(SCALE))
    }

    /// Largest block count contained in `bytes`
    #[must_use]
    pub const fn round_down(bytes: u64) -> Self {
        Self(bytes / SCALE)
    }

    /// Re-express in another unit, rounding up
    #[must_use]
    pub const fn convert_up<const OTHER: u64>(self) -> Blocks<OTHER> {
        Blocks::<OTHER>::round_up(self.bytes())
    }

    /// Re-express in another unit, rounding down
    #[must_use]
    pub const fn convert_down<const OTHER: u64>(self) -> Blocks<OTHER> {
        Blocks::<OTHER>::round_down(self.bytes())
    }

    #[must_use]
    pub const fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

/// Round `bytes` up to a multiple of `align`
#[must_use]
pub const fn align_up(bytes: u64, align: u64) -> u64 {
    bytes.div_ceil(align) * align
}

/// Round `bytes` down to a multiple of `align`
#[must_use]
pub const fn align_down(bytes: u64, align: u64) -> u64 {
    bytes / align * align
}

impl<const SCALE: u64> Add for Blocks<SCALE> {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl<const SCALE: u64> AddAssign for Blocks<SCALE> {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl<const SCALE: u64> Sub for Blocks<SCALE> {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self(self.0 - rhs.0)
    }
}

impl<const SCALE: u64> SubAssign for Blocks<SCALE> {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

impl<const SCALE: u64> fmt::Debug for Blocks<SCALE> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}B", self.0, SCALE)
    }
}

impl<const SCALE: u64> fmt::Display for Blocks<SCALE> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = match SCALE {
            512 => "cache blocks",
            8192 => "store blocks",
            134_217_728 => "stripe blocks",
            _ => "blocks",
        };
        write!(f, "{} {unit}", self.0)
    }
}
