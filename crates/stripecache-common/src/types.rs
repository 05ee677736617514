//! Core type definitions for StripeCache
//!
//! Content keys and volume identifiers shared by the storage and
//! placement crates.

use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Volume index used by stripe descriptors. Zero means "free".
pub type VolumeId = u8;

/// Highest valid volume index
pub const MAX_VOLUME_IDX: VolumeId = 255;

/// 128-bit content key (MD5 digest of the cache key material)
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into)]
pub struct CacheKey([u8; 16]);

impl CacheKey {
    /// Wrap raw digest bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Hash arbitrary bytes into a key
    #[must_use]
    pub fn digest(data: impl AsRef<[u8]>) -> Self {
        Self(md5::compute(data).0)
    }

    /// Key for a URL as the cache computes it: the URL bytes followed
    /// by the port as a little-endian `i32`
    #[must_use]
    pub fn for_url(url: &str, port: i32) -> Self {
        let mut ctx = md5::Context::new();
        ctx.consume(url.as_bytes());
        ctx.consume(port.to_le_bytes());
        Self(ctx.compute().0)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// 32-bit little-endian word `i` (0..4)
    #[must_use]
    pub const fn slice32(&self, i: usize) -> u32 {
        let b = &self.0;
        let o = i * 4;
        u32::from_le_bytes([b[o], b[o + 1], b[o + 2], b[o + 3]])
    }

    /// 64-bit little-endian word `i` (0..2)
    #[must_use]
    pub const fn slice64(&self, i: usize) -> u64 {
        (self.slice32(i * 2) as u64) | ((self.slice32(i * 2 + 1) as u64) << 32)
    }

    /// Fold the key to 64 bits
    #[must_use]
    pub const fn fold(&self) -> u64 {
        self.slice64(0) ^ self.slice64(1)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", hex::encode(self.0))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slices() {
        let mut bytes = [0u8; 16];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = i as u8;
        }
        let key = CacheKey::from_bytes(bytes);
        assert_eq!(key.slice32(0), 0x0302_0100);
        assert_eq!(key.slice32(3), 0x0f0e_0d0c);
        assert_eq!(key.slice64(1), 0x0f0e_0d0c_0b0a_0908);
        assert_eq!(key.fold(), 0x0706_0504_0302_0100 ^ 0x0f0e_0d0c_0b0a_0908);
    }

    #[test]
    fn test_digest_known_value() {
        let key = CacheKey::digest(b"");
        assert_eq!(key.to_string(), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn test_url_key_includes_port() {
        let a = CacheKey::for_url("http://example.com/", 80);
        let b = CacheKey::for_url("http://example.com/", 8080);
        assert_ne!(a, b);
        assert_eq!(a, CacheKey::for_url("http://example.com/", 80));
    }
}
