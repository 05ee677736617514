//! Configuration types for StripeCache
//!
//! These are the already-parsed span and volume records the storage core
//! consumes. The tool reads them from a TOML file:
//!
//! ```toml
//! average_object_size = 8000
//!
//! [[spans]]
//! path = "/dev/sdb"
//!
//! [[volumes]]
//! volume = 1
//! size = { percent = 60 }
//!
//! [[volumes]]
//! volume = 2
//! size = { megabytes = 4096 }
//! ```

use crate::error::{Error, Result};
use crate::types::VolumeId;
use crate::units::StripeBlocks;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default average object size used to size stripe directories
pub const ESTIMATED_OBJECT_SIZE: u64 = 8000;

/// Root configuration for the cache tool
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolConfig {
    /// Average object size in bytes; drives directory sizing
    #[serde(default = "default_average_object_size")]
    pub average_object_size: u64,
    /// Devices making up the cache
    #[serde(default)]
    pub spans: Vec<SpanConfig>,
    /// Volume capacity targets
    #[serde(default)]
    pub volumes: Vec<VolumeConfig>,
}

const fn default_average_object_size() -> u64 {
    ESTIMATED_OBJECT_SIZE
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            average_object_size: ESTIMATED_OBJECT_SIZE,
            spans: Vec::new(),
            volumes: Vec::new(),
        }
    }
}

impl ToolConfig {
    /// Parse a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| Error::configuration(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and parse a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::device(path, "read configuration", e))?;
        Self::from_toml_str(&text)
    }

    /// Check the records are usable. Percentages over 100 in total are
    /// allowed here and reported by the allocator.
    pub fn validate(&self) -> Result<()> {
        if self.average_object_size == 0 {
            return Err(Error::configuration("average_object_size must be positive"));
        }
        for span in &self.spans {
            if let Some(v) = span.volume
                && v == 0
            {
                return Err(Error::configuration(format!(
                    "span {} has invalid volume index 0",
                    span.path.display()
                )));
            }
        }
        let mut seen = Vec::with_capacity(self.volumes.len());
        for vol in &self.volumes {
            vol.validate()?;
            if seen.contains(&vol.volume) {
                return Err(Error::configuration(format!(
                    "volume {} configured more than once",
                    vol.volume
                )));
            }
            seen.push(vol.volume);
        }
        Ok(())
    }

    /// Sum of the percentage targets
    #[must_use]
    pub fn total_percent(&self) -> u32 {
        self.volumes
            .iter()
            .filter_map(|v| match v.size {
                VolumeSize::Percent(p) => Some(u32::from(p)),
                VolumeSize::Megabytes(_) => None,
            })
            .sum()
    }
}

/// A span (device) entry
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpanConfig {
    /// Device or file path
    pub path: PathBuf,
    /// Force the span into a volume
    #[serde(default)]
    pub volume: Option<VolumeId>,
}

impl SpanConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            volume: None,
        }
    }
}

/// Target size of a volume
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VolumeSize {
    /// Absolute size in megabytes
    Megabytes(u64),
    /// Share of the total configured span capacity
    Percent(u8),
}

/// A volume entry
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeConfig {
    /// Volume index, 1 through `MAX_VOLUME_IDX`
    pub volume: VolumeId,
    /// Target size
    pub size: VolumeSize,
}

impl VolumeConfig {
    #[must_use]
    pub const fn percent(volume: VolumeId, percent: u8) -> Self {
        Self {
            volume,
            size: VolumeSize::Percent(percent),
        }
    }

    #[must_use]
    pub const fn megabytes(volume: VolumeId, megabytes: u64) -> Self {
        Self {
            volume,
            size: VolumeSize::Megabytes(megabytes),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.volume == 0 {
            return Err(Error::configuration(format!(
                "invalid volume index {}",
                self.volume
            )));
        }
        match self.size {
            VolumeSize::Percent(p) if p == 0 || p > 100 => Err(Error::configuration(format!(
                "volume {} has invalid percentage {p}",
                self.volume
            ))),
            VolumeSize::Megabytes(0) => Err(Error::configuration(format!(
                "volume {} has zero size",
                self.volume
            ))),
            _ => Ok(()),
        }
    }

    /// Absolute allocation target given the total configured capacity
    #[must_use]
    pub fn resolve(&self, total: StripeBlocks) -> StripeBlocks {
        match self.size {
            VolumeSize::Percent(p) => StripeBlocks::new((total.count() * u64::from(p)).div_ceil(100)),
            VolumeSize::Megabytes(mb) => StripeBlocks::round_up(mb * 1024 * 1024),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_toml() {
        let text = r#"
            average_object_size = 16000

            [[spans]]
            path = "/dev/sdb"

            [[spans]]
            path = "/dev/sdc"
            volume = 2

            [[volumes]]
            volume = 1
            size = { percent = 60 }

            [[volumes]]
            volume = 2
            size = { megabytes = 4096 }
        "#;
        let config = ToolConfig::from_toml_str(text).unwrap();
        assert_eq!(config.average_object_size, 16000);
        assert_eq!(config.spans.len(), 2);
        assert_eq!(config.spans[1].volume, Some(2));
        assert_eq!(config.volumes[0], VolumeConfig::percent(1, 60));
        assert_eq!(config.volumes[1], VolumeConfig::megabytes(2, 4096));
        assert_eq!(config.total_percent(), 60);
    }

    #[test]
    fn test_defaults() {
        let config = ToolConfig::from_toml_str("").unwrap();
        assert_eq!(config.average_object_size, ESTIMATED_OBJECT_SIZE);
        assert!(config.spans.is_empty());
    }

    #[test]
    fn test_rejects_bad_volumes() {
        assert!(VolumeConfig::percent(0, 10).validate().is_err());
        assert!(VolumeConfig::percent(1, 0).validate().is_err());
        assert!(VolumeConfig::percent(1, 101).validate().is_err());
        assert!(VolumeConfig::megabytes(1, 0).validate().is_err());

        let dup = ToolConfig {
            volumes: vec![VolumeConfig::percent(1, 10), VolumeConfig::percent(1, 20)],
            ..ToolConfig::default()
        };
        assert!(dup.validate().is_err());
    }

    #[test]
    fn test_resolve() {
        let total = StripeBlocks::new(80);
        assert_eq!(VolumeConfig::percent(1, 100).resolve(total).count(), 80);
        // 80 * 33 / 100 = 26.4, rounded up
        assert_eq!(VolumeConfig::percent(1, 33).resolve(total).count(), 27);
        // 200 MB is one and a half stripe blocks
        assert_eq!(VolumeConfig::megabytes(1, 200).resolve(total).count(), 2);
    }
}
