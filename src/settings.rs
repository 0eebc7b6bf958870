//! Run configuration for backup exports.

use crate::error::{ExportError, Result};
use serde::Deserialize;

/// Settings for one backup export run.
///
/// All fields have defaults so a partial TOML document is accepted.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackupSettings {
    /// Force a full export every N backups. 0 disables forcing; otherwise
    /// a run is forced full once the accumulated chain length has reached
    /// this value.
    pub full_interval: u32,

    /// Prefer the NBD block transport over the bulk HTTP export.
    pub prefer_nbd: bool,

    /// Number of parallel NBD data channels per disk export.
    pub nbd_concurrency: usize,

    /// Insert a structural validation stage on every VHD disk stream.
    pub validate_vhd_streams: bool,

    /// Transfer rate limit in bytes per second, shared across all disk
    /// streams of a run. 0 means unlimited.
    pub throttle_bytes_per_sec: u64,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            full_interval: 0,
            prefer_nbd: false,
            nbd_concurrency: 1,
            validate_vhd_streams: false,
            throttle_bytes_per_sec: 0,
        }
    }
}

impl BackupSettings {
    /// Parse settings from a TOML document.
    pub fn from_toml(doc: &str) -> Result<Self> {
        let settings: Self =
            toml::from_str(doc).map_err(|e| ExportError::Config(e.to_string()))?;
        if settings.nbd_concurrency == 0 {
            return Err(ExportError::Config(
                "nbd_concurrency must be at least 1".into(),
            ));
        }
        Ok(settings)
    }
}
