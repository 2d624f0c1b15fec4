//! Cache configuration.
//!
//! A [`CacheConfig`] is built once at startup and shared by reference with
//! every session. It carries the netfs registration record that identifies
//! this filesystem client inside the backend store, plus the tunables of the
//! page-marker sweeps.
//!
//! # Example
//!
//! ```
//! use netcache::CacheConfig;
//!
//! let config = CacheConfig::from_json(r#"{
//!     "enabled": true,
//!     "netfs": { "name": "cephfs", "version": 1 },
//!     "uncache_batch": 32,
//!     "uncache_pause": "1ms"
//! }"#).unwrap();
//!
//! assert_eq!(config.netfs.name, "cephfs");
//! assert_eq!(config.uncache_batch, 32);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default netfs name registered with the backend.
pub const DEFAULT_NETFS_NAME: &str = "netcache";

/// Default number of pages handled per marker-sweep batch.
pub const DEFAULT_UNCACHE_BATCH: usize = 14;

/// Process-wide netfs registration record.
///
/// The backend keys every session index object under this record. Bumping
/// `version` invalidates everything previously stored under the same name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetfsDefinition {
    /// Name of the network filesystem.
    pub name: String,
    /// Layout version of the cached data.
    pub version: u32,
}

impl NetfsDefinition {
    /// Create a registration record.
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl Default for NetfsDefinition {
    fn default() -> Self {
        Self::new(DEFAULT_NETFS_NAME, 0)
    }
}

/// Configuration for the cache coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether sessions should use the cache at all.
    pub enabled: bool,
    /// Registration record for this filesystem client.
    pub netfs: NetfsDefinition,
    /// Pages handled per batch when sweeping cache markers.
    pub uncache_batch: usize,
    /// Pause between sweep batches. Zero yields the thread instead.
    #[serde(with = "humantime_serde")]
    pub uncache_pause: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            netfs: NetfsDefinition::default(),
            uncache_batch: DEFAULT_UNCACHE_BATCH,
            uncache_pause: Duration::ZERO,
        }
    }
}

impl CacheConfig {
    /// Configuration with caching switched off.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Parse and validate a JSON configuration.
    ///
    /// Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every value is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.uncache_batch == 0 {
            return Err(ConfigError::Invalid {
                field: "uncache_batch",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.netfs.name.is_empty() {
            return Err(ConfigError::Invalid {
                field: "netfs.name",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}
