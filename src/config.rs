//! Data store configuration
//!
//! Read once by [`DataStores::init_data_stores`](crate::DataStores::init_data_stores)
//! and immutable afterwards.
//!
//! ```toml
//! base_path = "/var/lib/arrays/datastores"
//! min_alloc_size = 512
//! sync_interval_ms = 1000
//! ```

use crate::error::{DataStoreError, Result};
use crate::header::CHUNK_HEADER_SIZE;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default smallest chunk handed out by a data store
pub const DEFAULT_MIN_ALLOC_SIZE: u64 = 512;

fn default_min_alloc_size() -> u64 {
    DEFAULT_MIN_ALLOC_SIZE
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataStoresConfig {
    /// Directory holding one `<guid>.data` / `<guid>.data.fl` pair per store
    pub base_path: PathBuf,

    /// Smallest chunk size, header included. Must be a power of two larger
    /// than the chunk header.
    #[serde(default = "default_min_alloc_size")]
    pub min_alloc_size: u64,

    /// Background flush interval in milliseconds; 0 disables the flusher
    #[serde(default)]
    pub sync_interval_ms: u64,
}

impl DataStoresConfig {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        DataStoresConfig {
            base_path: base_path.as_ref().to_path_buf(),
            min_alloc_size: DEFAULT_MIN_ALLOC_SIZE,
            sync_interval_ms: 0,
        }
    }

    /// Set the minimum allocation size
    pub fn min_alloc_size(mut self, size: u64) -> Self {
        self.min_alloc_size = size;
        self
    }

    /// Set the background flush interval (zero disables it)
    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Background flush interval, if enabled
    pub fn sync_interval_duration(&self) -> Option<Duration> {
        (self.sync_interval_ms > 0).then(|| Duration::from_millis(self.sync_interval_ms))
    }

    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: DataStoresConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_path.as_os_str().is_empty() {
            return Err(DataStoreError::InvalidConfig(
                "base_path must not be empty".to_string(),
            ));
        }

        if !self.min_alloc_size.is_power_of_two() {
            return Err(DataStoreError::InvalidConfig(format!(
                "min_alloc_size ({}) must be a power of two",
                self.min_alloc_size
            )));
        }

        if self.min_alloc_size <= CHUNK_HEADER_SIZE as u64 {
            return Err(DataStoreError::InvalidConfig(format!(
                "min_alloc_size ({}) must be larger than the {}-byte chunk header",
                self.min_alloc_size, CHUNK_HEADER_SIZE
            )));
        }

        Ok(())
    }
}
