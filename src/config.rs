//! Heap configuration
//!
//! The on-disk integer widths and byte order belong to the containing file,
//! not to the heap, so they are supplied here together with the tunables of
//! the reference collaborators.
//!
//! Sources, lowest precedence first:
//! 1. built-in defaults
//! 2. an optional TOML file
//! 3. `LOCALHEAP_*` environment variables (e.g. `LOCALHEAP_SIZEOF_SIZE=4`)

use crate::error::{Error, Result};
use crate::heap::codec::{IntWidths, SPECULATIVE_READ_SIZE};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Byte order of multi-byte integers in the file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    #[default]
    Little,
    Big,
}

/// Configuration for a heap store and its collaborators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeapConfig {
    /// Width of encoded lengths and heap offsets (bytes)
    pub sizeof_size: u8,
    /// Width of encoded file addresses (bytes)
    pub sizeof_addr: u8,
    /// Byte order of encoded integers
    pub byte_order: ByteOrder,
    /// Bytes read up front when loading a heap prefix
    pub speculative_read_size: usize,
    /// Number of entries the metadata cache keeps before evicting
    pub cache_capacity: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            sizeof_size: 8,
            sizeof_addr: 8,
            byte_order: ByteOrder::Little,
            speculative_read_size: SPECULATIVE_READ_SIZE,
            cache_capacity: 64,
        }
    }
}

impl HeapConfig {
    /// Load configuration from an optional TOML file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("LOCALHEAP").try_parsing(true),
        );

        let settings = builder
            .build()
            .map_err(|e| Error::Config(format!("Failed to read configuration: {}", e)))?;
        let cfg: HeapConfig = settings
            .try_deserialize()
            .map_err(|e| Error::Config(format!("Invalid configuration: {}", e)))?;

        cfg.validate()?;
        debug!(?cfg, "Loaded heap configuration");
        Ok(cfg)
    }

    /// Check widths and tunables
    pub fn validate(&self) -> Result<()> {
        for (name, width) in [("sizeof_size", self.sizeof_size), ("sizeof_addr", self.sizeof_addr)] {
            if !matches!(width, 2 | 4 | 8) {
                return Err(Error::Config(format!(
                    "{} must be 2, 4 or 8 bytes, got {}",
                    name, width
                )));
            }
        }
        if self.cache_capacity == 0 {
            return Err(Error::Config("cache_capacity must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Integer widths used by the disk layout codec
    pub fn widths(&self) -> Result<IntWidths> {
        self.validate()?;
        IntWidths::new(self.sizeof_size, self.sizeof_addr, self.byte_order)
    }

    /// Render the effective configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to render configuration: {}", e)))
    }
}
