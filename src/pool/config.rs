//! Pool sizing configuration

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Smallest slab the pool will create; smaller requests are rounded up
///
/// Keeps the per-slab bookkeeping small relative to the payload it manages.
pub const MIN_SLAB_SIZE: u64 = 90 * 1024;

/// Largest slab the pool accepts
///
/// A segment offset or count must always fit an `i32`/`u32` iovec field.
pub const MAX_SLAB_SIZE: u64 = 1 << 31;

/// Upper bound on blocks a buffer collects while scanning existing slabs
pub const MAX_SEGMENTS_PER_BUFFER: usize = 16;

/// Environment variable prefix used by [`PoolConfig::load`]
pub const ENV_PREFIX: &str = "SLABBUF";

/// Buffer pool configuration
///
/// ```toml
/// slab_size = 1048576
/// initial_slabs = 2
/// growth_slabs = 1
/// max_slabs = 64
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Requested slab size in bytes (clamped up to [`MIN_SLAB_SIZE`])
    pub slab_size: u64,
    /// Slabs created up front; the pool never shrinks below this
    pub initial_slabs: usize,
    /// Slabs added each time the pool has to grow
    pub growth_slabs: usize,
    /// Optional ceiling on the number of slabs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_slabs: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            slab_size: 1024 * 1024, // 1MB
            initial_slabs: 1,
            growth_slabs: 1,
            max_slabs: None,
        }
    }
}

impl PoolConfig {
    /// Create a configuration without a slab ceiling
    pub fn new(slab_size: u64, initial_slabs: usize, growth_slabs: usize) -> Self {
        Self {
            slab_size,
            initial_slabs,
            growth_slabs,
            max_slabs: None,
        }
    }

    /// Cap the number of slabs the pool may hold
    pub fn with_max_slabs(mut self, max_slabs: usize) -> Self {
        self.max_slabs = Some(max_slabs);
        self
    }

    /// Check the configuration for values the pool cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.slab_size < 1 {
            return Err(Error::InvalidArgument(
                "slab_size must be equal to or greater than 1".to_string(),
            ));
        }
        if self.slab_size > MAX_SLAB_SIZE {
            return Err(Error::InvalidArgument(format!(
                "slab_size cannot be larger than {} bytes",
                MAX_SLAB_SIZE
            )));
        }
        if self.initial_slabs < 1 {
            return Err(Error::InvalidArgument(
                "initial_slabs must be equal to or greater than 1".to_string(),
            ));
        }
        if self.growth_slabs < 1 {
            return Err(Error::InvalidArgument(
                "growth_slabs must be equal to or greater than 1".to_string(),
            ));
        }
        if let Some(max) = self.max_slabs {
            if max < self.initial_slabs {
                return Err(Error::InvalidArgument(format!(
                    "max_slabs ({}) cannot be lower than initial_slabs ({})",
                    max, self.initial_slabs
                )));
            }
        }
        Ok(())
    }

    /// Slab size the pool actually uses
    pub fn effective_slab_size(&self) -> u64 {
        self.slab_size.max(MIN_SLAB_SIZE)
    }

    /// Parse a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| Error::Config(format!("invalid pool config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Render as a TOML document
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| Error::Config(format!("cannot encode pool config: {}", e)))
    }

    /// Load from a config file, then apply `SLABBUF_*` environment overrides
    ///
    /// The file format follows the extension (`.toml`, `.json`, ...).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::Config(format!("cannot load {}: {}", path.as_ref().display(), e)))?;
        config.validate()?;
        Ok(config)
    }
}
