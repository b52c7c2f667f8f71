//! # dedupfs-config
//!
//! Configuration management for dedupfs.
//!
//! Loads configuration from:
//! 1. `~/.dedupfs/config.toml` (global)
//! 2. `.dedupfs/config.toml` (project-local, overrides global key by key)
//! 3. Environment variables (highest priority)
//!
//! Storage settings (`backend`, `blocksize`, `hash`) only take effect when a
//! storage root is created; an existing root keeps the values it was
//! initialized with.

pub mod logging;
pub mod testing;

use std::path::{Path, PathBuf};

use dedupfs_cas::{BackendKind, HashAlgorithm};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub use logging::{init_logging, Component, LogLevel};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub stats: StatsConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut merged = toml::Table::new();

        // 1. Global config (~/.dedupfs/config.toml)
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                merge_tables(&mut merged, read_table(&global_path)?);
            }
        }

        // 2. Project config (.dedupfs/config.toml)
        let project_path = Self::project_config_path();
        if project_path.exists() {
            debug!("Loading project config from {:?}", project_path);
            merge_tables(&mut merged, read_table(&project_path)?);
        }

        let mut config: Config = toml::Value::Table(merged).try_into()?;

        // 3. Environment variable overrides
        config.apply_env_overrides();

        config.storage.validate()?;
        Ok(config)
    }

    /// Load a single explicit file, with environment overrides on top.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let mut config: Config = toml::from_str(&contents)?;
        config.apply_env_overrides();
        config.storage.validate()?;
        Ok(config)
    }

    /// Global config path: ~/.dedupfs/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".dedupfs/config.toml"))
    }

    pub fn project_config_path() -> PathBuf {
        PathBuf::from(".dedupfs/config.toml")
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(std::env::vars());
    }

    /// Apply `DEDUPFS_*` overrides from `vars`. Unparsable values are
    /// logged and skipped.
    pub fn apply_overrides<I, K, V>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let value = value.as_ref();
            match key.as_ref() {
                "DEDUPFS_ROOT" => self.storage.root = PathBuf::from(value),
                "DEDUPFS_BACKEND" => match value.parse::<BackendKind>() {
                    Ok(backend) => self.storage.backend = backend,
                    Err(e) => warn!("Ignoring DEDUPFS_BACKEND: {}", e),
                },
                "DEDUPFS_BLOCKSIZE" => match value.parse::<usize>() {
                    Ok(blocksize) => self.storage.blocksize = blocksize,
                    Err(e) => warn!("Ignoring DEDUPFS_BLOCKSIZE={:?}: {}", value, e),
                },
                "DEDUPFS_HASH" => match value.parse::<HashAlgorithm>() {
                    Ok(hash) => self.storage.hash = hash,
                    Err(e) => warn!("Ignoring DEDUPFS_HASH: {}", e),
                },
                _ => {}
            }
        }
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}

fn read_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    Ok(contents.parse::<toml::Table>()?)
}

/// Recursively overlay `overlay` onto `base`; tables merge, everything else
/// is replaced.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Storage root configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage root directory
    pub root: PathBuf,
    /// Persistence variant for new roots
    pub backend: BackendKind,
    /// Chunk size in bytes for new roots
    pub blocksize: usize,
    /// Digest algorithm for new roots
    pub hash: HashAlgorithm,
    /// LMDB map size in bytes (upper bound on database size)
    pub lmdb_map_size: usize,
}

impl StorageConfig {
    pub const DEFAULT_BLOCKSIZE: usize = 128 * 1024;
    pub const DEFAULT_LMDB_MAP_SIZE: usize = 4 * 1024 * 1024 * 1024;

    /// Config for a root at `root` with every other field defaulted.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.blocksize == 0 {
            return Err(ConfigError::Invalid {
                field: "blocksize",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.lmdb_map_size == 0 {
            return Err(ConfigError::Invalid {
                field: "lmdb_map_size",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: dirs::home_dir()
                .map(|h| h.join(".dedupfs/storage"))
                .unwrap_or_else(|| PathBuf::from(".dedupfs/storage")),
            backend: BackendKind::default(),
            blocksize: Self::DEFAULT_BLOCKSIZE,
            hash: HashAlgorithm::default(),
            lmdb_map_size: Self::DEFAULT_LMDB_MAP_SIZE,
        }
    }
}

/// Background statistics reporter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    pub enabled: bool,
    /// Seconds between two reports
    pub interval_secs: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
}
