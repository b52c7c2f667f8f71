//! Storage root layout and the settings a root is pinned to.
//!
//! ```text
//! <root>/
//! ├── dedupfs.toml          # RootSettings, written once by init
//! ├── blocks/               # files backend only: ab/cd/<hex>.blk + .ref
//! └── meta/
//!     ├── blocks.lmdb/      # lmdb backend
//!     ├── files.lmdb/       # files + lmdb backends
//!     ├── paths.lmdb/       # files + lmdb backends
//!     ├── blockstorage.db   # sqlite backend
//!     ├── filestorage.db    # sqlite backend
//!     └── metastorage.db    # sqlite backend
//! ```

use std::path::{Path, PathBuf};

use dedupfs_cas::{BackendKind, HashAlgorithm};
use dedupfs_config::{ConfigError, StorageConfig};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{DedupError, Result};

pub const SETTINGS_FILE: &str = "dedupfs.toml";
pub const FORMAT_VERSION: u32 = 1;

/// Settings fixed when a storage root is created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootSettings {
    pub format_version: u32,
    pub backend: BackendKind,
    pub blocksize: usize,
    pub hash: HashAlgorithm,
    /// Creation time, seconds since the epoch
    pub created: i64,
}

impl RootSettings {
    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            backend: config.backend,
            blocksize: config.blocksize,
            hash: config.hash,
            created: dedupfs_index::now_secs(),
        }
    }

    pub fn path(root: &Path) -> PathBuf {
        root.join(SETTINGS_FILE)
    }

    /// Read the settings of an initialized root, `None` if there are none.
    pub fn load(root: &Path) -> Result<Option<Self>> {
        let path = Self::path(root);
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)?;
        let settings: RootSettings = toml::from_str(&contents).map_err(ConfigError::from)?;
        if settings.format_version != FORMAT_VERSION {
            return Err(DedupError::ConfigMismatch {
                field: "format_version",
                stored: settings.format_version.to_string(),
                requested: FORMAT_VERSION.to_string(),
            });
        }
        debug!("Loaded root settings from {:?}", path);
        Ok(Some(settings))
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self).map_err(|e| {
            DedupError::invalid_argument(&root.display().to_string(), e.to_string())
        })?;
        std::fs::write(Self::path(root), contents)?;
        Ok(())
    }

    /// Check that `config` asks for what this root was created with.
    pub fn check(&self, config: &StorageConfig) -> Result<()> {
        if self.backend != config.backend {
            return Err(DedupError::ConfigMismatch {
                field: "backend",
                stored: self.backend.to_string(),
                requested: config.backend.to_string(),
            });
        }
        if self.blocksize != config.blocksize {
            return Err(DedupError::ConfigMismatch {
                field: "blocksize",
                stored: self.blocksize.to_string(),
                requested: config.blocksize.to_string(),
            });
        }
        if self.hash != config.hash {
            return Err(DedupError::ConfigMismatch {
                field: "hash",
                stored: self.hash.to_string(),
                requested: config.hash.to_string(),
            });
        }
        Ok(())
    }

    /// `config` with the pinned fields replaced by the stored ones.
    pub fn apply_to(&self, config: &StorageConfig) -> StorageConfig {
        StorageConfig {
            backend: self.backend,
            blocksize: self.blocksize,
            hash: self.hash,
            ..config.clone()
        }
    }
}

/// Physical locations inside a storage root
#[derive(Debug, Clone)]
pub struct RootLayout {
    pub root: PathBuf,
}

impl RootLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.root.join("meta")
    }

    pub fn blocks_dir(&self) -> PathBuf {
        self.root.join("blocks")
    }

    pub fn block_lmdb(&self) -> PathBuf {
        self.meta_dir().join("blocks.lmdb")
    }

    pub fn file_lmdb(&self) -> PathBuf {
        self.meta_dir().join("files.lmdb")
    }

    pub fn path_lmdb(&self) -> PathBuf {
        self.meta_dir().join("paths.lmdb")
    }

    pub fn block_sqlite(&self) -> PathBuf {
        self.meta_dir().join("blockstorage.db")
    }

    pub fn file_sqlite(&self) -> PathBuf {
        self.meta_dir().join("filestorage.db")
    }

    pub fn path_sqlite(&self) -> PathBuf {
        self.meta_dir().join("metastorage.db")
    }
}
