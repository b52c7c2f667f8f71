//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - A temporary storage root per test
//! - A scratch host directory for import/export fixtures
//! - Storage configs with an LMDB map size small enough for CI
//!
//! # Usage
//!
//! ```ignore
//! use dedupfs_config::testing::TestEnvironment;
//!
//! let env = TestEnvironment::new().unwrap();
//! let cfg = env.storage_config(BackendKind::Lmdb);
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use dedupfs_cas::BackendKind;
use tempfile::TempDir;

use crate::StorageConfig;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// LMDB map size used by test roots
pub const TEST_LMDB_MAP_SIZE: usize = 64 * 1024 * 1024;

/// Isolated test environment with unique paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Storage root for this test
    pub storage_root: PathBuf,
    /// Host-side directory for fixture files
    pub host_dir: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let storage_root = root.join(format!("storage-{test_id}"));
        let host_dir = root.join("host");
        std::fs::create_dir_all(&host_dir)?;

        Ok(Self {
            _temp_dir: temp_dir,
            storage_root,
            host_dir,
            test_id,
        })
    }

    /// Storage config pointing at this environment's root.
    pub fn storage_config(&self, backend: BackendKind) -> StorageConfig {
        StorageConfig {
            root: self.storage_root.clone(),
            backend,
            lmdb_map_size: TEST_LMDB_MAP_SIZE,
            ..StorageConfig::default()
        }
    }

    /// Same as [`storage_config`](Self::storage_config) with a custom blocksize.
    pub fn storage_config_with_blocksize(
        &self,
        backend: BackendKind,
        blocksize: usize,
    ) -> StorageConfig {
        StorageConfig {
            blocksize,
            ..self.storage_config(backend)
        }
    }

    /// Create a host file with content
    pub fn create_host_file(&self, relative_path: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.host_dir.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Create a host directory
    pub fn create_host_dir(&self, relative_path: &str) -> anyhow::Result<PathBuf> {
        let path = self.host_dir.join(relative_path);
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_creates_directories() {
        let env = TestEnvironment::new().unwrap();
        assert!(env.host_dir.exists());
        // The storage root is left for the engine to create.
        assert!(!env.storage_root.exists());
    }

    #[test]
    fn test_environment_has_unique_roots() {
        let env1 = TestEnvironment::new().unwrap();
        let env2 = TestEnvironment::new().unwrap();
        assert_ne!(env1.test_id, env2.test_id);
        assert_ne!(env1.storage_root, env2.storage_root);
    }

    #[test]
    fn test_create_host_file() {
        let env = TestEnvironment::new().unwrap();
        let path = env.create_host_file("in/data.bin", b"payload").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"payload");
    }

    #[test]
    fn test_storage_config_uses_small_map() {
        let env = TestEnvironment::new().unwrap();
        let cfg = env.storage_config_with_blocksize(BackendKind::Sqlite, 4096);
        assert_eq!(cfg.root, env.storage_root);
        assert_eq!(cfg.backend, BackendKind::Sqlite);
        assert_eq!(cfg.blocksize, 4096);
        assert_eq!(cfg.lmdb_map_size, TEST_LMDB_MAP_SIZE);
    }
}
