//! Integration tests for dedupfs-config
//!
//! These tests verify config loading with real file system operations.

use std::path::PathBuf;

use dedupfs_cas::{BackendKind, HashAlgorithm};
use dedupfs_config::{Config, ConfigError, LogLevel};
use tempfile::tempdir;

/// Full config file with every section set
#[test]
fn test_load_from_explicit_file() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
[storage]
root = "/srv/dedupfs"
backend = "lmdb"
blocksize = 65536
hash = "blake3"
lmdb_map_size = 1073741824

[stats]
enabled = false
interval_secs = 5

[logging]
level = "debug"
"#,
    )
    .unwrap();

    let config = Config::load_from(&path).unwrap();
    assert_eq!(config.storage.root, PathBuf::from("/srv/dedupfs"));
    assert_eq!(config.storage.backend, BackendKind::Lmdb);
    assert_eq!(config.storage.blocksize, 65536);
    assert_eq!(config.storage.hash, HashAlgorithm::Blake3);
    assert_eq!(config.storage.lmdb_map_size, 1 << 30);
    assert!(!config.stats.enabled);
    assert_eq!(config.stats.interval_secs, 5);
    assert_eq!(config.logging.level, LogLevel::Debug);
}

/// Empty file gives defaults
#[test]
fn test_empty_file_is_default() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("config.toml");
    std::fs::write(&path, "").unwrap();

    let config = Config::load_from(&path).unwrap();
    assert_eq!(config.stats, Config::default().stats);
    assert_eq!(config.storage.blocksize, 131072);
}

/// Zero blocksize is rejected at load time
#[test]
fn test_zero_blocksize_rejected() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("config.toml");
    std::fs::write(&path, "[storage]\nblocksize = 0\n").unwrap();

    assert!(matches!(
        Config::load_from(&path),
        Err(ConfigError::Invalid { field: "blocksize", .. })
    ));
}

/// Unknown backend names fail to parse
#[test]
fn test_unknown_backend_is_parse_error() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("config.toml");
    std::fs::write(&path, "[storage]\nbackend = \"gdbm\"\n").unwrap();

    assert!(matches!(Config::load_from(&path), Err(ConfigError::Toml(_))));
}

/// Default TOML output parses back into the defaults
#[test]
fn test_default_toml_is_loadable() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("config.toml");
    std::fs::write(&path, Config::default_toml()).unwrap();

    let config = Config::load_from(&path).unwrap();
    assert_eq!(config.storage.backend, BackendKind::Files);
    assert_eq!(config.storage.hash, HashAlgorithm::Sha1);
}

#[test]
fn test_missing_file_is_io_error() {
    let temp = tempdir().unwrap();
    assert!(matches!(
        Config::load_from(temp.path().join("absent.toml")),
        Err(ConfigError::Io(_))
    ));
}
