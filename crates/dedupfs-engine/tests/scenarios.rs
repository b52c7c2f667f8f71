//! End-to-end storage scenarios, run against every backend.

use dedupfs_cas::BackendKind;
use dedupfs_config::testing::TestEnvironment;
use dedupfs_engine::{DedupError, ErrorKind, MetaStorage};

const ALL_BACKENDS: [BackendKind; 3] = [BackendKind::Files, BackendKind::Lmdb, BackendKind::Sqlite];
const BLOCKSIZE: usize = 131072;

/// Deterministic, non-repeating test content
fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| {
            let mixed = (i as u32).wrapping_mul(2654435761).wrapping_add(seed as u32);
            (mixed >> 13) as u8 ^ (i >> 8) as u8
        })
        .collect()
}

fn store_file(storage: &MetaStorage, path: &str, content: &[u8]) {
    storage.create(path, 0o644).unwrap();
    storage.write(path, content).unwrap();
    storage.release(path).unwrap();
}

fn for_each_backend(test: impl Fn(BackendKind, MetaStorage)) {
    for backend in ALL_BACKENDS {
        let env = TestEnvironment::new().unwrap();
        let storage =
            MetaStorage::open(&env.storage_config_with_blocksize(backend, BLOCKSIZE)).unwrap();
        test(backend, storage);
    }
}

#[test]
fn test_large_write_splits_into_blocks() {
    for_each_backend(|backend, storage| {
        let content = pattern(300_000, 1);
        storage.create("/big", 0o644).unwrap();
        assert_eq!(storage.write("/big", &content).unwrap(), 300_000);
        let released = storage.release("/big").unwrap();

        assert_eq!(released.size, 300_000, "{backend}");
        assert_eq!(released.sequence.len(), 3, "{backend}");
        let sizes: Vec<usize> = released
            .sequence
            .iter()
            .map(|d| storage.block_store().get(d).unwrap().len())
            .collect();
        assert_eq!(sizes, vec![131072, 131072, 37856], "{backend}");
        assert_eq!(storage.getattr("/big").unwrap().size, 300_000);
        assert_eq!(storage.read("/big", 300_000, 0).unwrap(), content);
    });
}

#[test]
fn test_identical_files_share_storage_until_last_unlink() {
    for_each_backend(|backend, storage| {
        let content = pattern(50_000, 7);
        store_file(&storage, "/a", &content);
        let blocks_after_first = storage.block_store().report().unwrap().block_count;
        store_file(&storage, "/b", &content);

        let digest = storage.hash_algorithm().digest(&content);
        let record = storage.file_index().record(&digest).unwrap().unwrap();
        assert_eq!(record.refcount, 2, "{backend}");
        assert_eq!(storage.file_index().report().unwrap().file_count, 1);
        let blocks = storage.block_store().report().unwrap();
        assert_eq!(blocks.block_count, blocks_after_first, "{backend}");
        for block in &record.sequence {
            assert_eq!(storage.block_store().refcount(block).unwrap(), Some(2));
        }

        storage.unlink("/a").unwrap();
        let record = storage.file_index().record(&digest).unwrap().unwrap();
        assert_eq!(record.refcount, 1, "{backend}");
        assert_eq!(storage.read("/b", 50_000, 0).unwrap(), content);
        assert!(!storage.exists("/a").unwrap());

        storage.unlink("/b").unwrap();
        assert!(storage.file_index().get(&digest).unwrap().is_none(), "{backend}");
        for block in &record.sequence {
            assert!(!storage.block_store().exists(block).unwrap(), "{backend}");
        }
        assert_eq!(storage.block_store().report().unwrap().block_count, 0);
    });
}

#[test]
fn test_empty_file_reads_nothing() {
    for_each_backend(|backend, storage| {
        storage.create("/empty", 0o644).unwrap();
        assert!(storage.read("/empty", 10, 0).unwrap().is_empty(), "{backend}");

        // An empty release keeps the entry digest-free.
        storage.write("/empty", b"").unwrap();
        let released = storage.release("/empty").unwrap();
        assert_eq!(released.size, 0);
        assert!(storage.path_table().get("/empty").unwrap().unwrap().digest.is_none());
        assert_eq!(storage.file_index().report().unwrap().file_count, 0);
    });
}

#[test]
fn test_rename_over_file_leaves_no_orphans() {
    for_each_backend(|backend, storage| {
        let a = pattern(200_000, 3);
        let c = pattern(90_000, 9);
        store_file(&storage, "/a", &a);
        store_file(&storage, "/c", &c);
        let c_digest = storage.hash_algorithm().digest(&c);
        let c_blocks = storage.file_index().get(&c_digest).unwrap().unwrap();

        storage.rename("/a", "/c").unwrap();

        assert!(!storage.exists("/a").unwrap());
        assert_eq!(storage.read("/c", a.len(), 0).unwrap(), a, "{backend}");
        assert!(storage.file_index().get(&c_digest).unwrap().is_none(), "{backend}");
        for block in &c_blocks {
            assert!(!storage.block_store().exists(block).unwrap(), "{backend}");
        }
        let report = storage.verify().unwrap();
        assert!(report.is_clean(), "{backend}: {:?}", report.issues);
        assert_eq!(storage.file_index().report().unwrap().file_count, 1);
    });
}

#[test]
fn test_rename_directory_moves_subtree() {
    for_each_backend(|backend, storage| {
        storage.mkdir("/src", 0o755).unwrap();
        storage.mkdir("/src/sub", 0o755).unwrap();
        store_file(&storage, "/src/sub/leaf", b"leaf bytes");
        store_file(&storage, "/srcfile", b"sibling");

        storage.rename("/src", "/dst").unwrap();

        assert!(!storage.exists("/src/sub/leaf").unwrap(), "{backend}");
        assert_eq!(storage.read("/dst/sub/leaf", 64, 0).unwrap(), b"leaf bytes");
        assert_eq!(storage.readdir("/dst").unwrap(), vec!["sub".to_string()]);
        assert_eq!(storage.read("/srcfile", 64, 0).unwrap(), b"sibling");
        let mut root = storage.readdir("/").unwrap();
        root.sort();
        assert_eq!(root, vec!["dst".to_string(), "srcfile".to_string()]);
    });
}

#[test]
fn test_rename_rejections() {
    for_each_backend(|backend, storage| {
        storage.mkdir("/d", 0o755).unwrap();
        storage.mkdir("/full", 0o755).unwrap();
        store_file(&storage, "/full/x", b"x");
        store_file(&storage, "/f", b"f");

        let rename = |from: &str, to: &str| storage.rename(from, to).unwrap_err();
        assert!(matches!(rename("/f", "/d"), DedupError::IsDirectory { .. }), "{backend}");
        assert!(matches!(rename("/d", "/f"), DedupError::NotADirectory { .. }));
        assert!(matches!(rename("/d", "/full"), DedupError::NotEmpty { .. }));
        assert!(matches!(rename("/d", "/d/inner"), DedupError::InvalidArgument { .. }));
        assert!(matches!(rename("/nope", "/x"), DedupError::NotFound { .. }));
        assert!(matches!(rename("/f", "/missing/f"), DedupError::NotFound { .. }));

        storage.rename("/f", "/f").unwrap();
        assert_eq!(storage.read("/f", 8, 0).unwrap(), b"f");
    });
}

#[test]
fn test_namespace_errors() {
    for_each_backend(|backend, storage| {
        storage.mkdir("/d", 0o755).unwrap();
        store_file(&storage, "/d/f", b"data");

        let err = storage.mkdir("/d", 0o755).unwrap_err();
        assert_eq!(err.errno(), libc::EEXIST, "{backend}");
        assert!(matches!(storage.create("/nope/f", 0o644), Err(DedupError::NotFound { .. })));
        assert!(matches!(storage.create("/d/f/g", 0o644), Err(DedupError::NotADirectory { .. })));
        assert!(matches!(storage.rmdir("/d"), Err(DedupError::NotEmpty { .. })));
        assert!(matches!(storage.rmdir("/d/f"), Err(DedupError::NotADirectory { .. })));
        assert!(matches!(storage.rmdir("/"), Err(DedupError::InvalidArgument { .. })));
        assert!(matches!(storage.unlink("/d"), Err(DedupError::IsDirectory { .. })));
        assert!(matches!(storage.read("/d", 1, 0), Err(DedupError::IsDirectory { .. })));
        assert_eq!(storage.read("/missing", 1, 0).unwrap_err().kind(), ErrorKind::NotFound);
        assert!(matches!(storage.readdir("/d/f"), Err(DedupError::NotADirectory { .. })));

        storage.unlink("/d/f").unwrap();
        storage.rmdir("/d").unwrap();
        assert!(storage.readdir("/").unwrap().is_empty());
    });
}

#[test]
fn test_unlink_aborts_open_session() {
    for_each_backend(|backend, storage| {
        storage.create("/f", 0o644).unwrap();
        storage.write("/f", &pattern(BLOCKSIZE * 2, 5)).unwrap();
        assert_eq!(storage.open_sessions(), 1);

        storage.unlink("/f").unwrap();
        assert_eq!(storage.open_sessions(), 0);
        assert_eq!(storage.block_store().report().unwrap().block_count, 0, "{backend}");
        assert!(matches!(storage.release("/f"), Err(DedupError::InvalidState { .. })));
    });
}

#[test]
fn test_reopen_preserves_content() {
    for backend in ALL_BACKENDS {
        let env = TestEnvironment::new().unwrap();
        let config = env.storage_config_with_blocksize(backend, 4096);
        let content = pattern(10_000, 11);
        {
            let storage = MetaStorage::open(&config).unwrap();
            storage.mkdir("/docs", 0o750).unwrap();
            store_file(&storage, "/docs/report", &content);
            storage.shutdown().unwrap();
        }

        let storage = MetaStorage::open_existing(&env.storage_config(backend)).unwrap();
        assert_eq!(storage.blocksize(), 4096, "{backend}");
        assert_eq!(storage.getattr("/docs").unwrap().perm(), 0o750);
        assert_eq!(storage.read("/docs/report", 20_000, 0).unwrap(), content);
        assert!(storage.verify().unwrap().is_clean());
    }
}

#[test]
fn test_reopen_with_other_settings_rejected() {
    let env = TestEnvironment::new().unwrap();
    MetaStorage::open(&env.storage_config(BackendKind::Lmdb))
        .unwrap()
        .shutdown()
        .unwrap();

    let err = MetaStorage::open(&env.storage_config(BackendKind::Sqlite)).err().unwrap();
    assert!(matches!(err, DedupError::ConfigMismatch { field: "backend", .. }));

    let err = MetaStorage::open(&env.storage_config_with_blocksize(BackendKind::Lmdb, 512))
        .err()
        .unwrap();
    assert!(matches!(err, DedupError::ConfigMismatch { field: "blocksize", .. }));
}

#[test]
fn test_attributes_survive_rewrite() {
    for_each_backend(|backend, storage| {
        store_file(&storage, "/f", b"v1");
        storage.chmod("/f", 0o600).unwrap();
        storage.chown("/f", Some(42), Some(43)).unwrap();
        storage.write("/f", b"version two").unwrap();
        storage.release("/f").unwrap();

        let stat = storage.getattr("/f").unwrap();
        assert_eq!(stat.perm(), 0o600, "{backend}");
        assert_eq!((stat.uid, stat.gid), (42, 43));
        assert_eq!(stat.size, 11);
        assert!(stat.is_file());
    });
}

#[test]
fn test_long_paths_on_every_backend() {
    for_each_backend(|backend, storage| {
        let component = "d".repeat(101);
        let mut dir = String::new();
        for _ in 0..6 {
            dir = format!("{dir}/{component}");
            storage.mkdir(&dir, 0o755).unwrap();
        }
        let file = format!("{dir}/{}", "f".repeat(120));
        assert!(file.len() > 600, "{backend}");

        store_file(&storage, &file, b"deep content");
        assert_eq!(storage.read(&file, 64, 0).unwrap(), b"deep content", "{backend}");
        assert_eq!(storage.readdir(&dir).unwrap(), vec!["f".repeat(120)], "{backend}");

        let top = format!("/{component}");
        storage.rename(&top, "/moved").unwrap();
        let moved = format!("/moved{}", &file[top.len()..]);
        assert_eq!(storage.read(&moved, 64, 0).unwrap(), b"deep content", "{backend}");
        assert!(!storage.exists(&file).unwrap(), "{backend}");
        assert!(storage.verify().unwrap().is_clean(), "{backend}");
    });
}
