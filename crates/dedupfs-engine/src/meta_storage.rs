//! Orchestration of block store, file index and path table.
//!
//! Reference flow for one file:
//!
//! ```text
//! write ──▶ WriteBuffer ──put──▶ BlockStore
//! release ──▶ FileIndex.put(digest, sequence) ──▶ PathTable.update(digest, size)
//! read ──▶ PathTable ──digest──▶ FileIndex ──sequence──▶ BlockStore.get…
//! unlink ──▶ BlockStore.delete per block ──▶ FileIndex.delete ──▶ PathTable.remove
//! ```
//!
//! Every path that holds a digest owns one FileIndex reference and one
//! BlockStore reference per sequence slot. Dropping a path's digest, by
//! unlink, overwrite on release or rename onto it, gives all of them back.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use dedupfs_cas::{
    BackendKind, BlockStore, CasError, Digest, FileBlockStore, HashAlgorithm, LmdbBlockStore,
    SqliteBlockStore,
};
use dedupfs_config::{log_engine_debug, log_engine_info, log_engine_warn, log_index_warn, StorageConfig};
use dedupfs_index::{
    is_within, now_secs, parent_of, FileIndex, LmdbFileIndex, LmdbPathTable, PathEntry, PathTable,
    SqliteFileIndex, SqlitePathTable, Stat, DEFAULT_DIR_MODE, DEFAULT_FILE_MODE, S_IFMT,
};
use tracing::instrument;

use crate::root::{RootLayout, RootSettings};
use crate::write_buffer::{ReleasedFile, WriteBuffer};
use crate::{DedupError, Result};

pub struct MetaStorage {
    root: PathBuf,
    settings: RootSettings,
    blocks: Arc<dyn BlockStore>,
    files: Box<dyn FileIndex>,
    paths: Box<dyn PathTable>,
    /// Open write sessions keyed by path
    sessions: DashMap<String, WriteBuffer>,
    /// Serializes operations that change the shape of the namespace
    namespace: Mutex<()>,
}

/// Reject relative paths and strip a trailing slash.
fn normalize(path: &str) -> Result<&str> {
    if !path.starts_with('/') {
        return Err(DedupError::invalid_argument(path, "path must be absolute"));
    }
    if path.contains('\0') {
        return Err(DedupError::invalid_argument(path, "path contains NUL"));
    }
    let trimmed = path.trim_end_matches('/');
    Ok(if trimmed.is_empty() { "/" } else { trimmed })
}

impl MetaStorage {
    /// Create a storage root, or open one whose settings match `config`.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.root)?;

        let settings = match RootSettings::load(&config.root)? {
            Some(stored) => {
                stored.check(config)?;
                stored
            }
            None => {
                let settings = RootSettings::from_config(config);
                settings.save(&config.root)?;
                log_engine_info!(
                    "Initialized storage root",
                    root = tracing::field::display(config.root.display()),
                    backend = tracing::field::display(settings.backend),
                    blocksize = settings.blocksize,
                    hash = tracing::field::display(settings.hash)
                );
                settings
            }
        };

        Self::open_with(config, settings)
    }

    /// Open an initialized root with whatever settings it was created with.
    /// Only `root` and `lmdb_map_size` are taken from `config`.
    pub fn open_existing(config: &StorageConfig) -> Result<Self> {
        let settings = RootSettings::load(&config.root)?.ok_or_else(|| {
            DedupError::not_found(&RootSettings::path(&config.root).display().to_string())
        })?;
        let config = settings.apply_to(config);
        Self::open_with(&config, settings)
    }

    fn open_with(config: &StorageConfig, settings: RootSettings) -> Result<Self> {
        let layout = RootLayout::new(&config.root);
        std::fs::create_dir_all(layout.meta_dir())?;
        let map_size = config.lmdb_map_size;

        let (blocks, files, paths): (Arc<dyn BlockStore>, Box<dyn FileIndex>, Box<dyn PathTable>) =
            match settings.backend {
                BackendKind::Files => (
                    Arc::new(FileBlockStore::open(layout.blocks_dir())?),
                    Box::new(LmdbFileIndex::open(layout.file_lmdb(), map_size)?),
                    Box::new(LmdbPathTable::open(layout.path_lmdb(), map_size)?),
                ),
                BackendKind::Lmdb => (
                    Arc::new(LmdbBlockStore::open(layout.block_lmdb(), map_size)?),
                    Box::new(LmdbFileIndex::open(layout.file_lmdb(), map_size)?),
                    Box::new(LmdbPathTable::open(layout.path_lmdb(), map_size)?),
                ),
                BackendKind::Sqlite => (
                    Arc::new(SqliteBlockStore::open(layout.block_sqlite())?),
                    Box::new(SqliteFileIndex::open(layout.file_sqlite())?),
                    Box::new(SqlitePathTable::open(layout.path_sqlite())?),
                ),
            };

        if paths.get("/")?.is_none() {
            paths.insert(&PathEntry::new("/", None, Stat::directory(DEFAULT_DIR_MODE)))?;
            log_engine_debug!("Created root directory entry");
        }

        log_engine_info!(
            "Opened storage root",
            root = tracing::field::display(config.root.display()),
            backend = tracing::field::display(settings.backend)
        );

        Ok(Self {
            root: config.root.clone(),
            settings,
            blocks,
            files,
            paths,
            sessions: DashMap::new(),
            namespace: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn settings(&self) -> &RootSettings {
        &self.settings
    }

    pub fn blocksize(&self) -> usize {
        self.settings.blocksize
    }

    pub fn hash_algorithm(&self) -> HashAlgorithm {
        self.settings.hash
    }

    pub fn block_store(&self) -> &dyn BlockStore {
        self.blocks.as_ref()
    }

    pub fn file_index(&self) -> &dyn FileIndex {
        self.files.as_ref()
    }

    pub fn path_table(&self) -> &dyn PathTable {
        self.paths.as_ref()
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }

    fn lock_namespace(&self) -> MutexGuard<'_, ()> {
        self.namespace.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry(&self, path: &str) -> Result<PathEntry> {
        self.paths
            .get(path)?
            .ok_or_else(|| DedupError::not_found(path))
    }

    fn directory(&self, path: &str) -> Result<PathEntry> {
        let entry = self.entry(path)?;
        if !entry.stat.is_dir() {
            return Err(DedupError::NotADirectory {
                path: path.to_string(),
            });
        }
        Ok(entry)
    }

    /// Give back the references one path held on `digest`.
    fn dereference(&self, path: &str, digest: &Digest) -> Result<()> {
        let Some(sequence) = self.files.get(digest)? else {
            log_index_warn!(
                "Path referenced an unknown file record",
                path = path,
                digest = tracing::field::display(digest)
            );
            return Ok(());
        };
        for block in &sequence {
            self.blocks.delete(block)?;
        }
        let remaining = self.files.delete(digest)?;
        log_engine_debug!(
            "Dereferenced file",
            path = path,
            digest = tracing::field::display(digest),
            blocks = sequence.len(),
            remaining = remaining.unwrap_or(0)
        );
        Ok(())
    }

    /// Drop an open write session on `path`, if any.
    fn abort_session(&self, path: &str) -> Result<()> {
        if let Some((_, session)) = self.sessions.remove(path) {
            log_engine_warn!("Aborting open write session", path = path);
            session.abort()?;
        }
        Ok(())
    }

    // === content operations ===

    /// Append `data` to the write session for `path`, opening one if needed.
    #[instrument(skip(self, data), fields(len = data.len()), level = "debug")]
    pub fn write(&self, path: &str, data: &[u8]) -> Result<usize> {
        let path = normalize(path)?;
        if !self.sessions.contains_key(path) {
            let entry = self.entry(path)?;
            if entry.stat.is_dir() {
                return Err(DedupError::IsDirectory {
                    path: path.to_string(),
                });
            }
        }
        let mut session = self.sessions.entry(path.to_string()).or_insert_with(|| {
            WriteBuffer::new(self.blocks.clone(), self.settings.blocksize, self.settings.hash)
        });
        session.add(data)
    }

    /// Finish the write session for `path` and commit its content.
    ///
    /// On error the session is gone and every reference it took is given
    /// back; the path keeps its previous content.
    #[instrument(skip(self), level = "debug")]
    pub fn release(&self, path: &str) -> Result<ReleasedFile> {
        let path = normalize(path)?;
        let _guard = self.lock_namespace();
        let (_, mut session) = self
            .sessions
            .remove(path)
            .ok_or_else(|| DedupError::invalid_state(path, "no open write session"))?;
        let released = match session.release() {
            Ok(released) => released,
            Err(e) => {
                if let Err(abort) = session.abort() {
                    log_engine_warn!(
                        "Could not release blocks of a failed session",
                        path = path,
                        error = tracing::field::display(&abort)
                    );
                }
                return Err(e);
            }
        };

        let previous = match self.commit(path, &released) {
            Ok(previous) => previous,
            Err(e) => {
                self.discard_blocks(path, &released.sequence);
                return Err(e);
            }
        };

        // Recorded the new content first, so a shared digest never hits zero.
        if let Some(previous) = previous {
            self.dereference(path, &previous)?;
        }

        log_engine_debug!(
            "Released file",
            path = path,
            size = released.size,
            blocks = released.sequence.len()
        );
        Ok(released)
    }

    /// Point `path` at the released content, returning the digest it held
    /// before. A failed path update takes back the file record.
    fn commit(&self, path: &str, released: &ReleasedFile) -> Result<Option<Digest>> {
        let mut entry = self.paths.get(path)?.ok_or_else(|| DedupError::not_found(path))?;

        let new_digest = if released.size == 0 {
            None
        } else {
            self.files.put(&released.digest, &released.sequence)?;
            Some(released.digest)
        };

        let previous = entry.digest;
        let now = now_secs();
        entry.digest = new_digest;
        entry.stat.size = released.size;
        entry.stat.mtime = now;
        entry.stat.ctime = now;
        if let Err(e) = self.paths.update(&entry) {
            if let Some(digest) = new_digest {
                if let Err(undo) = self.files.delete(&digest) {
                    log_index_warn!(
                        "Could not take back file record",
                        path = path,
                        digest = tracing::field::display(&digest),
                        error = tracing::field::display(&undo)
                    );
                }
            }
            return Err(e.into());
        }
        Ok(previous)
    }

    /// Give back one reference per block of a session that never committed.
    fn discard_blocks(&self, path: &str, sequence: &[Digest]) {
        for block in sequence {
            if let Err(e) = self.blocks.delete(block) {
                log_engine_warn!(
                    "Could not release block of an uncommitted session",
                    path = path,
                    digest = tracing::field::display(block),
                    error = tracing::field::display(&e)
                );
            }
        }
    }

    /// Up to `length` bytes of `path` starting at `offset`. A short result
    /// means end of file.
    #[instrument(skip(self), level = "debug")]
    pub fn read(&self, path: &str, length: usize, offset: u64) -> Result<Vec<u8>> {
        let path = normalize(path)?;
        let entry = self.entry(path)?;
        if entry.stat.is_dir() {
            return Err(DedupError::IsDirectory {
                path: path.to_string(),
            });
        }
        let Some(digest) = entry.digest else {
            return Ok(Vec::new());
        };
        let sequence = self
            .files
            .get(&digest)?
            .ok_or_else(|| DedupError::FileRecordMissing {
                path: path.to_string(),
                digest,
            })?;

        let blocksize = self.settings.blocksize as u64;
        let mut index = (offset / blocksize) as usize;
        let mut start = (offset % blocksize) as usize;
        let mut buf = Vec::with_capacity(length.min(entry.stat.size as usize));

        while buf.len() < length && index < sequence.len() {
            let block = self.blocks.get(&sequence[index]).map_err(|e| match e {
                CasError::NotFound { digest } => DedupError::Integrity {
                    digest,
                    reason: format!("block of {path} is missing"),
                },
                other => other.into(),
            })?;
            buf.extend_from_slice(block.get(start..).unwrap_or_default());
            start = 0;
            index += 1;
        }
        buf.truncate(length);
        Ok(buf)
    }

    /// Remove a file and give back its references.
    #[instrument(skip(self), level = "debug")]
    pub fn unlink(&self, path: &str) -> Result<()> {
        let path = normalize(path)?;
        let _guard = self.lock_namespace();
        let entry = self.entry(path)?;
        if entry.stat.is_dir() {
            return Err(DedupError::IsDirectory {
                path: path.to_string(),
            });
        }
        self.abort_session(path)?;
        if let Some(digest) = entry.digest {
            self.dereference(path, &digest)?;
        }
        self.paths.remove(path)?;
        Ok(())
    }

    // === namespace operations ===

    fn insert_new(&self, path: &str, stat: Stat) -> Result<()> {
        let path = normalize(path)?;
        let _guard = self.lock_namespace();
        if path == "/" || self.paths.get(path)?.is_some() {
            return Err(DedupError::AlreadyExists {
                path: path.to_string(),
            });
        }
        self.directory(parent_of(path))?;
        self.paths.insert(&PathEntry::new(path, None, stat))?;
        Ok(())
    }

    pub fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        self.insert_new(path, Stat::directory(mode))
    }

    pub fn create(&self, path: &str, mode: u32) -> Result<()> {
        self.insert_new(path, Stat::file(mode))
    }

    /// Create an empty file, or refresh the times of an existing entry.
    pub fn touch(&self, path: &str, mode: Option<u32>) -> Result<()> {
        let path = normalize(path)?;
        if let Some(mut entry) = self.paths.get(path)? {
            let now = now_secs();
            entry.stat.atime = now;
            entry.stat.mtime = now;
            self.paths.update(&entry)?;
            return Ok(());
        }
        self.create(path, mode.unwrap_or(DEFAULT_FILE_MODE))
    }

    pub fn rmdir(&self, path: &str) -> Result<()> {
        let path = normalize(path)?;
        if path == "/" {
            return Err(DedupError::invalid_argument(path, "cannot remove the root"));
        }
        let _guard = self.lock_namespace();
        self.directory(path)?;
        if !self.paths.children(path)?.is_empty() {
            return Err(DedupError::NotEmpty {
                path: path.to_string(),
            });
        }
        self.paths.remove(path)?;
        Ok(())
    }

    /// Move `from` to `to`, replacing a compatible destination.
    #[instrument(skip(self), level = "debug")]
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = normalize(from)?;
        let to = normalize(to)?;
        let _guard = self.lock_namespace();

        let source = self.entry(from)?;
        if from == to {
            return Ok(());
        }
        if from == "/" || to == "/" {
            return Err(DedupError::invalid_argument(from, "cannot rename the root"));
        }
        if source.stat.is_dir() && is_within(to, from) {
            return Err(DedupError::invalid_argument(
                from,
                format!("cannot move a directory into itself ({to})"),
            ));
        }
        self.directory(parent_of(to))?;

        if let Some(dest) = self.paths.get(to)? {
            match (source.stat.is_dir(), dest.stat.is_dir()) {
                (false, true) => {
                    return Err(DedupError::IsDirectory {
                        path: to.to_string(),
                    })
                }
                (true, false) => {
                    return Err(DedupError::NotADirectory {
                        path: to.to_string(),
                    })
                }
                (true, true) => {
                    if !self.paths.children(to)?.is_empty() {
                        return Err(DedupError::NotEmpty {
                            path: to.to_string(),
                        });
                    }
                }
                (false, false) => {
                    self.abort_session(to)?;
                    if let Some(digest) = dest.digest {
                        self.dereference(to, &digest)?;
                    }
                }
            }
        }

        let descendants = if source.stat.is_dir() {
            self.paths.descendants(from)?
        } else {
            Vec::new()
        };

        self.paths.rename(from, to)?;
        self.move_session(from, to);
        for child in descendants {
            let moved = format!("{to}{}", &child.abspath[from.len()..]);
            self.paths.rename(&child.abspath, &moved)?;
            self.move_session(&child.abspath, &moved);
        }

        let mut moved = self.entry(to)?;
        moved.stat.ctime = now_secs();
        self.paths.update(&moved)?;
        Ok(())
    }

    fn move_session(&self, from: &str, to: &str) {
        if let Some((_, session)) = self.sessions.remove(from) {
            self.sessions.insert(to.to_string(), session);
        }
    }

    // === attributes ===

    pub fn getattr(&self, path: &str) -> Result<Stat> {
        Ok(self.entry(normalize(path)?)?.stat)
    }

    pub fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.paths.get(normalize(path)?)?.is_some())
    }

    /// Names of the entries directly inside `path`.
    pub fn readdir(&self, path: &str) -> Result<Vec<String>> {
        let path = normalize(path)?;
        self.directory(path)?;
        Ok(self
            .paths
            .children(path)?
            .iter()
            .map(|e| e.name().to_string())
            .collect())
    }

    fn update_stat(&self, path: &str, f: impl FnOnce(&mut Stat)) -> Result<()> {
        let path = normalize(path)?;
        let mut entry = self.entry(path)?;
        f(&mut entry.stat);
        self.paths.update(&entry)?;
        Ok(())
    }

    /// Replace the permission bits; the file type is kept.
    pub fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        self.update_stat(path, |stat| {
            stat.mode = (stat.mode & S_IFMT) | (mode & !S_IFMT);
            stat.ctime = now_secs();
        })
    }

    /// `None` leaves the owner or group unchanged.
    pub fn chown(&self, path: &str, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        self.update_stat(path, |stat| {
            if let Some(uid) = uid {
                stat.uid = uid;
            }
            if let Some(gid) = gid {
                stat.gid = gid;
            }
            stat.ctime = now_secs();
        })
    }

    pub fn utime(&self, path: &str, atime: i64, mtime: i64) -> Result<()> {
        self.update_stat(path, |stat| {
            stat.atime = atime;
            stat.mtime = mtime;
        })
    }

    // === lifecycle ===

    /// Push every store's buffered state to disk.
    pub fn flush(&self) -> Result<()> {
        self.blocks.flush()?;
        self.files.flush()?;
        self.paths.flush()?;
        Ok(())
    }

    /// Abort unreleased sessions, flush and close every store.
    pub fn shutdown(self) -> Result<()> {
        let open: Vec<String> = self.sessions.iter().map(|s| s.key().clone()).collect();
        for path in open {
            self.abort_session(&path)?;
        }
        self.flush()?;
        log_engine_info!("Storage root closed", root = tracing::field::display(self.root.display()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dedupfs_config::testing::TestEnvironment;

    fn open(env: &TestEnvironment) -> MetaStorage {
        MetaStorage::open(&env.storage_config_with_blocksize(BackendKind::Lmdb, 4)).unwrap()
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("/").unwrap(), "/");
        assert_eq!(normalize("/a/").unwrap(), "/a");
        assert_eq!(normalize("//").unwrap(), "/");
        assert!(normalize("relative").is_err());
        assert!(normalize("/nul\0byte").is_err());
    }

    #[test]
    fn test_root_exists_after_open() {
        let env = TestEnvironment::new().unwrap();
        let storage = open(&env);
        assert!(storage.getattr("/").unwrap().is_dir());
        assert!(storage.readdir("/").unwrap().is_empty());
    }

    #[test]
    fn test_failed_release_gives_back_blocks() {
        use crate::write_buffer::tests::FlakyStore;
        use std::sync::atomic::Ordering;

        let env = TestEnvironment::new().unwrap();
        let mut storage = open(&env);
        let flaky = Arc::new(FlakyStore::new(storage.blocks.clone(), 0));
        storage.blocks = flaky.clone() as Arc<dyn BlockStore>;

        storage.create("/f", 0o644).unwrap();
        storage.write("/f", b"old!").unwrap();
        storage.release("/f").unwrap();

        storage.write("/f", b"abcdef").unwrap();
        flaky.fail_puts.store(1, Ordering::SeqCst);
        assert!(storage.release("/f").is_err());

        assert_eq!(storage.open_sessions(), 0);
        assert_eq!(storage.read("/f", 16, 0).unwrap(), b"old!");
        assert_eq!(storage.block_store().report().unwrap().total_references, 1);
        assert!(storage.verify().unwrap().is_clean());

        // The tail is stored again once space is back.
        storage.write("/f", b"abcdef").unwrap();
        storage.release("/f").unwrap();
        assert_eq!(storage.read("/f", 16, 0).unwrap(), b"abcdef");
        assert!(storage.verify().unwrap().is_clean());
    }

    #[test]
    fn test_release_without_session() {
        let env = TestEnvironment::new().unwrap();
        let storage = open(&env);
        storage.create("/f", 0o644).unwrap();
        let err = storage.release("/f").unwrap_err();
        assert!(matches!(err, DedupError::InvalidState { .. }));
    }

    #[test]
    fn test_read_spans_block_boundaries() {
        let env = TestEnvironment::new().unwrap();
        let storage = open(&env);
        storage.create("/f", 0o644).unwrap();
        storage.write("/f", b"0123456789").unwrap();
        storage.release("/f").unwrap();

        assert_eq!(storage.read("/f", 4, 3).unwrap(), b"3456");
        assert_eq!(storage.read("/f", 100, 8).unwrap(), b"89");
        assert!(storage.read("/f", 4, 10).unwrap().is_empty());
        assert_eq!(storage.read("/f", 0, 0).unwrap(), b"");
    }

    #[test]
    fn test_write_to_directory_rejected() {
        let env = TestEnvironment::new().unwrap();
        let storage = open(&env);
        storage.mkdir("/d", 0o755).unwrap();
        assert!(matches!(
            storage.write("/d", b"x"),
            Err(DedupError::IsDirectory { .. })
        ));
        assert!(matches!(
            storage.write("/missing", b"x"),
            Err(DedupError::NotFound { .. })
        ));
    }

    #[test]
    fn test_rewrite_supersedes_old_content() {
        let env = TestEnvironment::new().unwrap();
        let storage = open(&env);
        storage.create("/f", 0o644).unwrap();
        storage.write("/f", b"old content").unwrap();
        let old = storage.release("/f").unwrap();

        storage.write("/f", b"new").unwrap();
        storage.release("/f").unwrap();

        assert!(storage.file_index().get(&old.digest).unwrap().is_none());
        for block in &old.sequence {
            assert!(!storage.block_store().exists(block).unwrap());
        }
        assert_eq!(storage.read("/f", 100, 0).unwrap(), b"new");
    }

    #[test]
    fn test_rewrite_with_same_content_keeps_it() {
        let env = TestEnvironment::new().unwrap();
        let storage = open(&env);
        storage.create("/f", 0o644).unwrap();
        for _ in 0..3 {
            storage.write("/f", b"stable bytes").unwrap();
            storage.release("/f").unwrap();
        }
        let record = storage.file_index().report().unwrap();
        assert_eq!(record.total_references, 1);
        assert_eq!(storage.read("/f", 100, 0).unwrap(), b"stable bytes");
    }

    #[test]
    fn test_chmod_keeps_type_bits() {
        let env = TestEnvironment::new().unwrap();
        let storage = open(&env);
        storage.mkdir("/d", 0o755).unwrap();
        storage.chmod("/d", 0o100700).unwrap();
        let stat = storage.getattr("/d").unwrap();
        assert!(stat.is_dir());
        assert_eq!(stat.perm(), 0o700);
    }

    #[test]
    fn test_chown_partial() {
        let env = TestEnvironment::new().unwrap();
        let storage = open(&env);
        storage.create("/f", 0o644).unwrap();
        storage.chown("/f", Some(1000), None).unwrap();
        storage.chown("/f", None, Some(50)).unwrap();
        let stat = storage.getattr("/f").unwrap();
        assert_eq!((stat.uid, stat.gid), (1000, 50));
    }

    #[test]
    fn test_utime_and_touch() {
        let env = TestEnvironment::new().unwrap();
        let storage = open(&env);
        storage.touch("/t", None).unwrap();
        assert_eq!(storage.getattr("/t").unwrap().mode, DEFAULT_FILE_MODE);

        storage.utime("/t", 10, 20).unwrap();
        let stat = storage.getattr("/t").unwrap();
        assert_eq!((stat.atime, stat.mtime), (10, 20));

        storage.touch("/t", None).unwrap();
        assert!(storage.getattr("/t").unwrap().mtime > 20);
    }

    #[test]
    fn test_shutdown_aborts_sessions() {
        let env = TestEnvironment::new().unwrap();
        let storage = open(&env);
        storage.create("/f", 0o644).unwrap();
        storage.write("/f", b"never released").unwrap();
        assert_eq!(storage.open_sessions(), 1);
        storage.shutdown().unwrap();

        let reopened = open(&env);
        assert_eq!(reopened.block_store().report().unwrap().block_count, 0);
        assert_eq!(reopened.getattr("/f").unwrap().size, 0);
    }
}
