//! Flat-file block store with sidecar refcount files.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

use crate::{BackendKind, BlockStats, BlockStore, CasError, Digest, DigestLocks, Result};

const PAYLOAD_EXT: &str = "blk";
const REFCOUNT_EXT: &str = "ref";
const TEMP_EXT: &str = "tmp";

/// Block store keeping one payload file and one refcount file per digest.
///
/// Uses a 2-level fan-out (`ab/cd/<hex>.blk`). A record exists iff its
/// `.ref` sidecar exists; the payload is written first so a present sidecar
/// always has its bytes.
#[derive(Debug)]
pub struct FileBlockStore {
    root: PathBuf,
    locks: DigestLocks,
}

impl FileBlockStore {
    /// Open a block directory, creating it if needed.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        debug!("Opened file block store at {:?}", root);
        Ok(Self {
            root,
            locks: DigestLocks::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn shard_dir(&self, digest: &Digest) -> PathBuf {
        let hex = digest.to_hex();
        self.root.join(&hex[..2]).join(&hex[2..4])
    }

    fn payload_path(&self, digest: &Digest) -> PathBuf {
        self.shard_dir(digest)
            .join(format!("{}.{}", digest.to_hex(), PAYLOAD_EXT))
    }

    fn refcount_path(&self, digest: &Digest) -> PathBuf {
        self.shard_dir(digest)
            .join(format!("{}.{}", digest.to_hex(), REFCOUNT_EXT))
    }

    fn read_refcount(&self, digest: &Digest) -> Result<Option<u64>> {
        match fs::read_to_string(self.refcount_path(digest)) {
            Ok(text) => text
                .trim()
                .parse::<u64>()
                .map(Some)
                .map_err(|e| CasError::Corrupted {
                    digest: *digest,
                    reason: format!("unreadable refcount {:?}: {}", text.trim(), e),
                }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_refcount(&self, digest: &Digest, count: u64) -> Result<()> {
        write_atomic(&self.refcount_path(digest), count.to_string().as_bytes())
    }
}

/// Write through a uniquely named temp file, then rename into place.
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_name = format!(
        "{}.{}.{:?}.{}",
        file_name,
        std::process::id(),
        std::thread::current().id(),
        TEMP_EXT
    );
    let temp_path = path.with_file_name(temp_name);

    let mut file = File::create(&temp_path)?;
    file.write_all(data)?;
    file.sync_all()?;

    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(CasError::Io(e));
    }
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

impl BlockStore for FileBlockStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Files
    }

    #[instrument(skip(self, payload), fields(len = payload.len()), level = "debug")]
    fn put(&self, payload: &[u8], digest: &Digest) -> Result<()> {
        let _guard = self.locks.lock(digest);
        match self.read_refcount(digest)? {
            Some(count) => {
                debug!("duplicate block, refcount {}", count + 1);
                self.write_refcount(digest, count + 1)
            }
            None => {
                fs::create_dir_all(self.shard_dir(digest))?;
                write_atomic(&self.payload_path(digest), payload)?;
                self.write_refcount(digest, 1)
            }
        }
    }

    #[instrument(skip(self), level = "debug")]
    fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        match fs::read(self.payload_path(digest)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(CasError::NotFound { digest: *digest })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, digest: &Digest) -> Result<bool> {
        Ok(self.refcount_path(digest).is_file())
    }

    #[instrument(skip(self), level = "debug")]
    fn delete(&self, digest: &Digest) -> Result<()> {
        let _guard = self.locks.lock(digest);
        match self.read_refcount(digest)? {
            None => {
                warn!(digest = %digest, "delete of unknown block ignored");
                Ok(())
            }
            Some(count) if count <= 1 => {
                // Sidecar goes first: without it the record no longer exists.
                remove_if_present(&self.refcount_path(digest))?;
                remove_if_present(&self.payload_path(digest))
            }
            Some(count) => self.write_refcount(digest, count - 1),
        }
    }

    fn refcount(&self, digest: &Digest) -> Result<Option<u64>> {
        self.read_refcount(digest)
    }

    fn report(&self) -> Result<BlockStats> {
        let mut stats = BlockStats::default();
        for entry in WalkDir::new(&self.root).min_depth(3).max_depth(3) {
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some(REFCOUNT_EXT) => {
                    let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                        continue;
                    };
                    // Removed between the walk and the read.
                    let Some(count) = self.read_refcount(&Digest::from_hex(stem)?)? else {
                        continue;
                    };
                    stats.block_count += 1;
                    stats.total_references += count;
                }
                Some(PAYLOAD_EXT) => {
                    stats.stored_bytes += entry.metadata().map_err(io::Error::from)?.len();
                }
                _ => {}
            }
        }
        Ok(stats)
    }

    fn digests(&self) -> Result<Vec<Digest>> {
        let mut digests = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(3).max_depth(3) {
            let entry = entry.map_err(io::Error::from)?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(REFCOUNT_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                digests.push(Digest::from_hex(stem)?);
            }
        }
        digests.sort();
        Ok(digests)
    }

    fn flush(&self) -> Result<()> {
        // Every write is synced before rename.
        Ok(())
    }
}
