//! # dedupfs-index
//!
//! Metadata tables that sit on top of the block store:
//!
//! - [`FileIndex`]: whole-file digest → ordered block sequence, refcounted so
//!   byte-identical files share one entry.
//! - [`PathTable`]: absolute path → parent, file digest and [`Stat`].
//!   Entries form a tree rooted at `/`.
//!
//! ```text
//! PathTable                 FileIndex                    BlockStore
//! /docs/a.txt ──digest──▶  F1 {refs: 2, [B1, B2]}  ──▶  B1, B2
//! /docs/b.txt ──digest──┘
//! /empty      (no digest)
//! ```
//!
//! Neither table cascades into the other: the engine layer is responsible
//! for dereferencing blocks when a file record goes away.

pub mod lmdb;
pub mod sqlite;

pub use lmdb::{LmdbFileIndex, LmdbPathTable};
pub use sqlite::{SqliteFileIndex, SqlitePathTable};

use std::time::{SystemTime, UNIX_EPOCH};

use dedupfs_cas::{CasError, Digest};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from the metadata tables
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("LMDB error: {0}")]
    Lmdb(#[from] heed::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Cas(#[from] CasError),

    #[error("No such entry: {path}")]
    NotFound { path: String },

    #[error("Entry already exists: {path}")]
    AlreadyExists { path: String },

    #[error("Index corrupted: {0}")]
    Corrupted(String),
}

pub type Result<T> = std::result::Result<T, IndexError>;

// File type bits, mirroring <sys/stat.h>.
pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;

pub const DEFAULT_DIR_MODE: u32 = S_IFDIR | 0o755;
pub const DEFAULT_FILE_MODE: u32 = S_IFREG | 0o666;

/// Block size reported for directories.
const DIR_SIZE: u64 = 4096;

/// Current time in whole seconds since the epoch.
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// stat(2)-like attributes owned by the path table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub nlink: u32,
}

impl Stat {
    /// Directory stat; `perm` supplies the permission bits.
    pub fn directory(perm: u32) -> Self {
        let now = now_secs();
        Self {
            mode: S_IFDIR | (perm & !S_IFMT),
            uid: 0,
            gid: 0,
            size: DIR_SIZE,
            atime: now,
            mtime: now,
            ctime: now,
            nlink: 2,
        }
    }

    /// Empty regular file stat; `perm` supplies the permission bits.
    pub fn file(perm: u32) -> Self {
        let now = now_secs();
        Self {
            mode: S_IFREG | (perm & !S_IFMT),
            uid: 0,
            gid: 0,
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
            nlink: 1,
        }
    }

    #[inline]
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    #[inline]
    pub fn is_file(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    /// Permission bits without the file type.
    #[inline]
    pub fn perm(&self) -> u32 {
        self.mode & !S_IFMT
    }
}

/// One row of the path table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathEntry {
    pub abspath: String,
    pub parent: String,
    /// `None` for directories and zero-byte files
    pub digest: Option<Digest>,
    pub stat: Stat,
}

impl PathEntry {
    pub fn new(abspath: impl Into<String>, digest: Option<Digest>, stat: Stat) -> Self {
        let abspath = abspath.into();
        let parent = parent_of(&abspath).to_string();
        Self {
            abspath,
            parent,
            digest,
            stat,
        }
    }

    pub fn name(&self) -> &str {
        basename(&self.abspath)
    }
}

/// Whole-file record in the file index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub digest: Digest,
    pub refcount: u64,
    pub sequence: Vec<Digest>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIndexStats {
    /// Distinct file contents
    pub file_count: u64,
    /// Paths referencing them
    pub total_references: u64,
}

/// Maps a whole-file digest to its block sequence.
pub trait FileIndex: Send + Sync {
    /// Record a sequence, or bump the refcount if the digest is known.
    /// Returns the refcount after the call.
    fn put(&self, digest: &Digest, sequence: &[Digest]) -> Result<u64>;

    fn get(&self, digest: &Digest) -> Result<Option<Vec<Digest>>>;

    fn record(&self, digest: &Digest) -> Result<Option<FileRecord>>;

    /// Drop one reference. Returns the remaining count, `Some(0)` when the
    /// entry was removed and `None` when the digest was unknown.
    fn delete(&self, digest: &Digest) -> Result<Option<u64>>;

    fn records(&self) -> Result<Vec<FileRecord>>;

    fn report(&self) -> Result<FileIndexStats>;

    fn flush(&self) -> Result<()>;
}

/// Hierarchical namespace keyed by absolute path.
pub trait PathTable: Send + Sync {
    /// Add a new entry. Fails with [`IndexError::AlreadyExists`].
    fn insert(&self, entry: &PathEntry) -> Result<()>;

    fn get(&self, abspath: &str) -> Result<Option<PathEntry>>;

    /// Overwrite an existing entry. Fails with [`IndexError::NotFound`].
    fn update(&self, entry: &PathEntry) -> Result<()>;

    /// Remove an entry, returning it if it existed.
    fn remove(&self, abspath: &str) -> Result<Option<PathEntry>>;

    /// Direct children of `parent`, sorted by path. The root is never its
    /// own child.
    fn children(&self, parent: &str) -> Result<Vec<PathEntry>>;

    /// Every entry strictly below `abspath`, sorted by path.
    fn descendants(&self, abspath: &str) -> Result<Vec<PathEntry>>;

    /// Re-key one entry from `from` to `to`, rewriting its parent. Any entry
    /// already at `to` is replaced.
    fn rename(&self, from: &str, to: &str) -> Result<()>;

    fn len(&self) -> Result<u64>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn entries(&self) -> Result<Vec<PathEntry>>;

    fn flush(&self) -> Result<()>;
}

/// Parent of an absolute path; the root is its own parent.
pub fn parent_of(abspath: &str) -> &str {
    match abspath.trim_end_matches('/').rfind('/') {
        Some(0) | None => "/",
        Some(i) => &abspath[..i],
    }
}

/// Final component of an absolute path; empty for the root.
pub fn basename(abspath: &str) -> &str {
    let trimmed = abspath.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(i) => &trimmed[i + 1..],
        None => trimmed,
    }
}

pub fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// True if `abspath` is `ancestor` or lies below it.
pub fn is_within(abspath: &str, ancestor: &str) -> bool {
    if ancestor == "/" {
        return abspath.starts_with('/');
    }
    abspath == ancestor
        || (abspath.starts_with(ancestor) && abspath.as_bytes().get(ancestor.len()) == Some(&b'/'))
}

/// Pack a block sequence as `len byte + digest bytes` per entry.
pub(crate) fn encode_sequence(sequence: &[Digest]) -> Vec<u8> {
    let mut out = Vec::with_capacity(sequence.iter().map(|d| d.len() + 1).sum());
    for digest in sequence {
        out.push(digest.len() as u8);
        out.extend_from_slice(digest.as_bytes());
    }
    out
}

pub(crate) fn decode_sequence(mut raw: &[u8]) -> Result<Vec<Digest>> {
    let mut sequence = Vec::new();
    while let Some((&len, rest)) = raw.split_first() {
        let len = len as usize;
        if rest.len() < len {
            return Err(IndexError::Corrupted(format!(
                "truncated sequence: need {} bytes, have {}",
                len,
                rest.len()
            )));
        }
        let digest = Digest::from_slice(&rest[..len])
            .ok_or_else(|| IndexError::Corrupted(format!("bad digest length {len}")))?;
        sequence.push(digest);
        raw = &rest[len..];
    }
    Ok(sequence)
}
