//! # dedupfs-cas
//!
//! Content-addressed, reference-counted block storage for dedupfs.
//!
//! Blocks are keyed by the digest the caller computed over their payload.
//! Storing a digest that is already present only bumps its reference count;
//! deleting decrements it and the payload is purged when the count hits zero.
//!
//! ## Backends
//!
//! All backends implement [`BlockStore`] and differ only in how they persist
//! `digest -> payload` and `digest -> refcount`:
//!
//! - [`FileBlockStore`]: one payload file per block plus a sidecar refcount file
//! - [`LmdbBlockStore`]: two LMDB databases inside one environment
//! - [`SqliteBlockStore`]: a single relational table
//!
//! On-disk layouts are incompatible, so a storage root is bound to exactly one
//! [`BackendKind`] when it is created.
//!
//! ```text
//! <root>/blocks/
//! └── ab/
//!     └── cd/
//!         ├── abcd1234...ef.blk   # payload
//!         └── abcd1234...ef.ref   # refcount (decimal text)
//! ```

mod digest;
mod file_store;
mod hash;
mod lmdb_store;
mod locks;
pub mod sqlite;
mod sqlite_store;

pub use digest::{Digest, MAX_DIGEST_LEN};
pub use file_store::FileBlockStore;
pub use hash::{HashAlgorithm, Hasher};
pub use lmdb_store::LmdbBlockStore;
pub use locks::DigestLocks;
pub use sqlite::SqliteDb;
pub use sqlite_store::SqliteBlockStore;

use std::fmt;
use std::io;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during block storage operations
#[derive(Error, Debug)]
pub enum CasError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("LMDB error: {0}")]
    Lmdb(#[from] heed::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("Block not found: {digest}")]
    NotFound { digest: Digest },

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: Digest, actual: Digest },

    #[error("Corrupted block record {digest}: {reason}")]
    Corrupted { digest: Digest, reason: String },

    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    #[error("Unknown hash algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("Unknown storage backend: {0}")]
    UnknownBackend(String),
}

impl CasError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CasError::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, CasError>;

/// Persistence variant of a storage root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Flat block files with sidecar refcounts; metadata tables in LMDB
    #[default]
    Files,
    /// Everything in LMDB
    Lmdb,
    /// Everything in SQLite
    Sqlite,
}

impl BackendKind {
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Files => "files",
            BackendKind::Lmdb => "lmdb",
            BackendKind::Sqlite => "sqlite",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = CasError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "files" | "file" => Ok(BackendKind::Files),
            "lmdb" => Ok(BackendKind::Lmdb),
            "sqlite" => Ok(BackendKind::Sqlite),
            other => Err(CasError::UnknownBackend(other.to_string())),
        }
    }
}

/// Content-addressed, reference-counted block storage.
///
/// Content addressing is trusted: `put` never re-hashes the payload, so the
/// caller must pass the digest it computed over exactly these bytes.
/// Operations on the same digest are serialized by every implementation.
pub trait BlockStore: Send + Sync {
    /// Which persistence variant this is.
    fn kind(&self) -> BackendKind;

    /// Store `payload` under `digest`, or bump the refcount if it is present.
    fn put(&self, payload: &[u8], digest: &Digest) -> Result<()>;

    /// Fetch a payload. A missing digest is [`CasError::NotFound`].
    fn get(&self, digest: &Digest) -> Result<Vec<u8>>;

    /// True iff a record is present, whatever its refcount.
    fn exists(&self, digest: &Digest) -> Result<bool>;

    /// Drop one reference, purging payload and record at zero.
    /// Unknown digests are logged and ignored.
    fn delete(&self, digest: &Digest) -> Result<()>;

    /// Current refcount, `None` if no record exists.
    fn refcount(&self, digest: &Digest) -> Result<Option<u64>>;

    /// Aggregate statistics.
    fn report(&self) -> Result<BlockStats>;

    /// Every digest with a live record.
    fn digests(&self) -> Result<Vec<Digest>>;

    /// Push buffered state to durable storage.
    fn flush(&self) -> Result<()>;
}

/// Aggregate statistics about a block store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStats {
    /// Number of unique blocks stored
    pub block_count: u64,
    /// Sum of all refcounts
    pub total_references: u64,
    /// Payload bytes on disk (deduplicated)
    pub stored_bytes: u64,
}

impl BlockStats {
    /// References per stored block; 1.0 means no sharing.
    pub fn dedup_ratio(&self) -> f64 {
        if self.block_count == 0 {
            0.0
        } else {
            self.total_references as f64 / self.block_count as f64
        }
    }
}
