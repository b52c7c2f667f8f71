//! # dedupfs-engine
//!
//! Deduplicating storage engine. Files are cut into fixed-size blocks that
//! live once in a [`BlockStore`](dedupfs_cas::BlockStore); byte-identical
//! files share one [`FileIndex`](dedupfs_index::FileIndex) record and paths
//! point at it through the [`PathTable`](dedupfs_index::PathTable).
//!
//! [`MetaStorage`] is the single entry point. A filesystem adapter drives it
//! with the usual call shape:
//!
//! ```ignore
//! let storage = MetaStorage::open(&config.storage)?;
//! storage.create("/report.pdf", 0o644)?;
//! storage.write("/report.pdf", &bytes)?;
//! storage.release("/report.pdf")?;
//! let head = storage.read("/report.pdf", 4096, 0)?;
//! ```

mod error;
mod meta_storage;
pub mod root;
mod stats;
mod verify;
mod write_buffer;

pub use error::{DedupError, ErrorKind, Result};
pub use meta_storage::MetaStorage;
pub use root::{RootLayout, RootSettings};
pub use stats::{EngineStats, StatsReporter};
pub use verify::{IntegrityIssue, VerifyReport};
pub use write_buffer::{ReleasedFile, WriteBuffer};
