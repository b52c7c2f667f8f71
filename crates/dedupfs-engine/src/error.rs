//! Engine error type and its mapping onto errno values.

use dedupfs_cas::{CasError, Digest};
use dedupfs_config::ConfigError;
use dedupfs_index::IndexError;
use thiserror::Error;

/// Errors surfaced by [`MetaStorage`](crate::MetaStorage)
#[derive(Error, Debug)]
pub enum DedupError {
    #[error("No such file or directory: {path}")]
    NotFound { path: String },

    #[error("File exists: {path}")]
    AlreadyExists { path: String },

    #[error("Not a directory: {path}")]
    NotADirectory { path: String },

    #[error("Is a directory: {path}")]
    IsDirectory { path: String },

    #[error("Directory not empty: {path}")]
    NotEmpty { path: String },

    #[error("Invalid argument for {path}: {reason}")]
    InvalidArgument { path: String, reason: String },

    #[error("Invalid state for {path}: {reason}")]
    InvalidState { path: String, reason: String },

    #[error("File record {digest} for {path} is missing")]
    FileRecordMissing { path: String, digest: Digest },

    #[error("Integrity violation at {digest}: {reason}")]
    Integrity { digest: Digest, reason: String },

    #[error("Storage root was created with {field} = {stored}, requested {requested}")]
    ConfigMismatch {
        field: &'static str,
        stored: String,
        requested: String,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Cas(#[from] CasError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DedupError>;

/// Coarse classification callers can branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Integrity,
    StorageBackend,
    InvalidState,
    InvalidArgument,
}

impl DedupError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DedupError::NotFound { .. } | DedupError::FileRecordMissing { .. } => {
                ErrorKind::NotFound
            }
            DedupError::AlreadyExists { .. }
            | DedupError::NotADirectory { .. }
            | DedupError::IsDirectory { .. }
            | DedupError::NotEmpty { .. }
            | DedupError::InvalidArgument { .. }
            | DedupError::ConfigMismatch { .. }
            | DedupError::Config(_) => ErrorKind::InvalidArgument,
            DedupError::InvalidState { .. } => ErrorKind::InvalidState,
            DedupError::Integrity { .. } => ErrorKind::Integrity,
            // A block that a sequence names but the store lacks means corruption.
            DedupError::Cas(CasError::NotFound { .. })
            | DedupError::Cas(CasError::HashMismatch { .. })
            | DedupError::Cas(CasError::Corrupted { .. })
            | DedupError::Index(IndexError::Corrupted(_)) => ErrorKind::Integrity,
            DedupError::Index(IndexError::NotFound { .. }) => ErrorKind::NotFound,
            DedupError::Index(IndexError::AlreadyExists { .. }) => ErrorKind::InvalidArgument,
            DedupError::Cas(_) | DedupError::Index(_) | DedupError::Io(_) => {
                ErrorKind::StorageBackend
            }
        }
    }

    /// errno for the filesystem-call boundary.
    pub fn errno(&self) -> i32 {
        match self {
            DedupError::NotFound { .. }
            | DedupError::FileRecordMissing { .. }
            | DedupError::Index(IndexError::NotFound { .. }) => libc::ENOENT,
            DedupError::AlreadyExists { .. } | DedupError::Index(IndexError::AlreadyExists { .. }) => {
                libc::EEXIST
            }
            DedupError::NotADirectory { .. } => libc::ENOTDIR,
            DedupError::IsDirectory { .. } => libc::EISDIR,
            DedupError::NotEmpty { .. } => libc::ENOTEMPTY,
            DedupError::InvalidArgument { .. }
            | DedupError::ConfigMismatch { .. }
            | DedupError::Config(_) => libc::EINVAL,
            DedupError::InvalidState { .. } => libc::EBADF,
            DedupError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            DedupError::Integrity { .. } | DedupError::Cas(_) | DedupError::Index(_) => libc::EIO,
        }
    }

    pub fn not_found(path: &str) -> Self {
        DedupError::NotFound {
            path: path.to_string(),
        }
    }

    pub fn invalid_argument(path: &str, reason: impl Into<String>) -> Self {
        DedupError::InvalidArgument {
            path: path.to_string(),
            reason: reason.into(),
        }
    }

    pub fn invalid_state(path: &str, reason: impl Into<String>) -> Self {
        DedupError::InvalidState {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dedupfs_cas::HashAlgorithm;

    #[test]
    fn test_kind_and_errno() {
        let e = DedupError::not_found("/a");
        assert_eq!(e.kind(), ErrorKind::NotFound);
        assert_eq!(e.errno(), libc::ENOENT);

        let e = DedupError::NotEmpty {
            path: "/d".to_string(),
        };
        assert_eq!(e.kind(), ErrorKind::InvalidArgument);
        assert_eq!(e.errno(), libc::ENOTEMPTY);

        let e = DedupError::invalid_state("/f", "no open write session");
        assert_eq!(e.kind(), ErrorKind::InvalidState);
        assert_eq!(e.errno(), libc::EBADF);
    }

    #[test]
    fn test_missing_block_is_integrity() {
        let digest = HashAlgorithm::Sha1.digest(b"gone");
        let e = DedupError::from(CasError::NotFound { digest });
        assert_eq!(e.kind(), ErrorKind::Integrity);
        assert_eq!(e.errno(), libc::EIO);

        let e = DedupError::from(CasError::Io(std::io::Error::other("disk")));
        assert_eq!(e.kind(), ErrorKind::StorageBackend);
    }

    #[test]
    fn test_io_errno_passthrough() {
        let e = DedupError::from(std::io::Error::from_raw_os_error(libc::ENOSPC));
        assert_eq!(e.errno(), libc::ENOSPC);
    }
}
