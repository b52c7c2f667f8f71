//! Offline consistency check across the three stores.
//!
//! Checks, in order:
//! 1. every block payload hashes to its key
//! 2. every file sequence names present blocks and reassembles to its digest
//! 3. every path digest has a file record
//! 4. refcounts match the references actually held (only with no open sessions)

use std::collections::HashMap;
use std::fmt;

use dedupfs_cas::{CasError, Digest};
use dedupfs_config::{log_engine_info, log_engine_warn};
use serde::Serialize;

use crate::{MetaStorage, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum IntegrityIssue {
    BlockDigestMismatch {
        expected: Digest,
        actual: Digest,
    },
    MissingBlock {
        file: Digest,
        block: Digest,
    },
    FileDigestMismatch {
        expected: Digest,
        actual: Digest,
    },
    DanglingPathDigest {
        path: String,
        digest: Digest,
    },
    BlockRefcountMismatch {
        digest: Digest,
        expected: u64,
        actual: u64,
    },
    FileRefcountMismatch {
        digest: Digest,
        expected: u64,
        actual: u64,
    },
}

impl fmt::Display for IntegrityIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityIssue::BlockDigestMismatch { expected, actual } => {
                write!(f, "block {expected} hashes to {actual}")
            }
            IntegrityIssue::MissingBlock { file, block } => {
                write!(f, "file {file} names missing block {block}")
            }
            IntegrityIssue::FileDigestMismatch { expected, actual } => {
                write!(f, "file {expected} reassembles to {actual}")
            }
            IntegrityIssue::DanglingPathDigest { path, digest } => {
                write!(f, "{path} points at unknown file {digest}")
            }
            IntegrityIssue::BlockRefcountMismatch {
                digest,
                expected,
                actual,
            } => write!(f, "block {digest} refcount {actual}, expected {expected}"),
            IntegrityIssue::FileRefcountMismatch {
                digest,
                expected,
                actual,
            } => write!(f, "file {digest} refcount {actual}, expected {expected}"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifyReport {
    pub blocks_checked: u64,
    pub files_checked: u64,
    pub paths_checked: u64,
    /// Refcount checks are skipped while write sessions hold blocks
    pub refcounts_checked: bool,
    pub issues: Vec<IntegrityIssue>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

impl MetaStorage {
    /// Walk every store and report inconsistencies. Nothing is repaired.
    pub fn verify(&self) -> Result<VerifyReport> {
        let hash = self.hash_algorithm();
        let blocks = self.block_store();
        let mut report = VerifyReport::default();

        let mut block_refs: HashMap<Digest, u64> = HashMap::new();
        for digest in blocks.digests()? {
            report.blocks_checked += 1;
            let payload = match blocks.get(&digest) {
                Ok(payload) => payload,
                Err(CasError::NotFound { .. }) => continue,
                Err(e) => return Err(e.into()),
            };
            let actual = hash.digest(&payload);
            if actual != digest {
                report.issues.push(IntegrityIssue::BlockDigestMismatch {
                    expected: digest,
                    actual,
                });
            }
            block_refs.insert(digest, blocks.refcount(&digest)?.unwrap_or(0));
        }

        let mut expected_blocks: HashMap<Digest, u64> = HashMap::new();
        let mut file_refs: HashMap<Digest, u64> = HashMap::new();
        for record in self.file_index().records()? {
            report.files_checked += 1;
            file_refs.insert(record.digest, record.refcount);

            let mut hasher = hash.hasher();
            let mut complete = true;
            for block in &record.sequence {
                *expected_blocks.entry(*block).or_default() += record.refcount;
                match blocks.get(block) {
                    Ok(payload) => hasher.update(&payload),
                    Err(CasError::NotFound { .. }) => {
                        complete = false;
                        report.issues.push(IntegrityIssue::MissingBlock {
                            file: record.digest,
                            block: *block,
                        });
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            if complete {
                let actual = hasher.finalize();
                if actual != record.digest {
                    report.issues.push(IntegrityIssue::FileDigestMismatch {
                        expected: record.digest,
                        actual,
                    });
                }
            }
        }

        let mut expected_files: HashMap<Digest, u64> = HashMap::new();
        for entry in self.path_table().entries()? {
            report.paths_checked += 1;
            let Some(digest) = entry.digest else {
                continue;
            };
            *expected_files.entry(digest).or_default() += 1;
            if !file_refs.contains_key(&digest) {
                report.issues.push(IntegrityIssue::DanglingPathDigest {
                    path: entry.abspath,
                    digest,
                });
            }
        }

        if self.open_sessions() == 0 {
            report.refcounts_checked = true;
            refcount_issues(&block_refs, &expected_blocks, &mut report.issues, |digest, expected, actual| {
                IntegrityIssue::BlockRefcountMismatch { digest, expected, actual }
            });
            refcount_issues(&file_refs, &expected_files, &mut report.issues, |digest, expected, actual| {
                IntegrityIssue::FileRefcountMismatch { digest, expected, actual }
            });
        }

        if report.is_clean() {
            log_engine_info!(
                "Verification passed",
                blocks = report.blocks_checked,
                files = report.files_checked,
                paths = report.paths_checked
            );
        } else {
            for issue in &report.issues {
                log_engine_warn!("Integrity issue", issue = tracing::field::display(issue));
            }
        }
        Ok(report)
    }
}

/// Compare stored refcounts against the references that were counted.
/// Absent records are reported as missing, not here.
fn refcount_issues(
    stored: &HashMap<Digest, u64>,
    counted: &HashMap<Digest, u64>,
    issues: &mut Vec<IntegrityIssue>,
    issue: impl Fn(Digest, u64, u64) -> IntegrityIssue,
) {
    let mut mismatches: Vec<(Digest, u64, u64)> = Vec::new();
    for (digest, actual) in stored {
        let expected = counted.get(digest).copied().unwrap_or(0);
        if expected != *actual {
            mismatches.push((*digest, expected, *actual));
        }
    }
    mismatches.sort_by_key(|m| m.0);
    issues.extend(mismatches.into_iter().map(|(d, e, a)| issue(d, e, a)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use dedupfs_cas::BackendKind;
    use dedupfs_config::testing::TestEnvironment;

    fn populated(env: &TestEnvironment) -> MetaStorage {
        let storage =
            MetaStorage::open(&env.storage_config_with_blocksize(BackendKind::Files, 8)).unwrap();
        storage.mkdir("/d", 0o755).unwrap();
        for (path, body) in [("/a", &b"shared content!"[..]), ("/d/b", b"shared content!"), ("/c", b"other")] {
            storage.create(path, 0o644).unwrap();
            storage.write(path, body).unwrap();
            storage.release(path).unwrap();
        }
        storage
    }

    #[test]
    fn test_clean_store() {
        let env = TestEnvironment::new().unwrap();
        let storage = populated(&env);
        let report = storage.verify().unwrap();
        assert!(report.is_clean(), "{:?}", report.issues);
        assert!(report.refcounts_checked);
        assert_eq!(report.files_checked, 2);
        assert_eq!(report.paths_checked, 5);
    }

    #[test]
    fn test_extra_block_reference_reported() {
        let env = TestEnvironment::new().unwrap();
        let storage = populated(&env);
        let digest = storage.hash_algorithm().digest(b"other");
        storage.block_store().put(b"other", &digest).unwrap();

        let report = storage.verify().unwrap();
        assert_eq!(
            report.issues,
            vec![IntegrityIssue::BlockRefcountMismatch {
                digest,
                expected: 1,
                actual: 2
            }]
        );
    }

    #[test]
    fn test_missing_block_reported() {
        let env = TestEnvironment::new().unwrap();
        let storage = populated(&env);
        let digest = storage.hash_algorithm().digest(b"other");
        storage.block_store().delete(&digest).unwrap();

        let report = storage.verify().unwrap();
        assert!(report
            .issues
            .iter()
            .any(|i| matches!(i, IntegrityIssue::MissingBlock { block, .. } if *block == digest)));
    }

    #[test]
    fn test_open_session_skips_refcounts() {
        let env = TestEnvironment::new().unwrap();
        let storage = populated(&env);
        storage.write("/c", b"pending bytes").unwrap();

        let report = storage.verify().unwrap();
        assert!(!report.refcounts_checked);
        assert!(report.is_clean());
    }
}
