//! Per-digest mutual exclusion for backends without native transactions.
//!
//! Digests are uniformly distributed, so their leading bytes pick a shard
//! directly. Two digests may share a shard; that only costs contention,
//! never correctness.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::Digest;

/// Fixed array of mutex shards keyed by digest.
#[derive(Debug)]
pub struct DigestLocks {
    shards: Box<[Mutex<()>]>,
}

impl DigestLocks {
    pub const DEFAULT_SHARDS: usize = 256;

    pub fn new(shards: usize) -> Self {
        let shards = shards.max(1);
        Self {
            shards: (0..shards).map(|_| Mutex::new(())).collect(),
        }
    }

    fn shard_index(&self, digest: &Digest) -> usize {
        let mut prefix = [0u8; 8];
        let bytes = digest.as_bytes();
        let n = bytes.len().min(8);
        prefix[..n].copy_from_slice(&bytes[..n]);
        (u64::from_le_bytes(prefix) % self.shards.len() as u64) as usize
    }

    /// Hold the shard for `digest` until the guard drops.
    pub fn lock(&self, digest: &Digest) -> MutexGuard<'_, ()> {
        // The guarded data is `()`, so a poisoned shard carries no broken state.
        self.shards[self.shard_index(digest)]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for DigestLocks {
    fn default() -> Self {
        Self::new(Self::DEFAULT_SHARDS)
    }
}
