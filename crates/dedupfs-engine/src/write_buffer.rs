//! Fixed-size chunker for one write session.
//!
//! Bytes are cut at absolute multiples of `blocksize`, so the resulting
//! sequence depends only on the byte stream, never on how it was split into
//! `add` calls.
//!
//! ```text
//! add(a) add(b)       add(c)
//! |-------|-----------|-----|
//! [ block 0 ][ block 1 ][ 2 ]   ← release flushes the short tail
//! ```

use std::sync::Arc;

use dedupfs_cas::{BlockStore, Digest, HashAlgorithm, Hasher};
use tracing::instrument;

use crate::Result;

/// What a finished session produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleasedFile {
    /// Hash over every byte of the file
    pub digest: Digest,
    /// Block digests in file order
    pub sequence: Vec<Digest>,
    pub size: u64,
}

pub struct WriteBuffer {
    blocksize: usize,
    hash: HashAlgorithm,
    store: Arc<dyn BlockStore>,
    buf: Vec<u8>,
    file_hasher: Hasher,
    size: u64,
    sequence: Vec<Digest>,
}

impl WriteBuffer {
    pub fn new(store: Arc<dyn BlockStore>, blocksize: usize, hash: HashAlgorithm) -> Self {
        let blocksize = blocksize.max(1);
        Self {
            blocksize,
            hash,
            store,
            buf: Vec::with_capacity(blocksize),
            file_hasher: hash.hasher(),
            size: 0,
            sequence: Vec::new(),
        }
    }

    /// Append `data`, storing every block it completes. Returns the number
    /// of bytes consumed, which is always `data.len()`.
    ///
    /// A failed block store leaves the pending block buffered; the session
    /// should be aborted or released rather than the same bytes re-added.
    #[instrument(skip(self, data), fields(len = data.len()), level = "trace")]
    pub fn add(&mut self, data: &[u8]) -> Result<usize> {
        let mut rest = data;
        while !rest.is_empty() {
            let take = (self.blocksize - self.buf.len()).min(rest.len());
            self.buf.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.buf.len() == self.blocksize {
                self.flush()?;
            }
        }
        Ok(data.len())
    }

    /// Store the buffered bytes as one block. On error nothing is counted
    /// and the bytes stay buffered for the next attempt.
    fn flush(&mut self) -> Result<()> {
        let digest = self.hash.digest(&self.buf);
        self.store.put(&self.buf, &digest)?;
        self.file_hasher.update(&self.buf);
        self.size += self.buf.len() as u64;
        self.sequence.push(digest);
        self.buf.clear();
        Ok(())
    }

    /// Flush the tail and hand back the file. The buffer is reset and can
    /// take the next file.
    pub fn release(&mut self) -> Result<ReleasedFile> {
        if !self.buf.is_empty() {
            self.flush()?;
        }
        let hasher = std::mem::replace(&mut self.file_hasher, self.hash.hasher());
        let released = ReleasedFile {
            digest: hasher.finalize(),
            sequence: std::mem::take(&mut self.sequence),
            size: self.size,
        };
        self.size = 0;
        Ok(released)
    }

    /// Drop the session, releasing every block already stored.
    pub fn abort(mut self) -> Result<()> {
        for digest in std::mem::take(&mut self.sequence) {
            self.store.delete(&digest)?;
        }
        Ok(())
    }

    /// Bytes accepted so far, flushed or not.
    pub fn len(&self) -> u64 {
        self.size + self.buf.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Blocks stored so far.
    pub fn flushed_blocks(&self) -> usize {
        self.sequence.len()
    }
}
