//! LMDB-backed block store.
//!
//! Payloads and refcounts live in two named databases of one environment,
//! so every put/delete is a single atomic write transaction.

use std::path::Path;

use heed::types::{Bytes, SerdeBincode};
use heed::{Database, Env, EnvOpenOptions};
use tracing::{debug, instrument, warn};

use crate::{BackendKind, BlockStats, BlockStore, Digest, Result};

pub struct LmdbBlockStore {
    env: Env,

    /// digest → payload
    blocks: Database<Bytes, Bytes>,

    /// digest → refcount
    refs: Database<Bytes, SerdeBincode<u64>>,
}

impl LmdbBlockStore {
    /// Default LMDB map size: 4GB
    pub const DEFAULT_MAP_SIZE: usize = 4 * 1024 * 1024 * 1024;

    const MAX_READERS: u32 = 128;

    /// Open or create the environment at `path` (a directory).
    pub fn open<P: AsRef<Path>>(path: P, map_size: usize) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_readers(Self::MAX_READERS)
                .max_dbs(2)
                .open(path)?
        };

        let mut wtxn = env.write_txn()?;
        let blocks = env.create_database(&mut wtxn, Some("blocks"))?;
        let refs = env.create_database(&mut wtxn, Some("refs"))?;
        wtxn.commit()?;

        debug!("Opened LMDB block store at {:?}", path);

        Ok(Self { env, blocks, refs })
    }
}

impl BlockStore for LmdbBlockStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Lmdb
    }

    #[instrument(skip(self, payload), fields(len = payload.len()), level = "debug")]
    fn put(&self, payload: &[u8], digest: &Digest) -> Result<()> {
        let key = digest.as_bytes();
        let mut wtxn = self.env.write_txn()?;
        match self.refs.get(&wtxn, key)? {
            Some(count) => {
                self.refs.put(&mut wtxn, key, &(count + 1))?;
            }
            None => {
                self.blocks.put(&mut wtxn, key, payload)?;
                self.refs.put(&mut wtxn, key, &1)?;
            }
        }
        wtxn.commit()?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        let rtxn = self.env.read_txn()?;
        match self.blocks.get(&rtxn, digest.as_bytes())? {
            Some(payload) => Ok(payload.to_vec()),
            None => Err(crate::CasError::NotFound { digest: *digest }),
        }
    }

    fn exists(&self, digest: &Digest) -> Result<bool> {
        let rtxn = self.env.read_txn()?;
        Ok(self.refs.get(&rtxn, digest.as_bytes())?.is_some())
    }

    #[instrument(skip(self), level = "debug")]
    fn delete(&self, digest: &Digest) -> Result<()> {
        let key = digest.as_bytes();
        let mut wtxn = self.env.write_txn()?;
        match self.refs.get(&wtxn, key)? {
            None => {
                wtxn.abort();
                warn!(digest = %digest, "delete of unknown block ignored");
                return Ok(());
            }
            Some(count) if count <= 1 => {
                self.refs.delete(&mut wtxn, key)?;
                self.blocks.delete(&mut wtxn, key)?;
            }
            Some(count) => {
                self.refs.put(&mut wtxn, key, &(count - 1))?;
            }
        }
        wtxn.commit()?;
        Ok(())
    }

    fn refcount(&self, digest: &Digest) -> Result<Option<u64>> {
        let rtxn = self.env.read_txn()?;
        Ok(self.refs.get(&rtxn, digest.as_bytes())?)
    }

    fn report(&self) -> Result<BlockStats> {
        let rtxn = self.env.read_txn()?;
        let mut stats = BlockStats::default();
        for item in self.refs.iter(&rtxn)? {
            let (_, count) = item?;
            stats.block_count += 1;
            stats.total_references += count;
        }
        for item in self.blocks.iter(&rtxn)? {
            let (_, payload) = item?;
            stats.stored_bytes += payload.len() as u64;
        }
        Ok(stats)
    }

    fn digests(&self) -> Result<Vec<Digest>> {
        let rtxn = self.env.read_txn()?;
        let mut digests = Vec::new();
        for item in self.refs.iter(&rtxn)? {
            let (key, _) = item?;
            if let Some(digest) = Digest::from_slice(key) {
                digests.push(digest);
            }
        }
        digests.sort();
        Ok(digests)
    }

    fn flush(&self) -> Result<()> {
        self.env.force_sync()?;
        Ok(())
    }
}
