//! SQLite-backed block store.
//!
//! ```text
//! blockstorage(digest BLOB PRIMARY KEY, nlink INTEGER, payload BLOB)
//! ```

use std::path::Path;

use sqlx::Row;
use tracing::{debug, instrument, warn};

use crate::{BackendKind, BlockStats, BlockStore, CasError, Digest, Result, SqliteDb};

const SCHEMA: &[&str] = &["CREATE TABLE IF NOT EXISTS blockstorage (
        digest BLOB PRIMARY KEY,
        nlink INTEGER NOT NULL,
        payload BLOB NOT NULL
    )"];

pub struct SqliteBlockStore {
    db: SqliteDb,
}

/// What a refcount decrement did.
enum Released {
    Unknown,
    Purged,
    Decremented,
}

impl SqliteBlockStore {
    /// Open or create `blockstorage.db` at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = SqliteDb::open(path)?;
        db.execute_batch(SCHEMA)?;
        Ok(Self { db })
    }
}

impl BlockStore for SqliteBlockStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    #[instrument(skip(self, payload), fields(len = payload.len()), level = "debug")]
    fn put(&self, payload: &[u8], digest: &Digest) -> Result<()> {
        let key = digest.as_bytes();
        let inserted = self.db.block_on(async {
            let mut tx = self.db.pool().begin().await?;
            let updated = sqlx::query("UPDATE blockstorage SET nlink = nlink + 1 WHERE digest = ?")
                .bind(key)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            if updated == 0 {
                sqlx::query("INSERT INTO blockstorage (digest, nlink, payload) VALUES (?, 1, ?)")
                    .bind(key)
                    .bind(payload)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
            Ok::<_, sqlx::Error>(updated == 0)
        })?;
        if !inserted {
            debug!("duplicate block");
        }
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        let payload = self.db.block_on(async {
            let row = sqlx::query("SELECT payload FROM blockstorage WHERE digest = ?")
                .bind(digest.as_bytes())
                .fetch_optional(self.db.pool())
                .await?;
            row.map(|row| row.try_get::<Vec<u8>, _>("payload"))
                .transpose()
        })?;
        payload.ok_or(CasError::NotFound { digest: *digest })
    }

    fn exists(&self, digest: &Digest) -> Result<bool> {
        Ok(self.refcount(digest)?.is_some())
    }

    #[instrument(skip(self), level = "debug")]
    fn delete(&self, digest: &Digest) -> Result<()> {
        let key = digest.as_bytes();
        let released = self.db.block_on(async {
            let mut tx = self.db.pool().begin().await?;
            let row = sqlx::query("SELECT nlink FROM blockstorage WHERE digest = ?")
                .bind(key)
                .fetch_optional(&mut *tx)
                .await?;
            let nlink = match row {
                Some(row) => row.try_get::<i64, _>("nlink")?,
                None => return Ok::<_, sqlx::Error>(Released::Unknown),
            };
            let released = if nlink <= 1 {
                sqlx::query("DELETE FROM blockstorage WHERE digest = ?")
                    .bind(key)
                    .execute(&mut *tx)
                    .await?;
                Released::Purged
            } else {
                sqlx::query("UPDATE blockstorage SET nlink = nlink - 1 WHERE digest = ?")
                    .bind(key)
                    .execute(&mut *tx)
                    .await?;
                Released::Decremented
            };
            tx.commit().await?;
            Ok(released)
        })?;
        match released {
            Released::Unknown => warn!(digest = %digest, "delete of unknown block ignored"),
            Released::Purged => debug!("last reference dropped, payload purged"),
            Released::Decremented => {}
        }
        Ok(())
    }

    fn refcount(&self, digest: &Digest) -> Result<Option<u64>> {
        let nlink = self.db.block_on(async {
            let row = sqlx::query("SELECT nlink FROM blockstorage WHERE digest = ?")
                .bind(digest.as_bytes())
                .fetch_optional(self.db.pool())
                .await?;
            row.map(|row| row.try_get::<i64, _>("nlink")).transpose()
        })?;
        Ok(nlink.map(|n| n.max(0) as u64))
    }

    fn report(&self) -> Result<BlockStats> {
        let (blocks, refs, bytes) = self.db.block_on(async {
            let row = sqlx::query(
                "SELECT COUNT(*) AS blocks,
                        COALESCE(SUM(nlink), 0) AS refs,
                        COALESCE(SUM(LENGTH(payload)), 0) AS bytes
                 FROM blockstorage",
            )
            .fetch_one(self.db.pool())
            .await?;
            Ok::<_, sqlx::Error>((
                row.try_get::<i64, _>("blocks")?,
                row.try_get::<i64, _>("refs")?,
                row.try_get::<i64, _>("bytes")?,
            ))
        })?;
        Ok(BlockStats {
            block_count: blocks.max(0) as u64,
            total_references: refs.max(0) as u64,
            stored_bytes: bytes.max(0) as u64,
        })
    }

    fn digests(&self) -> Result<Vec<Digest>> {
        let keys = self.db.block_on(async {
            let rows = sqlx::query("SELECT digest FROM blockstorage")
                .fetch_all(self.db.pool())
                .await?;
            rows.iter()
                .map(|row| row.try_get::<Vec<u8>, _>("digest"))
                .collect::<std::result::Result<Vec<_>, _>>()
        })?;
        let mut digests: Vec<Digest> = keys.iter().filter_map(|k| Digest::from_slice(k)).collect();
        digests.sort();
        Ok(digests)
    }

    fn flush(&self) -> Result<()> {
        self.db.checkpoint()
    }
}
