//! Synchronous handle over an sqlx SQLite pool.
//!
//! The storage engine is synchronous, so each database owns a small tokio
//! runtime and drives every query through [`SqliteDb::block_on`]. The pool is
//! capped at a single connection: SQLite allows one writer anyway, and a
//! single connection makes every transaction exclusive across threads.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use tokio::runtime::{Builder, Runtime};
use tracing::debug;

use crate::Result;

pub struct SqliteDb {
    // Declared before `runtime` so the pool is dropped while the runtime lives.
    pool: SqlitePool,
    runtime: Runtime,
    path: PathBuf,
}

impl SqliteDb {
    const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

    /// Open or create the database file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("dedupfs-sqlite")
            .enable_all()
            .build()?;

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Self::BUSY_TIMEOUT);

        let pool = runtime.block_on(
            SqlitePoolOptions::new()
                .max_connections(1)
                .connect_with(options),
        )?;

        debug!("Opened SQLite database at {:?}", path);

        Ok(Self {
            pool,
            runtime,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run a future to completion on this database's runtime.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// Run each statement in order, outside any transaction.
    pub fn execute_batch(&self, statements: &[&str]) -> Result<()> {
        self.block_on(async {
            for statement in statements {
                sqlx::query(statement).execute(&self.pool).await?;
            }
            Ok::<_, sqlx::Error>(())
        })?;
        Ok(())
    }

    /// Fold the WAL back into the main database file.
    pub fn checkpoint(&self) -> Result<()> {
        self.block_on(
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(&self.pool),
        )?;
        Ok(())
    }
}

impl Drop for SqliteDb {
    fn drop(&mut self) {
        self.runtime.block_on(self.pool.close());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Row;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("test.db");
        let db = SqliteDb::open(&path).unwrap();
        db.execute_batch(&["CREATE TABLE t (k INTEGER PRIMARY KEY, v TEXT)"])
            .unwrap();
        assert!(path.exists());
        assert_eq!(db.path(), path);
    }

    #[test]
    fn test_data_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("reopen.db");
        {
            let db = SqliteDb::open(&path).unwrap();
            db.execute_batch(&[
                "CREATE TABLE t (k INTEGER PRIMARY KEY, v TEXT)",
                "INSERT INTO t (k, v) VALUES (1, 'one')",
            ])
            .unwrap();
            db.checkpoint().unwrap();
        }

        let db = SqliteDb::open(&path).unwrap();
        let value: String = db
            .block_on(async {
                let row = sqlx::query("SELECT v FROM t WHERE k = 1")
                    .fetch_one(db.pool())
                    .await?;
                row.try_get::<String, _>("v")
            })
            .unwrap();
        assert_eq!(value, "one");
    }
}
