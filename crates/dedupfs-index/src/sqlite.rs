//! SQLite-backed file index and path table.
//!
//! ```text
//! filestorage(digest BLOB PRIMARY KEY, nlink INTEGER, sequence BLOB)
//! metastorage(abspath TEXT PRIMARY KEY, parent TEXT, digest BLOB,
//!             mode, uid, gid, size, atime, mtime, ctime, nlink)
//! ```

use std::path::Path;

use dedupfs_cas::{Digest, SqliteDb};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::{debug, instrument, warn};

use crate::{
    decode_sequence, encode_sequence, parent_of, FileIndex, FileIndexStats, FileRecord,
    IndexError, PathEntry, PathTable, Result, Stat,
};

const FILE_SCHEMA: &[&str] = &["CREATE TABLE IF NOT EXISTS filestorage (
        digest BLOB PRIMARY KEY,
        nlink INTEGER NOT NULL,
        sequence BLOB NOT NULL
    )"];

const META_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS metastorage (
        abspath TEXT PRIMARY KEY,
        parent TEXT NOT NULL,
        digest BLOB,
        mode INTEGER NOT NULL,
        uid INTEGER NOT NULL,
        gid INTEGER NOT NULL,
        size INTEGER NOT NULL,
        atime INTEGER NOT NULL,
        mtime INTEGER NOT NULL,
        ctime INTEGER NOT NULL,
        nlink INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS metastorage_parent ON metastorage (parent)",
];

const META_COLUMNS: &str =
    "abspath, parent, digest, mode, uid, gid, size, atime, mtime, ctime, nlink";

fn digest_from_column(raw: &[u8]) -> Result<Digest> {
    Digest::from_slice(raw)
        .ok_or_else(|| IndexError::Corrupted(format!("bad digest length {}", raw.len())))
}

pub struct SqliteFileIndex {
    db: SqliteDb,
}

impl SqliteFileIndex {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = SqliteDb::open(path)?;
        db.execute_batch(FILE_SCHEMA)?;
        Ok(Self { db })
    }

    fn record_from_row(row: &SqliteRow) -> Result<FileRecord> {
        let digest: Vec<u8> = row.try_get("digest")?;
        let nlink: i64 = row.try_get("nlink")?;
        let sequence: Vec<u8> = row.try_get("sequence")?;
        Ok(FileRecord {
            digest: digest_from_column(&digest)?,
            refcount: nlink.max(0) as u64,
            sequence: decode_sequence(&sequence)?,
        })
    }
}

impl FileIndex for SqliteFileIndex {
    #[instrument(skip(self, sequence), fields(blocks = sequence.len()), level = "debug")]
    fn put(&self, digest: &Digest, sequence: &[Digest]) -> Result<u64> {
        let key = digest.as_bytes();
        let packed = encode_sequence(sequence);
        let nlink = self.db.block_on(async {
            let mut tx = self.db.pool().begin().await?;
            let updated = sqlx::query("UPDATE filestorage SET nlink = nlink + 1 WHERE digest = ?")
                .bind(key)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            if updated == 0 {
                sqlx::query("INSERT INTO filestorage (digest, nlink, sequence) VALUES (?, 1, ?)")
                    .bind(key)
                    .bind(&packed)
                    .execute(&mut *tx)
                    .await?;
            }
            let row = sqlx::query("SELECT nlink FROM filestorage WHERE digest = ?")
                .bind(key)
                .fetch_one(&mut *tx)
                .await?;
            let nlink: i64 = row.try_get("nlink")?;
            tx.commit().await?;
            Ok::<_, sqlx::Error>(nlink)
        })?;
        Ok(nlink.max(0) as u64)
    }

    fn get(&self, digest: &Digest) -> Result<Option<Vec<Digest>>> {
        Ok(self.record(digest)?.map(|record| record.sequence))
    }

    fn record(&self, digest: &Digest) -> Result<Option<FileRecord>> {
        let row = self.db.block_on(
            sqlx::query("SELECT digest, nlink, sequence FROM filestorage WHERE digest = ?")
                .bind(digest.as_bytes())
                .fetch_optional(self.db.pool()),
        )?;
        row.as_ref().map(Self::record_from_row).transpose()
    }

    #[instrument(skip(self), level = "debug")]
    fn delete(&self, digest: &Digest) -> Result<Option<u64>> {
        let key = digest.as_bytes();
        let remaining = self.db.block_on(async {
            let mut tx = self.db.pool().begin().await?;
            let row = sqlx::query("SELECT nlink FROM filestorage WHERE digest = ?")
                .bind(key)
                .fetch_optional(&mut *tx)
                .await?;
            let nlink: i64 = match row {
                Some(row) => row.try_get("nlink")?,
                None => return Ok::<_, sqlx::Error>(None),
            };
            let remaining = if nlink <= 1 {
                sqlx::query("DELETE FROM filestorage WHERE digest = ?")
                    .bind(key)
                    .execute(&mut *tx)
                    .await?;
                0
            } else {
                sqlx::query("UPDATE filestorage SET nlink = nlink - 1 WHERE digest = ?")
                    .bind(key)
                    .execute(&mut *tx)
                    .await?;
                nlink - 1
            };
            tx.commit().await?;
            Ok(Some(remaining as u64))
        })?;
        if remaining.is_none() {
            warn!(digest = %digest, "delete of unknown file record ignored");
        }
        Ok(remaining)
    }

    fn records(&self) -> Result<Vec<FileRecord>> {
        let rows = self.db.block_on(
            sqlx::query("SELECT digest, nlink, sequence FROM filestorage")
                .fetch_all(self.db.pool()),
        )?;
        rows.iter().map(Self::record_from_row).collect()
    }

    fn report(&self) -> Result<FileIndexStats> {
        let row = self.db.block_on(
            sqlx::query(
                "SELECT COUNT(*) AS files, COALESCE(SUM(nlink), 0) AS refs FROM filestorage",
            )
            .fetch_one(self.db.pool()),
        )?;
        let files: i64 = row.try_get("files")?;
        let refs: i64 = row.try_get("refs")?;
        Ok(FileIndexStats {
            file_count: files.max(0) as u64,
            total_references: refs.max(0) as u64,
        })
    }

    fn flush(&self) -> Result<()> {
        Ok(self.db.checkpoint()?)
    }
}

pub struct SqlitePathTable {
    db: SqliteDb,
}

impl SqlitePathTable {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = SqliteDb::open(path)?;
        db.execute_batch(META_SCHEMA)?;
        debug!("Opened SQLite path table at {:?}", db.path());
        Ok(Self { db })
    }

    fn entry_from_row(row: &SqliteRow) -> Result<PathEntry> {
        let digest: Option<Vec<u8>> = row.try_get("digest")?;
        let digest = digest.as_deref().map(digest_from_column).transpose()?;
        Ok(PathEntry {
            abspath: row.try_get("abspath")?,
            parent: row.try_get("parent")?,
            digest,
            stat: Stat {
                mode: row.try_get::<i64, _>("mode")? as u32,
                uid: row.try_get::<i64, _>("uid")? as u32,
                gid: row.try_get::<i64, _>("gid")? as u32,
                size: row.try_get::<i64, _>("size")?.max(0) as u64,
                atime: row.try_get("atime")?,
                mtime: row.try_get("mtime")?,
                ctime: row.try_get("ctime")?,
                nlink: row.try_get::<i64, _>("nlink")? as u32,
            },
        })
    }

    fn select(&self, clause: &str, binds: &[&str]) -> Result<Vec<PathEntry>> {
        let sql = format!("SELECT {META_COLUMNS} FROM metastorage {clause}");
        let rows = self.db.block_on(async {
            let mut query = sqlx::query(&sql);
            for value in binds {
                query = query.bind(*value);
            }
            query.fetch_all(self.db.pool()).await
        })?;
        rows.iter().map(Self::entry_from_row).collect()
    }
}

impl PathTable for SqlitePathTable {
    #[instrument(skip(self, entry), fields(path = %entry.abspath), level = "debug")]
    fn insert(&self, entry: &PathEntry) -> Result<()> {
        let inserted = self.db.block_on(
            sqlx::query(
                "INSERT OR IGNORE INTO metastorage
                 (abspath, parent, digest, mode, uid, gid, size, atime, mtime, ctime, nlink)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&entry.abspath)
            .bind(&entry.parent)
            .bind(entry.digest.as_ref().map(|d| d.as_bytes().to_vec()))
            .bind(entry.stat.mode as i64)
            .bind(entry.stat.uid as i64)
            .bind(entry.stat.gid as i64)
            .bind(entry.stat.size as i64)
            .bind(entry.stat.atime)
            .bind(entry.stat.mtime)
            .bind(entry.stat.ctime)
            .bind(entry.stat.nlink as i64)
            .execute(self.db.pool()),
        )?;
        if inserted.rows_affected() == 0 {
            return Err(IndexError::AlreadyExists {
                path: entry.abspath.clone(),
            });
        }
        Ok(())
    }

    fn get(&self, abspath: &str) -> Result<Option<PathEntry>> {
        Ok(self.select("WHERE abspath = ?", &[abspath])?.pop())
    }

    fn update(&self, entry: &PathEntry) -> Result<()> {
        let updated = self.db.block_on(
            sqlx::query(
                "UPDATE metastorage SET parent = ?, digest = ?, mode = ?, uid = ?, gid = ?,
                 size = ?, atime = ?, mtime = ?, ctime = ?, nlink = ?
                 WHERE abspath = ?",
            )
            .bind(&entry.parent)
            .bind(entry.digest.as_ref().map(|d| d.as_bytes().to_vec()))
            .bind(entry.stat.mode as i64)
            .bind(entry.stat.uid as i64)
            .bind(entry.stat.gid as i64)
            .bind(entry.stat.size as i64)
            .bind(entry.stat.atime)
            .bind(entry.stat.mtime)
            .bind(entry.stat.ctime)
            .bind(entry.stat.nlink as i64)
            .bind(&entry.abspath)
            .execute(self.db.pool()),
        )?;
        if updated.rows_affected() == 0 {
            return Err(IndexError::NotFound {
                path: entry.abspath.clone(),
            });
        }
        Ok(())
    }

    fn remove(&self, abspath: &str) -> Result<Option<PathEntry>> {
        let Some(entry) = self.get(abspath)? else {
            return Ok(None);
        };
        self.db.block_on(
            sqlx::query("DELETE FROM metastorage WHERE abspath = ?")
                .bind(abspath)
                .execute(self.db.pool()),
        )?;
        Ok(Some(entry))
    }

    fn children(&self, parent: &str) -> Result<Vec<PathEntry>> {
        self.select(
            "WHERE parent = ? AND abspath != parent ORDER BY abspath",
            &[parent],
        )
    }

    fn descendants(&self, abspath: &str) -> Result<Vec<PathEntry>> {
        let prefix = if abspath == "/" {
            "/".to_string()
        } else {
            format!("{abspath}/")
        };
        // substr() compares bytes literally; LIKE would treat `_` and `%` as wildcards.
        let sql = format!(
            "SELECT {META_COLUMNS} FROM metastorage
             WHERE substr(abspath, 1, ?) = ? AND abspath != ? ORDER BY abspath"
        );
        let rows = self.db.block_on(
            sqlx::query(&sql)
                .bind(prefix.chars().count() as i64)
                .bind(&prefix)
                .bind(abspath)
                .fetch_all(self.db.pool()),
        )?;
        rows.iter().map(Self::entry_from_row).collect()
    }

    #[instrument(skip(self), level = "debug")]
    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let parent = parent_of(to);
        let found = self.db.block_on(async {
            let mut tx = self.db.pool().begin().await?;
            let exists = sqlx::query("SELECT 1 FROM metastorage WHERE abspath = ?")
                .bind(from)
                .fetch_optional(&mut *tx)
                .await?
                .is_some();
            if !exists {
                return Ok::<_, sqlx::Error>(false);
            }
            sqlx::query("DELETE FROM metastorage WHERE abspath = ?")
                .bind(to)
                .execute(&mut *tx)
                .await?;
            sqlx::query("UPDATE metastorage SET abspath = ?, parent = ? WHERE abspath = ?")
                .bind(to)
                .bind(parent)
                .bind(from)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(true)
        })?;
        if !found {
            return Err(IndexError::NotFound {
                path: from.to_string(),
            });
        }
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        let row = self.db.block_on(
            sqlx::query("SELECT COUNT(*) AS n FROM metastorage").fetch_one(self.db.pool()),
        )?;
        let n: i64 = row.try_get("n")?;
        Ok(n.max(0) as u64)
    }

    fn entries(&self) -> Result<Vec<PathEntry>> {
        self.select("ORDER BY abspath", &[])
    }

    fn flush(&self) -> Result<()> {
        Ok(self.db.checkpoint()?)
    }
}
