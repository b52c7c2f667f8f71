//! LMDB-backed file index and path table.
//!
//! Layout:
//! - `files`: digest bytes → `{refcount, sequence}`
//! - `paths`: blake3(abspath) → [`PathEntry`]
//! - `children`: blake3(parent) ‖ blake3(abspath) → `()`, scanned with a
//!   prefix iterator for directory listings
//!
//! Paths are hashed into fixed-length keys because LMDB caps keys at 511
//! bytes while a normalized path has no length limit.

use std::path::Path;

use dedupfs_cas::{Digest, HashAlgorithm};
use heed::types::{Bytes, SerdeBincode, Unit};
use heed::{Database, Env, EnvOpenOptions, RoTxn, RwTxn};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::{
    parent_of, FileIndex, FileIndexStats, FileRecord, IndexError, PathEntry, PathTable, Result,
};

const MAX_READERS: u32 = 128;

fn open_env(path: &Path, map_size: usize, max_dbs: u32) -> Result<Env> {
    std::fs::create_dir_all(path)?;
    let env = unsafe {
        EnvOpenOptions::new()
            .map_size(map_size)
            .max_readers(MAX_READERS)
            .max_dbs(max_dbs)
            .open(path)?
    };
    Ok(env)
}

/// Value stored per file digest
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredFile {
    refcount: u64,
    sequence: Vec<Digest>,
}

pub struct LmdbFileIndex {
    env: Env,
    files: Database<Bytes, SerdeBincode<StoredFile>>,
}

impl LmdbFileIndex {
    pub fn open<P: AsRef<Path>>(path: P, map_size: usize) -> Result<Self> {
        let path = path.as_ref();
        let env = open_env(path, map_size, 1)?;

        let mut wtxn = env.write_txn()?;
        let files = env.create_database(&mut wtxn, Some("files"))?;
        wtxn.commit()?;

        debug!("Opened LMDB file index at {:?}", path);
        Ok(Self { env, files })
    }
}

impl FileIndex for LmdbFileIndex {
    #[instrument(skip(self, sequence), fields(blocks = sequence.len()), level = "debug")]
    fn put(&self, digest: &Digest, sequence: &[Digest]) -> Result<u64> {
        let key = digest.as_bytes();
        let mut wtxn = self.env.write_txn()?;
        let stored = match self.files.get(&wtxn, key)? {
            Some(mut existing) => {
                existing.refcount += 1;
                existing
            }
            None => StoredFile {
                refcount: 1,
                sequence: sequence.to_vec(),
            },
        };
        self.files.put(&mut wtxn, key, &stored)?;
        wtxn.commit()?;
        Ok(stored.refcount)
    }

    fn get(&self, digest: &Digest) -> Result<Option<Vec<Digest>>> {
        let rtxn = self.env.read_txn()?;
        Ok(self
            .files
            .get(&rtxn, digest.as_bytes())?
            .map(|stored| stored.sequence))
    }

    fn record(&self, digest: &Digest) -> Result<Option<FileRecord>> {
        let rtxn = self.env.read_txn()?;
        Ok(self
            .files
            .get(&rtxn, digest.as_bytes())?
            .map(|stored| FileRecord {
                digest: *digest,
                refcount: stored.refcount,
                sequence: stored.sequence,
            }))
    }

    #[instrument(skip(self), level = "debug")]
    fn delete(&self, digest: &Digest) -> Result<Option<u64>> {
        let key = digest.as_bytes();
        let mut wtxn = self.env.write_txn()?;
        let remaining = match self.files.get(&wtxn, key)? {
            None => {
                wtxn.abort();
                warn!(digest = %digest, "delete of unknown file record ignored");
                return Ok(None);
            }
            Some(stored) if stored.refcount <= 1 => {
                self.files.delete(&mut wtxn, key)?;
                0
            }
            Some(mut stored) => {
                stored.refcount -= 1;
                self.files.put(&mut wtxn, key, &stored)?;
                stored.refcount
            }
        };
        wtxn.commit()?;
        Ok(Some(remaining))
    }

    fn records(&self) -> Result<Vec<FileRecord>> {
        let rtxn = self.env.read_txn()?;
        let mut records = Vec::new();
        for item in self.files.iter(&rtxn)? {
            let (key, stored) = item?;
            let digest = Digest::from_slice(key)
                .ok_or_else(|| IndexError::Corrupted(format!("bad file key length {}", key.len())))?;
            records.push(FileRecord {
                digest,
                refcount: stored.refcount,
                sequence: stored.sequence,
            });
        }
        Ok(records)
    }

    fn report(&self) -> Result<FileIndexStats> {
        let rtxn = self.env.read_txn()?;
        let mut stats = FileIndexStats::default();
        for item in self.files.iter(&rtxn)? {
            let (_, stored) = item?;
            stats.file_count += 1;
            stats.total_references += stored.refcount;
        }
        Ok(stats)
    }

    fn flush(&self) -> Result<()> {
        self.env.force_sync()?;
        Ok(())
    }
}

pub struct LmdbPathTable {
    env: Env,
    paths: Database<Bytes, SerdeBincode<PathEntry>>,
    children: Database<Bytes, Unit>,
}

/// Fixed-length key for one path.
fn path_key(abspath: &str) -> Digest {
    HashAlgorithm::Blake3.digest(abspath.as_bytes())
}

fn child_key(parent: &str, abspath: &str) -> Vec<u8> {
    let mut key = path_key(parent).as_bytes().to_vec();
    key.extend_from_slice(path_key(abspath).as_bytes());
    key
}

fn is_root(entry: &PathEntry) -> bool {
    entry.abspath == entry.parent
}

impl LmdbPathTable {
    pub fn open<P: AsRef<Path>>(path: P, map_size: usize) -> Result<Self> {
        let path = path.as_ref();
        let env = open_env(path, map_size, 2)?;

        let mut wtxn = env.write_txn()?;
        let paths = env.create_database(&mut wtxn, Some("paths"))?;
        let children = env.create_database(&mut wtxn, Some("children"))?;
        wtxn.commit()?;

        debug!("Opened LMDB path table at {:?}", path);
        Ok(Self {
            env,
            paths,
            children,
        })
    }

    /// Entry stored under the key of `abspath`, checked against the path.
    fn lookup(&self, txn: &RoTxn, abspath: &str) -> Result<Option<PathEntry>> {
        match self.paths.get(txn, path_key(abspath).as_bytes())? {
            Some(entry) if entry.abspath != abspath => Err(IndexError::Corrupted(format!(
                "path key of {abspath} holds {}",
                entry.abspath
            ))),
            found => Ok(found),
        }
    }

    fn put_entry(&self, wtxn: &mut RwTxn, entry: &PathEntry) -> Result<()> {
        self.paths
            .put(wtxn, path_key(&entry.abspath).as_bytes(), entry)?;
        if !is_root(entry) {
            self.children
                .put(wtxn, &child_key(&entry.parent, &entry.abspath), &())?;
        }
        Ok(())
    }

    fn delete_entry(&self, wtxn: &mut RwTxn, entry: &PathEntry) -> Result<()> {
        self.paths.delete(wtxn, path_key(&entry.abspath).as_bytes())?;
        if !is_root(entry) {
            self.children
                .delete(wtxn, &child_key(&entry.parent, &entry.abspath))?;
        }
        Ok(())
    }

    fn children_in(&self, txn: &RoTxn, parent: &str) -> Result<Vec<PathEntry>> {
        let prefix = path_key(parent);
        let prefix = prefix.as_bytes();
        let mut entries = Vec::new();
        for item in self.children.prefix_iter(txn, prefix)? {
            let (key, ()) = item?;
            let entry = self.paths.get(txn, &key[prefix.len()..])?;
            match entry {
                Some(entry) if entry.parent == parent => entries.push(entry),
                _ => {
                    return Err(IndexError::Corrupted(format!(
                        "child index of {parent} names a missing entry"
                    )))
                }
            }
        }
        Ok(entries)
    }
}

impl PathTable for LmdbPathTable {
    #[instrument(skip(self, entry), fields(path = %entry.abspath), level = "debug")]
    fn insert(&self, entry: &PathEntry) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        if self.lookup(&wtxn, &entry.abspath)?.is_some() {
            return Err(IndexError::AlreadyExists {
                path: entry.abspath.clone(),
            });
        }
        self.put_entry(&mut wtxn, entry)?;
        wtxn.commit()?;
        Ok(())
    }

    fn get(&self, abspath: &str) -> Result<Option<PathEntry>> {
        let rtxn = self.env.read_txn()?;
        self.lookup(&rtxn, abspath)
    }

    fn update(&self, entry: &PathEntry) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        let previous = self
            .lookup(&wtxn, &entry.abspath)?
            .ok_or_else(|| IndexError::NotFound {
                path: entry.abspath.clone(),
            })?;
        if previous.parent != entry.parent {
            self.delete_entry(&mut wtxn, &previous)?;
        }
        self.put_entry(&mut wtxn, entry)?;
        wtxn.commit()?;
        Ok(())
    }

    fn remove(&self, abspath: &str) -> Result<Option<PathEntry>> {
        let mut wtxn = self.env.write_txn()?;
        let Some(entry) = self.lookup(&wtxn, abspath)? else {
            return Ok(None);
        };
        self.delete_entry(&mut wtxn, &entry)?;
        wtxn.commit()?;
        Ok(Some(entry))
    }

    fn children(&self, parent: &str) -> Result<Vec<PathEntry>> {
        let rtxn = self.env.read_txn()?;
        let mut entries = self.children_in(&rtxn, parent)?;
        entries.sort_by(|a, b| a.abspath.cmp(&b.abspath));
        Ok(entries)
    }

    fn descendants(&self, abspath: &str) -> Result<Vec<PathEntry>> {
        let rtxn = self.env.read_txn()?;
        let mut entries = Vec::new();
        let mut pending = vec![abspath.to_string()];
        while let Some(dir) = pending.pop() {
            for entry in self.children_in(&rtxn, &dir)? {
                pending.push(entry.abspath.clone());
                entries.push(entry);
            }
        }
        entries.sort_by(|a, b| a.abspath.cmp(&b.abspath));
        Ok(entries)
    }

    #[instrument(skip(self), level = "debug")]
    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        let mut entry = self
            .lookup(&wtxn, from)?
            .ok_or_else(|| IndexError::NotFound {
                path: from.to_string(),
            })?;
        if let Some(existing) = self.lookup(&wtxn, to)? {
            self.delete_entry(&mut wtxn, &existing)?;
        }
        self.delete_entry(&mut wtxn, &entry)?;
        entry.abspath = to.to_string();
        entry.parent = parent_of(to).to_string();
        self.put_entry(&mut wtxn, &entry)?;
        wtxn.commit()?;
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        let rtxn = self.env.read_txn()?;
        Ok(self.paths.len(&rtxn)?)
    }

    fn entries(&self) -> Result<Vec<PathEntry>> {
        let rtxn = self.env.read_txn()?;
        let mut entries = Vec::new();
        for item in self.paths.iter(&rtxn)? {
            let (_, entry) = item?;
            entries.push(entry);
        }
        Ok(entries)
    }

    fn flush(&self) -> Result<()> {
        self.env.force_sync()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Stat;
    use tempfile::TempDir;

    const TEST_MAP_SIZE: usize = 64 * 1024 * 1024;

    #[test]
    fn test_child_index_follows_rename() {
        let temp = TempDir::new().unwrap();
        let table = LmdbPathTable::open(temp.path(), TEST_MAP_SIZE).unwrap();
        table
            .insert(&PathEntry::new("/", None, Stat::directory(0o755)))
            .unwrap();
        table
            .insert(&PathEntry::new("/a", None, Stat::directory(0o755)))
            .unwrap();
        table
            .insert(&PathEntry::new("/a/f", None, Stat::file(0o644)))
            .unwrap();

        table.rename("/a/f", "/g").unwrap();

        let rtxn = table.env.read_txn().unwrap();
        assert!(table.children.get(&rtxn, &child_key("/a", "/a/f")).unwrap().is_none());
        assert!(table.children.get(&rtxn, &child_key("/", "/g")).unwrap().is_some());
        // The root never indexes itself.
        assert!(table.children.get(&rtxn, &child_key("/", "/")).unwrap().is_none());
    }

    #[test]
    fn test_sibling_prefix_not_listed() {
        let temp = TempDir::new().unwrap();
        let table = LmdbPathTable::open(temp.path(), TEST_MAP_SIZE).unwrap();
        for path in ["/a", "/ab"] {
            table
                .insert(&PathEntry::new(path, None, Stat::directory(0o755)))
                .unwrap();
        }
        table
            .insert(&PathEntry::new("/ab/x", None, Stat::file(0o644)))
            .unwrap();

        assert!(table.children("/a").unwrap().is_empty());
        assert!(table.descendants("/a").unwrap().is_empty());
        assert_eq!(table.descendants("/ab").unwrap().len(), 1);
    }

    #[test]
    fn test_keys_have_fixed_length() {
        let long = format!("/{}", "x".repeat(2000));
        assert_eq!(path_key(&long).as_bytes().len(), 32);
        assert_eq!(child_key("/", &long).len(), 64);
    }
}
