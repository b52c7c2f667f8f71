//! Shared behaviour of the LMDB and SQLite metadata tables.

use dedupfs_cas::{Digest, HashAlgorithm};
use dedupfs_index::{
    FileIndex, IndexError, LmdbFileIndex, LmdbPathTable, PathEntry, PathTable, SqliteFileIndex,
    SqlitePathTable, Stat,
};
use tempfile::TempDir;

const TEST_MAP_SIZE: usize = 64 * 1024 * 1024;

fn file_indexes(temp: &TempDir) -> Vec<(&'static str, Box<dyn FileIndex>)> {
    vec![
        (
            "lmdb",
            Box::new(LmdbFileIndex::open(temp.path().join("files.lmdb"), TEST_MAP_SIZE).unwrap()),
        ),
        (
            "sqlite",
            Box::new(SqliteFileIndex::open(temp.path().join("filestorage.db")).unwrap()),
        ),
    ]
}

fn path_tables(temp: &TempDir) -> Vec<(&'static str, Box<dyn PathTable>)> {
    vec![
        (
            "lmdb",
            Box::new(LmdbPathTable::open(temp.path().join("paths.lmdb"), TEST_MAP_SIZE).unwrap()),
        ),
        (
            "sqlite",
            Box::new(SqlitePathTable::open(temp.path().join("metastorage.db")).unwrap()),
        ),
    ]
}

fn sequence(n: u8) -> Vec<Digest> {
    (0..n).map(|i| HashAlgorithm::Sha1.digest(&[i; 8])).collect()
}

fn with_tree(table: &dyn PathTable) {
    table
        .insert(&PathEntry::new("/", None, Stat::directory(0o755)))
        .unwrap();
    for dir in ["/docs", "/docs/old", "/src"] {
        table
            .insert(&PathEntry::new(dir, None, Stat::directory(0o755)))
            .unwrap();
    }
    for file in ["/docs/a.txt", "/docs/b.txt", "/docs/old/c.txt", "/src/main.rs"] {
        table
            .insert(&PathEntry::new(file, None, Stat::file(0o644)))
            .unwrap();
    }
}

#[test]
fn file_index_shares_identical_content() {
    let temp = TempDir::new().unwrap();
    for (name, index) in file_indexes(&temp) {
        let digest = HashAlgorithm::Sha1.digest(b"file body");
        assert_eq!(index.put(&digest, &sequence(3)).unwrap(), 1, "{name}");
        // A second put keeps the first sequence.
        assert_eq!(index.put(&digest, &sequence(1)).unwrap(), 2, "{name}");

        let record = index.record(&digest).unwrap().unwrap();
        assert_eq!(record.refcount, 2, "{name}");
        assert_eq!(record.sequence, sequence(3), "{name}");

        let stats = index.report().unwrap();
        assert_eq!((stats.file_count, stats.total_references), (1, 2), "{name}");
    }
}

#[test]
fn file_index_delete_counts_down() {
    let temp = TempDir::new().unwrap();
    for (name, index) in file_indexes(&temp) {
        let digest = HashAlgorithm::Sha1.digest(b"counted file");
        index.put(&digest, &sequence(2)).unwrap();
        index.put(&digest, &sequence(2)).unwrap();

        assert_eq!(index.delete(&digest).unwrap(), Some(1), "{name}");
        assert_eq!(index.delete(&digest).unwrap(), Some(0), "{name}");
        assert_eq!(index.get(&digest).unwrap(), None, "{name}");
        assert_eq!(index.delete(&digest).unwrap(), None, "{name}");
        assert!(index.records().unwrap().is_empty(), "{name}");
        index.flush().unwrap();
    }
}

#[test]
fn path_table_insert_get_update() {
    let temp = TempDir::new().unwrap();
    for (name, table) in path_tables(&temp) {
        with_tree(table.as_ref());

        let entry = table.get("/docs/a.txt").unwrap().unwrap();
        assert_eq!(entry.parent, "/docs", "{name}");
        assert!(entry.stat.is_file(), "{name}");

        let duplicate = table.insert(&PathEntry::new("/docs", None, Stat::directory(0o700)));
        assert!(matches!(duplicate, Err(IndexError::AlreadyExists { .. })), "{name}");

        let mut updated = entry.clone();
        updated.digest = Some(HashAlgorithm::Sha1.digest(b"new"));
        updated.stat.size = 3;
        table.update(&updated).unwrap();
        assert_eq!(table.get("/docs/a.txt").unwrap().unwrap(), updated, "{name}");

        let missing = table.update(&PathEntry::new("/nope", None, Stat::file(0o644)));
        assert!(matches!(missing, Err(IndexError::NotFound { .. })), "{name}");
    }
}

#[test]
fn path_table_children_and_descendants() {
    let temp = TempDir::new().unwrap();
    for (name, table) in path_tables(&temp) {
        with_tree(table.as_ref());

        let root: Vec<_> = table
            .children("/")
            .unwrap()
            .into_iter()
            .map(|e| e.abspath)
            .collect();
        assert_eq!(root, vec!["/docs", "/src"], "{name}");

        let docs: Vec<_> = table
            .children("/docs")
            .unwrap()
            .into_iter()
            .map(|e| e.name().to_string())
            .collect();
        assert_eq!(docs, vec!["a.txt", "b.txt", "old"], "{name}");

        let below: Vec<_> = table
            .descendants("/docs")
            .unwrap()
            .into_iter()
            .map(|e| e.abspath)
            .collect();
        assert_eq!(
            below,
            vec!["/docs/a.txt", "/docs/b.txt", "/docs/old", "/docs/old/c.txt"],
            "{name}"
        );
        assert_eq!(table.descendants("/").unwrap().len(), 7, "{name}");
        assert_eq!(table.len().unwrap(), 8, "{name}");
    }
}

#[test]
fn path_table_rename_replaces_destination() {
    let temp = TempDir::new().unwrap();
    for (name, table) in path_tables(&temp) {
        with_tree(table.as_ref());

        table.rename("/docs/a.txt", "/src/main.rs").unwrap();

        assert!(table.get("/docs/a.txt").unwrap().is_none(), "{name}");
        let moved = table.get("/src/main.rs").unwrap().unwrap();
        assert_eq!(moved.parent, "/src", "{name}");
        assert_eq!(table.children("/src").unwrap().len(), 1, "{name}");
        assert_eq!(table.len().unwrap(), 7, "{name}");

        let missing = table.rename("/ghost", "/x");
        assert!(matches!(missing, Err(IndexError::NotFound { .. })), "{name}");
    }
}

#[test]
fn path_table_remove() {
    let temp = TempDir::new().unwrap();
    for (name, table) in path_tables(&temp) {
        with_tree(table.as_ref());

        let removed = table.remove("/docs/b.txt").unwrap().unwrap();
        assert_eq!(removed.abspath, "/docs/b.txt", "{name}");
        assert!(table.remove("/docs/b.txt").unwrap().is_none(), "{name}");
        assert_eq!(table.children("/docs").unwrap().len(), 2, "{name}");
        assert_eq!(table.entries().unwrap().len(), 7, "{name}");
        table.flush().unwrap();
    }
}

#[test]
fn path_table_accepts_long_paths() {
    let temp = TempDir::new().unwrap();
    for (name, table) in path_tables(&temp) {
        table
            .insert(&PathEntry::new("/", None, Stat::directory(0o755)))
            .unwrap();
        let dir = format!("/{}", "a".repeat(700));
        let file = format!("{dir}/{}", "b".repeat(300));
        table
            .insert(&PathEntry::new(dir.as_str(), None, Stat::directory(0o755)))
            .unwrap();
        table
            .insert(&PathEntry::new(file.as_str(), None, Stat::file(0o644)))
            .unwrap();

        assert_eq!(table.get(&file).unwrap().unwrap().parent, dir, "{name}");
        assert_eq!(table.children(&dir).unwrap().len(), 1, "{name}");
        assert_eq!(table.descendants("/").unwrap().len(), 2, "{name}");

        let renamed = format!("{dir}/{}", "c".repeat(400));
        table.rename(&file, &renamed).unwrap();
        assert!(table.get(&file).unwrap().is_none(), "{name}");
        assert_eq!(
            table.children(&dir).unwrap()[0].abspath,
            renamed,
            "{name}"
        );
        assert!(matches!(
            table.insert(&PathEntry::new(dir.as_str(), None, Stat::directory(0o755))),
            Err(IndexError::AlreadyExists { .. })
        ));
    }
}
