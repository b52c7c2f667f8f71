//! Copying trees between the host filesystem and a storage root.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use anyhow::{bail, Context, Result};
use dedupfs_engine::MetaStorage;
use dedupfs_index::{basename, join};
use walkdir::WalkDir;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransferSummary {
    pub files: u64,
    pub directories: u64,
    pub bytes: u64,
    pub skipped: u64,
}

/// Where a host file lands: inside `dest` if it is a directory, else at `dest`.
fn file_target(storage: &MetaStorage, host: &Path, dest: &str) -> Result<String> {
    if storage.exists(dest)? && storage.getattr(dest)?.is_dir() {
        let name = host
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .with_context(|| format!("{} has no file name", host.display()))?;
        return Ok(join(dest, &name));
    }
    Ok(dest.to_string())
}

/// Import a host file or directory tree under `dest`.
pub fn import(storage: &MetaStorage, source: &Path, dest: &str) -> Result<TransferSummary> {
    let meta = fs::metadata(source).with_context(|| format!("Cannot read {}", source.display()))?;
    let mut summary = TransferSummary::default();

    if meta.is_file() {
        let target = file_target(storage, source, dest)?;
        summary.bytes += import_file(storage, source, &target)?;
        summary.files += 1;
        return Ok(summary);
    }

    ensure_dir(storage, dest, meta.mode())?;
    for entry in WalkDir::new(source).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        let relative = entry.path().strip_prefix(source)?;
        let target = relative
            .components()
            .fold(dest.to_string(), |acc, c| join(&acc, &c.as_os_str().to_string_lossy()));

        let file_type = entry.file_type();
        if file_type.is_dir() {
            ensure_dir(storage, &target, entry.metadata()?.mode())?;
            summary.directories += 1;
        } else if file_type.is_file() {
            summary.bytes += import_file(storage, entry.path(), &target)?;
            summary.files += 1;
        } else {
            tracing::warn!("Skipping non-regular file {}", entry.path().display());
            summary.skipped += 1;
        }
    }
    Ok(summary)
}

fn ensure_dir(storage: &MetaStorage, path: &str, mode: u32) -> Result<()> {
    if storage.exists(path)? {
        if !storage.getattr(path)?.is_dir() {
            bail!("{path} exists and is not a directory");
        }
        return Ok(());
    }
    storage.mkdir(path, mode & 0o7777)?;
    Ok(())
}

/// Stream one host file into the storage root, replacing any previous
/// content at `target`.
fn import_file(storage: &MetaStorage, host: &Path, target: &str) -> Result<u64> {
    let meta = fs::metadata(host)?;
    if !storage.exists(target)? {
        storage.create(target, meta.mode() & 0o7777)?;
    }

    let mut file = File::open(host).with_context(|| format!("Cannot open {}", host.display()))?;
    let mut buf = vec![0u8; storage.blocksize()];
    // Open the session even for empty files so old content is released.
    storage.write(target, &[])?;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        storage.write(target, &buf[..n])?;
    }
    let released = storage.release(target)?;
    storage.utime(target, meta.atime(), meta.mtime())?;
    Ok(released.size)
}

/// Export a file or directory tree from the storage root to `dest` on the host.
pub fn export(storage: &MetaStorage, source: &str, dest: &Path) -> Result<TransferSummary> {
    let mut summary = TransferSummary::default();
    let stat = storage.getattr(source)?;
    if stat.is_dir() {
        export_dir(storage, source, dest, &mut summary)?;
    } else {
        let dest = if dest.is_dir() {
            dest.join(basename(source))
        } else {
            dest.to_path_buf()
        };
        summary.bytes += export_file(storage, source, &dest, stat.perm())?;
        summary.files += 1;
    }
    Ok(summary)
}

fn export_dir(
    storage: &MetaStorage,
    source: &str,
    dest: &Path,
    summary: &mut TransferSummary,
) -> Result<()> {
    fs::create_dir_all(dest)?;
    summary.directories += 1;
    for name in storage.readdir(source)? {
        let child = join(source, &name);
        let stat = storage.getattr(&child)?;
        if stat.is_dir() {
            export_dir(storage, &child, &dest.join(&name), summary)?;
        } else {
            summary.bytes += export_file(storage, &child, &dest.join(&name), stat.perm())?;
            summary.files += 1;
        }
    }
    Ok(())
}

fn export_file(storage: &MetaStorage, source: &str, dest: &Path, perm: u32) -> Result<u64> {
    let mut out = File::create(dest).with_context(|| format!("Cannot create {}", dest.display()))?;
    let chunk = storage.blocksize();
    let mut offset = 0u64;
    loop {
        let data = storage.read(source, chunk, offset)?;
        out.write_all(&data)?;
        offset += data.len() as u64;
        if data.len() < chunk {
            break;
        }
    }
    out.sync_all()?;
    fs::set_permissions(dest, fs::Permissions::from_mode(perm))?;
    Ok(offset)
}

/// Write one stored file to `out`.
pub fn cat(storage: &MetaStorage, source: &str, out: &mut impl Write) -> Result<u64> {
    let chunk = storage.blocksize();
    let mut offset = 0u64;
    loop {
        let data = storage.read(source, chunk, offset)?;
        out.write_all(&data)?;
        offset += data.len() as u64;
        if data.len() < chunk {
            return Ok(offset);
        }
    }
}
