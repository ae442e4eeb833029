//! Extraction engine
//!
//! Materializes archive entries under a target directory. Files already
//! present with the expected size and CRC-32 are left alone; everything else
//! is streamed to a temporary sibling and renamed into place. A batch either
//! completes or leaves no file written by it behind.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thaw_archive::{Archive, ArchiveError, EntryKind, TocEntry};

use crate::error::{BootError, Result};

/// Verified identity of one materialized file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub size: u64,
    pub crc32: u32,
}

/// Outcome of [`ensure_extracted`].
#[derive(Debug, Default)]
pub struct Extraction {
    /// Every path that now holds a verified copy of a required entry.
    pub paths: BTreeSet<PathBuf>,
    /// Entries written by this call.
    pub written: usize,
    /// Entries found already valid on disk.
    pub skipped: usize,
    /// Per-entry verified size and checksum, keyed by logical name.
    pub records: BTreeMap<String, FileRecord>,
}

/// Suffix of temporary siblings written before the rename into place.
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Destination of `name` under `root`.
pub fn entry_path(root: &Path, name: &str) -> PathBuf {
    name.split('/').fold(root.to_path_buf(), |path, part| path.join(part))
}

/// Names of every entry that is materialized on disk.
pub fn extractable_names<R: Read + Seek>(archive: &Archive<R>) -> Vec<String> {
    archive
        .entries()
        .iter()
        .filter(|entry| entry.kind.is_extracted())
        .map(|entry| entry.name.clone())
        .collect()
}

/// Make sure every entry in `required` exists under `target_dir`.
///
/// Entries that are not native binaries or data files are rejected. On
/// failure every file written by this call is removed again.
pub fn ensure_extracted<R, S>(
    archive: &Archive<R>,
    required: &[S],
    target_dir: &Path,
) -> Result<Extraction>
where
    R: Read + Seek,
    S: AsRef<str>,
{
    let mut batch = Batch::default();
    match extract_all(archive, required, target_dir, &mut batch) {
        Ok(()) => {
            tracing::debug!(
                dir = %target_dir.display(),
                written = batch.result.written,
                skipped = batch.result.skipped,
                "extraction complete"
            );
            Ok(batch.result)
        }
        Err(err) => {
            batch.rollback();
            Err(err)
        }
    }
}

#[derive(Default)]
struct Batch {
    result: Extraction,
    created: Vec<PathBuf>,
}

impl Batch {
    fn rollback(&mut self) {
        for path in self.created.drain(..).rev() {
            match fs::remove_file(&path) {
                Ok(()) => tracing::debug!(path = %path.display(), "rolled back"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "rollback failed"),
            }
        }
    }
}

fn extract_all<R, S>(
    archive: &Archive<R>,
    required: &[S],
    target_dir: &Path,
    batch: &mut Batch,
) -> Result<()>
where
    R: Read + Seek,
    S: AsRef<str>,
{
    for name in required {
        let name = name.as_ref();
        let dest = entry_path(target_dir, name);
        let failed = |source: io::Error| BootError::ExtractionFailed {
            entry: name.to_string(),
            path: dest.clone(),
            source,
        };

        let entry = archive.entry(name).ok_or_else(|| {
            failed(io::Error::new(io::ErrorKind::NotFound, "entry not present in archive"))
        })?;
        if !entry.kind.is_extracted() {
            return Err(failed(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} entries are not extracted", entry.kind),
            )));
        }
        if batch.result.paths.contains(&dest) {
            continue;
        }

        let record = FileRecord {
            size: entry.raw_len,
            crc32: entry.crc32,
        };
        if matches_on_disk(&dest, record) {
            if entry.kind == EntryKind::NativeBinary {
                make_executable(&dest).map_err(failed)?;
            }
            tracing::trace!(entry = name, "already extracted");
            batch.result.skipped += 1;
        } else {
            write_entry(archive, entry, &dest, batch)?;
            batch.result.written += 1;
        }
        batch.result.paths.insert(dest);
        batch.result.records.insert(name.to_string(), record);
    }
    Ok(())
}

/// Whether `path` is a regular file with the expected size and checksum.
pub fn matches_on_disk(path: &Path, expected: FileRecord) -> bool {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return false;
    };
    if !meta.is_file() || meta.len() != expected.size {
        return false;
    }
    match file_crc32(path) {
        Ok(crc) => crc == expected.crc32,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "cannot verify existing file");
            false
        }
    }
}

fn file_crc32(path: &Path) -> io::Result<u32> {
    let mut file = File::open(path)?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

fn write_entry<R: Read + Seek>(
    archive: &Archive<R>,
    entry: &TocEntry,
    dest: &Path,
    batch: &mut Batch,
) -> Result<()> {
    let failed = |source: io::Error| BootError::ExtractionFailed {
        entry: entry.name.clone(),
        path: dest.to_path_buf(),
        source,
    };

    let parent = dest
        .parent()
        .ok_or_else(|| failed(io::Error::new(io::ErrorKind::InvalidInput, "no parent directory")))?;
    fs::create_dir_all(parent).map_err(failed)?;

    let temp = temp_sibling(dest);
    let result = write_temp(archive, entry, &temp).and_then(|()| {
        if entry.kind == EntryKind::NativeBinary {
            make_executable(&temp).map_err(failed)?;
        }
        replace_file(&temp, dest).map_err(failed)
    });
    if let Err(err) = result {
        let _ = fs::remove_file(&temp);
        return Err(err);
    }

    batch.created.push(dest.to_path_buf());
    tracing::debug!(entry = %entry.name, kind = %entry.kind, path = %dest.display(), "extracted");
    Ok(())
}

fn write_temp<R: Read + Seek>(archive: &Archive<R>, entry: &TocEntry, temp: &Path) -> Result<()> {
    let failed = |source: io::Error| BootError::ExtractionFailed {
        entry: entry.name.clone(),
        path: temp.to_path_buf(),
        source,
    };

    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(temp)
        .map_err(failed)?;
    let mut writer = BufWriter::new(file);
    archive.read_into(entry, &mut writer).map_err(|err| match err {
        ArchiveError::Write { source, .. } => failed(source),
        other => BootError::from(other),
    })?;
    let file = writer.into_inner().map_err(|e| failed(e.into_error()))?;
    file.sync_all().map_err(failed)?;
    Ok(())
}

fn temp_sibling(dest: &Path) -> PathBuf {
    let file_name = dest
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let nonce: u32 = rand::random();
    dest.with_file_name(format!(
        ".{}.{}-{:08x}{}",
        file_name,
        std::process::id(),
        nonce,
        PARTIAL_SUFFIX
    ))
}

/// Whether `file_name` is a temporary sibling left by an interrupted write.
pub fn is_partial(file_name: &str) -> bool {
    file_name.starts_with('.') && file_name.ends_with(PARTIAL_SUFFIX)
}

/// Remove interrupted-write leftovers anywhere under `dir`. Returns how many
/// were removed. Only safe while no extraction into `dir` is running.
pub fn sweep_partials(dir: &Path) -> io::Result<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            removed += sweep_partials(&entry.path())?;
        } else if entry.file_name().to_str().is_some_and(is_partial) {
            fs::remove_file(entry.path())?;
            tracing::debug!(path = %entry.path().display(), "removed partial file");
            removed += 1;
        }
    }
    Ok(removed)
}

fn replace_file(temp: &Path, dest: &Path) -> io::Result<()> {
    match fs::rename(temp, dest) {
        Ok(()) => Ok(()),
        // Windows refuses to rename over an existing file.
        Err(_) if cfg!(windows) && dest.is_file() => {
            fs::remove_file(dest)?;
            fs::rename(temp, dest)
        }
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = fs::metadata(path)?.permissions().mode() & 0o7777;
    if mode != 0o755 {
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use thaw_archive::ArchiveBuilder;

    fn archive() -> Archive<Cursor<Vec<u8>>> {
        let mut builder = ArchiveBuilder::new();
        builder.add_data_file("data/config.txt", b"hello".to_vec()).unwrap();
        builder.add_native_binary("bin/tool", b"#!/bin/sh\nexit 0\n".to_vec()).unwrap();
        builder.add_runtime_option("-X").unwrap();
        Archive::from_reader("mem", Cursor::new(builder.to_bytes().unwrap())).unwrap()
    }

    #[test]
    fn test_entry_path_splits_components() {
        let path = entry_path(Path::new("/cache"), "a/b/c.txt");
        assert_eq!(path, Path::new("/cache").join("a").join("b").join("c.txt"));
    }

    #[test]
    fn test_extract_and_skip() {
        let dir = tempfile::tempdir().unwrap();
        let archive = archive();
        let names = extractable_names(&archive);
        assert_eq!(names, vec!["data/config.txt", "bin/tool"]);

        let first = ensure_extracted(&archive, &names, dir.path()).unwrap();
        assert_eq!(first.written, 2);
        assert_eq!(first.skipped, 0);
        assert_eq!(fs::read(dir.path().join("data/config.txt")).unwrap(), b"hello");
        assert_eq!(first.records["data/config.txt"].size, 5);

        let second = ensure_extracted(&archive, &names, dir.path()).unwrap();
        assert_eq!(second.written, 0);
        assert_eq!(second.skipped, 2);
        assert_eq!(second.paths, first.paths);
    }

    #[test]
    fn test_mismatched_file_is_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let archive = archive();
        fs::create_dir_all(dir.path().join("data")).unwrap();
        fs::write(dir.path().join("data/config.txt"), b"HELLO").unwrap();

        let result = ensure_extracted(&archive, &["data/config.txt"], dir.path()).unwrap();
        assert_eq!(result.written, 1);
        assert_eq!(fs::read(dir.path().join("data/config.txt")).unwrap(), b"hello");
    }

    #[cfg(unix)]
    #[test]
    fn test_native_binary_is_executable() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        ensure_extracted(&archive(), &["bin/tool"], dir.path()).unwrap();
        let mode = fs::metadata(dir.path().join("bin/tool")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn test_non_extractable_entry_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = ensure_extracted(&archive(), &["-X"], dir.path()).unwrap_err();
        assert!(matches!(err, BootError::ExtractionFailed { .. }));
    }

    #[test]
    fn test_sweep_partials_leaves_real_files() {
        let dir = tempfile::tempdir().unwrap();
        let archive = archive();
        ensure_extracted(&archive, &["data/config.txt"], dir.path()).unwrap();
        let stray = dir.path().join("data/.config.txt.999-deadbeef.partial");
        fs::write(&stray, b"hal").unwrap();
        fs::write(dir.path().join(".hidden"), b"kept").unwrap();

        assert_eq!(sweep_partials(dir.path()).unwrap(), 1);
        assert!(!stray.exists());
        assert!(dir.path().join(".hidden").exists());
        assert_eq!(fs::read(dir.path().join("data/config.txt")).unwrap(), b"hello");
        assert!(is_partial(".lib.so.12-0000abcd.partial"));
        assert!(!is_partial("notes.partial"));
    }

    #[test]
    fn test_failure_rolls_back_batch() {
        let dir = tempfile::tempdir().unwrap();
        let archive = archive();
        let err =
            ensure_extracted(&archive, &["data/config.txt", "missing"], dir.path()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ExtractionFailed);
        assert!(!dir.path().join("data/config.txt").exists());

        let leftovers: Vec<_> = fs::read_dir(dir.path().join("data")).unwrap().collect();
        assert!(leftovers.is_empty());
    }
}
