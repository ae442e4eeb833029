//! Archive reader
//!
//! Opens an archive from the tail of a host image and gives random access to
//! its entries:
//! 1. Read the fixed-size header from the end of the image
//! 2. Validate magic, version and section layout against the image length
//! 3. Verify the table-of-contents checksum and decode every record
//! 4. Serve payloads on demand, decompressing and verifying each one

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use flate2::read::ZlibDecoder;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::error::{ArchiveError, Result};
use crate::format::{
    host_variant, validate_entry_path, ArchiveHeader, ByteCursor, Compression, EntryKind,
    TocEntry, HEADER_SIZE, MAX_NAME_LEN,
};

const COPY_CHUNK: usize = 64 * 1024;

/// An opened, structurally validated archive.
///
/// Reads go through an internal lock so an `Archive` can be shared by
/// reference. Once a read detects a structural problem the archive is
/// poisoned and every later read fails with [`ArchiveError::Invalid`].
pub struct Archive<R = File> {
    path: PathBuf,
    source: Mutex<R>,
    image_len: u64,
    base: u64,
    header: ArchiveHeader,
    entries: Vec<TocEntry>,
    by_name: HashMap<String, usize>,
    toc_digest: [u8; 32],
    poisoned: AtomicBool,
}

impl Archive<File> {
    /// Open the archive stored at the end of `image_path`.
    pub fn open(image_path: impl AsRef<Path>) -> Result<Self> {
        let path = image_path.as_ref();
        let file = File::open(path).map_err(|source| ArchiveError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_reader(path, file)
    }

    /// Cheap check whether `image_path` ends with an archive header magic.
    ///
    /// Used to decide between an embedded archive and a sibling file; full
    /// validation still happens in [`Archive::open`].
    pub fn probe(image_path: impl AsRef<Path>) -> io::Result<bool> {
        let mut file = File::open(image_path)?;
        let len = file.seek(SeekFrom::End(0))?;
        if len < HEADER_SIZE as u64 {
            return Ok(false);
        }
        file.seek(SeekFrom::Start(len - HEADER_SIZE as u64))?;
        let mut magic = [0u8; 8];
        file.read_exact(&mut magic)?;
        Ok(magic == crate::format::ARCHIVE_MAGIC)
    }
}

impl<R: Read + Seek> Archive<R> {
    /// Open an archive from any seekable image. `path` is used in errors.
    pub fn from_reader(path: impl Into<PathBuf>, mut source: R) -> Result<Self> {
        let path = path.into();
        let io_err = |source: io::Error| ArchiveError::Io {
            path: path.clone(),
            source,
        };

        let image_len = source.seek(SeekFrom::End(0)).map_err(io_err)?;
        if image_len < HEADER_SIZE as u64 {
            return Err(ArchiveError::invalid(
                &path,
                format!("image is {} bytes, too small to hold an archive", image_len),
            ));
        }

        let mut header_bytes = [0u8; HEADER_SIZE];
        source
            .seek(SeekFrom::Start(image_len - HEADER_SIZE as u64))
            .map_err(io_err)?;
        source.read_exact(&mut header_bytes).map_err(io_err)?;
        let header = ArchiveHeader::decode(&header_bytes)
            .map_err(|reason| ArchiveError::invalid(&path, reason))?;
        header
            .validate_layout()
            .map_err(|reason| ArchiveError::invalid(&path, reason))?;
        if header.archive_len > image_len {
            return Err(ArchiveError::invalid(
                &path,
                format!(
                    "declared archive length {} exceeds image length {} (truncated?)",
                    header.archive_len, image_len
                ),
            ));
        }
        let base = image_len - header.archive_len;

        // toc_size <= archive_len <= image_len, so the allocation is bounded
        // by the image actually present.
        let mut toc = vec![0u8; header.toc_size as usize];
        source
            .seek(SeekFrom::Start(base + header.toc_offset))
            .map_err(io_err)?;
        source.read_exact(&mut toc).map_err(io_err)?;
        let crc = crc32fast::hash(&toc);
        if crc != header.toc_crc32 {
            return Err(ArchiveError::invalid(
                &path,
                format!(
                    "table of contents checksum mismatch: expected {:08x}, got {:08x}",
                    header.toc_crc32, crc
                ),
            ));
        }

        let entries = decode_toc(&path, &toc, header.toc_offset)?;
        let mut by_name = HashMap::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            if by_name.insert(entry.name.clone(), index).is_some() {
                return Err(ArchiveError::invalid(
                    &path,
                    format!("duplicate entry name '{}'", entry.name),
                ));
            }
        }

        let toc_digest: [u8; 32] = Sha256::digest(&toc).into();

        tracing::debug!(
            archive = %path.display(),
            entries = entries.len(),
            variant = %header.runtime_variant,
            "opened archive"
        );

        Ok(Self {
            path,
            source: Mutex::new(source),
            image_len,
            base,
            header,
            entries,
            by_name,
            toc_digest,
            poisoned: AtomicBool::new(false),
        })
    }

    /// Path (or label) the archive was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &ArchiveHeader {
        &self.header
    }

    /// Offset of the archive within its host image.
    pub fn base_offset(&self) -> u64 {
        self.base
    }

    /// SHA-256 of the encoded table of contents. Covers every entry's name,
    /// type, lengths and payload checksum.
    pub fn toc_digest(&self) -> &[u8; 32] {
        &self.toc_digest
    }

    pub fn entries(&self) -> &[TocEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up an entry by logical name.
    pub fn entry(&self, name: &str) -> Option<&TocEntry> {
        self.by_name.get(name).map(|&index| &self.entries[index])
    }

    /// Look up an entry by table-of-contents index.
    pub fn entry_at(&self, index: usize) -> Option<&TocEntry> {
        self.entries.get(index)
    }

    /// Entries of one kind, in table-of-contents order.
    pub fn entries_of(&self, kind: EntryKind) -> impl Iterator<Item = &TocEntry> {
        self.entries.iter().filter(move |entry| entry.kind == kind)
    }

    /// Reject bundles built for a different runtime variant.
    pub fn check_compatible(&self) -> Result<()> {
        let host = host_variant();
        if self.header.runtime_variant != host {
            return Err(ArchiveError::invalid(
                &self.path,
                format!(
                    "bundle targets '{}' but this host is '{}'",
                    self.header.runtime_variant, host
                ),
            ));
        }
        Ok(())
    }

    /// Read an entry's full uncompressed payload.
    pub fn read(&self, entry: &TocEntry) -> Result<Vec<u8>> {
        let capacity = entry.raw_len.min(self.image_len) as usize;
        let mut data = Vec::with_capacity(capacity);
        self.read_into(entry, &mut data)?;
        Ok(data)
    }

    /// Read an entry by name. An absent name is [`ArchiveError::NotFound`].
    pub fn read_by_name(&self, name: &str) -> Result<Vec<u8>> {
        let entry = self.entry(name).ok_or_else(|| ArchiveError::NotFound {
            name: name.to_string(),
        })?;
        self.read(entry)
    }

    /// Stream an entry's uncompressed payload into `sink`.
    ///
    /// The payload is written as it is decoded; length and checksum are
    /// verified at the end, so on error the sink may hold partial data and
    /// must be discarded by the caller. Errors from the sink itself are
    /// reported as [`ArchiveError::Write`].
    pub fn read_into<W: Write>(&self, entry: &TocEntry, sink: &mut W) -> Result<u64> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(ArchiveError::invalid(
                &self.path,
                "archive failed structural validation earlier; refusing further reads",
            ));
        }

        let start = self.base + entry.offset;
        let end = start.checked_add(entry.stored_len);
        let limit = self.base + self.header.toc_offset;
        if entry.offset > self.header.toc_offset
            || end.map_or(true, |end| end > limit || end > self.image_len)
        {
            return Err(self.poison(format!(
                "entry '{}' payload [{}..+{}) lies outside the image",
                entry.name, start, entry.stored_len
            )));
        }

        let mut source = self.source.lock();
        source
            .seek(SeekFrom::Start(start))
            .map_err(|e| self.poison(format!("seek to entry '{}' failed: {}", entry.name, e)))?;
        let mut limited = (&mut *source).take(entry.stored_len);

        let (written, crc) = match entry.compression {
            Compression::Stored => {
                let result = pump(entry, &mut limited, sink)?;
                if limited.limit() != 0 {
                    return Err(self.poison(format!(
                        "entry '{}' is truncated: {} of {} bytes missing",
                        entry.name,
                        limited.limit(),
                        entry.stored_len
                    )));
                }
                result
            }
            Compression::Zlib => pump(entry, ZlibDecoder::new(&mut limited), sink)?,
        };

        if written != entry.raw_len {
            return Err(ArchiveError::corrupt(
                &entry.name,
                format!("decoded {} bytes, expected {}", written, entry.raw_len),
            ));
        }
        if crc != entry.crc32 {
            return Err(ArchiveError::corrupt(
                &entry.name,
                format!("checksum mismatch: expected {:08x}, got {:08x}", entry.crc32, crc),
            ));
        }
        Ok(written)
    }

    fn poison(&self, reason: String) -> ArchiveError {
        self.poisoned.store(true, Ordering::Release);
        tracing::warn!(archive = %self.path.display(), %reason, "archive poisoned");
        ArchiveError::invalid(&self.path, reason)
    }
}

impl<R> std::fmt::Debug for Archive<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Archive")
            .field("path", &self.path)
            .field("image_len", &self.image_len)
            .field("base", &self.base)
            .field("header", &self.header)
            .field("entries", &self.entries.len())
            .finish()
    }
}

/// Copy a decoded payload into `sink`, never accepting more than the
/// declared length. Returns the byte count and CRC-32 of what was copied.
fn pump<Rd: Read, W: Write>(entry: &TocEntry, mut reader: Rd, sink: &mut W) -> Result<(u64, u32)> {
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut total = 0u64;

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(ArchiveError::corrupt(
                    &entry.name,
                    format!("payload could not be decoded: {}", e),
                ))
            }
        };
        total += n as u64;
        if total > entry.raw_len {
            return Err(ArchiveError::corrupt(
                &entry.name,
                format!("payload exceeds declared length {}", entry.raw_len),
            ));
        }
        hasher.update(&buf[..n]);
        sink.write_all(&buf[..n]).map_err(|source| ArchiveError::Write {
            entry: entry.name.clone(),
            source,
        })?;
    }

    Ok((total, hasher.finalize()))
}

/// Decode and validate every table-of-contents record.
fn decode_toc(path: &Path, toc: &[u8], payload_limit: u64) -> Result<Vec<TocEntry>> {
    let mut cursor = ByteCursor::new(toc);
    let mut entries = Vec::new();

    while !cursor.is_empty() {
        let index = entries.len();
        let entry = TocEntry::decode(&mut cursor).map_err(|reason| {
            ArchiveError::invalid(path, format!("TOC record {}: {}", index, reason))
        })?;

        let invalid = |reason: String| {
            ArchiveError::invalid(path, format!("entry '{}': {}", entry.name, reason))
        };

        let end = entry
            .offset
            .checked_add(entry.stored_len)
            .ok_or_else(|| invalid("payload bounds overflow".to_string()))?;
        if end > payload_limit {
            return Err(invalid(format!(
                "payload [{}..{}) overlaps the table of contents at {}",
                entry.offset, end, payload_limit
            )));
        }
        if entry.compression == Compression::Stored && entry.stored_len != entry.raw_len {
            return Err(invalid(format!(
                "stored entry declares {} stored and {} raw bytes",
                entry.stored_len, entry.raw_len
            )));
        }
        if entry.kind.is_extracted() {
            validate_entry_path(&entry.name).map_err(invalid)?;
        } else if entry.name.is_empty()
            || entry.name.contains('\0')
            || entry.name.len() > MAX_NAME_LEN
        {
            return Err(invalid("malformed name".to_string()));
        }

        entries.push(entry);
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::ArchiveBuilder;
    use std::io::Cursor;

    fn sample_archive() -> Vec<u8> {
        let mut builder = ArchiveBuilder::new();
        builder.add_data_file("data/config.txt", b"hello".to_vec()).unwrap();
        builder
            .add_native_binary("bin/helper", vec![0x7F, b'E', b'L', b'F', 1, 2, 3])
            .unwrap();
        builder.add_runtime_option("-v").unwrap();
        builder.to_bytes().unwrap()
    }

    #[test]
    fn test_open_and_lookup() {
        let archive = Archive::from_reader("mem", Cursor::new(sample_archive())).unwrap();
        assert_eq!(archive.len(), 3);
        assert_eq!(archive.base_offset(), 0);

        let config = archive.entry("data/config.txt").unwrap();
        assert_eq!(config.kind, EntryKind::DataFile);
        assert_eq!(archive.entry_at(0), Some(config));
        assert!(archive.entry("missing").is_none());
        assert_eq!(archive.entries_of(EntryKind::RuntimeOption).count(), 1);
    }

    #[test]
    fn test_read_payloads() {
        let archive = Archive::from_reader("mem", Cursor::new(sample_archive())).unwrap();
        assert_eq!(archive.read_by_name("data/config.txt").unwrap(), b"hello");
        let helper = archive.entry("bin/helper").unwrap();
        let data = archive.read(helper).unwrap();
        assert_eq!(data.len() as u64, helper.raw_len);
        assert_eq!(crc32fast::hash(&data), helper.crc32);

        let err = archive.read_by_name("missing").unwrap_err();
        assert!(matches!(err, ArchiveError::NotFound { ref name } if name == "missing"));
    }

    #[test]
    fn test_archive_after_host_image() {
        let mut image = b"#!native-image-bytes".to_vec();
        let prefix = image.len() as u64;
        image.extend(sample_archive());

        let archive = Archive::from_reader("mem", Cursor::new(image)).unwrap();
        assert_eq!(archive.base_offset(), prefix);
        assert_eq!(archive.read_by_name("data/config.txt").unwrap(), b"hello");
    }

    #[test]
    fn test_image_too_small() {
        let err = Archive::from_reader("mem", Cursor::new(vec![0u8; 10])).unwrap_err();
        assert!(matches!(err, ArchiveError::Invalid { .. }));
    }

    #[test]
    fn test_toc_digest_tracks_content() {
        let a = Archive::from_reader("a", Cursor::new(sample_archive())).unwrap();

        let mut builder = ArchiveBuilder::new();
        builder.add_data_file("data/config.txt", b"HELLO".to_vec()).unwrap();
        let b = Archive::from_reader("b", Cursor::new(builder.to_bytes().unwrap())).unwrap();

        assert_ne!(a.toc_digest(), b.toc_digest());
        let again = Archive::from_reader("a", Cursor::new(sample_archive())).unwrap();
        assert_eq!(a.toc_digest(), again.toc_digest());
    }

    #[test]
    fn test_check_compatible() {
        let archive = Archive::from_reader("mem", Cursor::new(sample_archive())).unwrap();
        assert!(archive.check_compatible().is_ok());

        let mut builder = ArchiveBuilder::new().with_variant("sparc-plan9");
        builder.add_data_file("x", b"1".to_vec()).unwrap();
        let foreign =
            Archive::from_reader("mem", Cursor::new(builder.to_bytes().unwrap())).unwrap();
        let err = foreign.check_compatible().unwrap_err();
        assert!(err.to_string().contains("sparc-plan9"));
    }

    #[test]
    fn test_sink_error_is_write_error() {
        struct Refuse;
        impl Write for Refuse {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::Other, "disk full"))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let archive = Archive::from_reader("mem", Cursor::new(sample_archive())).unwrap();
        let entry = archive.entry("data/config.txt").unwrap();
        let err = archive.read_into(entry, &mut Refuse).unwrap_err();
        assert!(matches!(err, ArchiveError::Write { ref entry, .. } if entry == "data/config.txt"));
    }
}
