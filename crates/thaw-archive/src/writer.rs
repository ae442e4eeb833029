//! Archive builder
//!
//! Collects entries in memory and serializes them in the container layout
//! understood by [`crate::Archive`]. Used by bundling tools and tests.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

use flate2::write::ZlibEncoder;

use crate::error::{ArchiveError, Result};
use crate::format::{
    host_variant, validate_entry_path, ArchiveHeader, Compression, EntryKind, TocEntry,
    FORMAT_VERSION, HEADER_SIZE, MAX_NAME_LEN,
};

struct PendingEntry {
    name: String,
    kind: EntryKind,
    compression: Compression,
    stored: Vec<u8>,
    raw_len: u64,
    crc32: u32,
}

/// Builds an archive from named entries.
pub struct ArchiveBuilder {
    variant: String,
    entries: Vec<PendingEntry>,
    names: HashSet<String>,
}

impl Default for ArchiveBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveBuilder {
    /// New builder targeting the running host's variant.
    pub fn new() -> Self {
        Self {
            variant: host_variant(),
            entries: Vec::new(),
            names: HashSet::new(),
        }
    }

    /// Target a different runtime variant.
    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = variant.into();
        self
    }

    /// Add an entry. Names must be unique; extracted kinds must also be safe
    /// relative paths.
    pub fn add(
        &mut self,
        name: impl Into<String>,
        kind: EntryKind,
        data: Vec<u8>,
        compress: bool,
    ) -> Result<&mut Self> {
        let name = name.into();
        if kind.is_extracted() {
            validate_entry_path(&name).map_err(|reason| ArchiveError::build(&name, reason))?;
        } else if name.is_empty() || name.contains('\0') || name.len() > MAX_NAME_LEN {
            return Err(ArchiveError::build(&name, "malformed name"));
        }
        if name.len() > u16::MAX as usize {
            return Err(ArchiveError::build(&name, "name too long"));
        }
        if !self.names.insert(name.clone()) {
            return Err(ArchiveError::build(&name, "duplicate entry name"));
        }

        let raw_len = data.len() as u64;
        let crc32 = crc32fast::hash(&data);
        let (compression, stored) = if compress {
            let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(&data)
                .and_then(|_| encoder.finish())
                .map(|stored| (Compression::Zlib, stored))
                .map_err(|e| ArchiveError::build(&name, format!("compression failed: {}", e)))?
        } else {
            (Compression::Stored, data)
        };

        self.entries.push(PendingEntry {
            name,
            kind,
            compression,
            stored,
            raw_len,
            crc32,
        });
        Ok(self)
    }

    /// Add a shared library or executable (compressed).
    pub fn add_native_binary(
        &mut self,
        name: impl Into<String>,
        data: Vec<u8>,
    ) -> Result<&mut Self> {
        self.add(name, EntryKind::NativeBinary, data, true)
    }

    /// Add a plain resource file (compressed).
    pub fn add_data_file(&mut self, name: impl Into<String>, data: Vec<u8>) -> Result<&mut Self> {
        self.add(name, EntryKind::DataFile, data, true)
    }

    /// Add a module archive blob (stored; blobs compress per module).
    pub fn add_module_blob(&mut self, name: impl Into<String>, blob: Vec<u8>) -> Result<&mut Self> {
        self.add(name, EntryKind::ModuleBlob, blob, false)
    }

    /// Add a runtime option. The option text is the entry name.
    pub fn add_runtime_option(&mut self, option: impl Into<String>) -> Result<&mut Self> {
        self.add(option, EntryKind::RuntimeOption, Vec::new(), false)
    }

    /// Add a metadata entry such as the bundle manifest.
    pub fn add_metadata(&mut self, name: impl Into<String>, data: Vec<u8>) -> Result<&mut Self> {
        self.add(name, EntryKind::Metadata, data, false)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize the archive into `out`. Returns the archive length.
    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<u64> {
        let mut offset = 0u64;
        let mut toc = Vec::new();
        for pending in &self.entries {
            out.write_all(&pending.stored)?;
            let entry = TocEntry {
                name: pending.name.clone(),
                offset,
                stored_len: pending.stored.len() as u64,
                raw_len: pending.raw_len,
                crc32: pending.crc32,
                compression: pending.compression,
                kind: pending.kind,
            };
            entry.encode_into(&mut toc);
            offset += pending.stored.len() as u64;
        }
        out.write_all(&toc)?;

        let header = ArchiveHeader {
            version: FORMAT_VERSION,
            header_size: HEADER_SIZE as u32,
            archive_len: offset + toc.len() as u64 + HEADER_SIZE as u64,
            toc_offset: offset,
            toc_size: toc.len() as u64,
            toc_crc32: crc32fast::hash(&toc),
            flags: 0,
            runtime_variant: self.variant.clone(),
        };
        out.write_all(&header.encode())?;
        Ok(header.archive_len)
    }

    /// Serialize the archive into a standalone buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.write_to(&mut out)
            .map_err(|e| ArchiveError::build("<archive>", e.to_string()))?;
        Ok(out)
    }

    /// Write `image` followed by the archive to `output`. The result is a
    /// self-contained executable when `image` is the bootloader.
    pub fn append_to_image(&self, image: &Path, output: &Path) -> Result<u64> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: io::Error| ArchiveError::Io { path, source }
        };

        let host = fs::read(image).map_err(io_err(image))?;
        let mut file = File::create(output).map_err(io_err(output))?;
        file.write_all(&host).map_err(io_err(output))?;
        let written = self.write_to(&mut file).map_err(io_err(output))?;
        file.sync_all().map_err(io_err(output))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(image).map_err(io_err(image))?.permissions().mode();
            fs::set_permissions(output, fs::Permissions::from_mode(mode))
                .map_err(io_err(output))?;
        }

        tracing::debug!(
            output = %output.display(),
            entries = self.entries.len(),
            archive_len = written,
            "appended archive to image"
        );
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_duplicate_names() {
        let mut builder = ArchiveBuilder::new();
        builder.add_data_file("a.txt", b"1".to_vec()).unwrap();
        let err = builder.add_data_file("a.txt", b"2".to_vec()).err().unwrap();
        assert!(err.to_string().contains("duplicate"));
        assert_eq!(builder.len(), 1);
    }

    #[test]
    fn test_rejects_unsafe_paths() {
        let mut builder = ArchiveBuilder::new();
        assert!(builder.add_data_file("../x", Vec::new()).is_err());
        assert!(builder.add_native_binary("/usr/lib/libc.so", Vec::new()).is_err());
        // Runtime options are not paths.
        assert!(builder.add_runtime_option("-X utf8").is_ok());
        assert!(builder.add_runtime_option("").is_err());
    }

    #[test]
    fn test_layout_lengths() {
        let mut builder = ArchiveBuilder::new();
        builder.add("raw", EntryKind::DataFile, vec![7u8; 100], false).unwrap();
        let bytes = builder.to_bytes().unwrap();

        let header = ArchiveHeader::decode(&bytes[bytes.len() - HEADER_SIZE..]).unwrap();
        assert_eq!(header.archive_len, bytes.len() as u64);
        assert_eq!(header.toc_offset, 100);
        assert!(header.validate_layout().is_ok());
    }

    #[test]
    fn test_compression_shrinks_repetitive_data() {
        let mut builder = ArchiveBuilder::new();
        builder.add_data_file("zeros", vec![0u8; 64 * 1024]).unwrap();
        let bytes = builder.to_bytes().unwrap();
        assert!(bytes.len() < 8 * 1024);
    }

    #[test]
    fn test_append_to_image() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("boot");
        let output = dir.path().join("app");
        fs::write(&image, b"BOOTLOADER").unwrap();

        let mut builder = ArchiveBuilder::new();
        builder.add_data_file("f", b"payload".to_vec()).unwrap();
        let archive_len = builder.append_to_image(&image, &output).unwrap();

        let written = fs::read(&output).unwrap();
        assert!(written.starts_with(b"BOOTLOADER"));
        assert_eq!(written.len() as u64, 10 + archive_len);
    }
}
