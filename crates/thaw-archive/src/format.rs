//! Container binary format
//!
//! An archive is appended to (or stored alongside) a native executable:
//!
//! ```text
//! ┌─────────────────────────┐
//! │  host image (unchanged) │  ← bootloader executable, or nothing
//! ├─────────────────────────┤
//! │  Payloads               │  ← concatenated entry data (stored or zlib)
//! ├─────────────────────────┤
//! │  Table of contents      │  ← sequence of TocEntry records
//! ├─────────────────────────┤
//! │  Header                 │  ← fixed-size, at the very end of the image
//! └─────────────────────────┘
//! ```
//!
//! All integers are little-endian. Offsets inside the header and the table of
//! contents are relative to the archive start, which is
//! `image_len - header.archive_len`. Every record carries its own size so a
//! reader can skip fields appended by later format revisions, and the header
//! version lets it reject revisions it does not understand.

use std::fmt;

/// Magic bytes identifying an archive header.
pub const ARCHIVE_MAGIC: [u8; 8] = *b"THAWARC\0";

/// Format version written by this crate.
pub const FORMAT_VERSION: u32 = 1;

/// Versions this reader accepts.
pub const SUPPORTED_VERSIONS: &[u32] = &[1];

/// Size of the encoded header in bytes.
pub const HEADER_SIZE: usize = 96;

/// Size of the runtime-variant field (zero-padded UTF-8).
pub const VARIANT_LEN: usize = 48;

/// Size of the fixed part of a table-of-contents record.
pub const TOC_ENTRY_FIXED_SIZE: usize = 36;

/// Longest accepted entry name in bytes.
pub const MAX_NAME_LEN: usize = 4096;

/// Type tag of a stored entry. Determines how the runtime handles it.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// Shared library or executable: extracted and made executable.
    NativeBinary = 1,
    /// Plain resource file: extracted as-is.
    DataFile = 2,
    /// Module archive blob: served from memory, never extracted.
    ModuleBlob = 3,
    /// Option for the embedded runtime; the entry name is the option.
    RuntimeOption = 4,
    /// Bundle metadata (manifest).
    Metadata = 5,
}

impl EntryKind {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::NativeBinary),
            2 => Some(Self::DataFile),
            3 => Some(Self::ModuleBlob),
            4 => Some(Self::RuntimeOption),
            5 => Some(Self::Metadata),
            _ => None,
        }
    }

    /// Whether entries of this kind are materialized on disk.
    pub fn is_extracted(self) -> bool {
        matches!(self, Self::NativeBinary | Self::DataFile)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NativeBinary => "native-binary",
            Self::DataFile => "data-file",
            Self::ModuleBlob => "module-blob",
            Self::RuntimeOption => "runtime-option",
            Self::Metadata => "metadata",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload encoding of an entry.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Compression {
    Stored = 0,
    Zlib = 1,
}

impl Compression {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Stored),
            1 => Some(Self::Zlib),
            _ => None,
        }
    }
}

/// The runtime variant of the running host, e.g. `x86_64-linux`.
pub fn host_variant() -> String {
    format!("{}-{}", std::env::consts::ARCH, std::env::consts::OS)
}

/// Fixed-size header stored in the last [`HEADER_SIZE`] bytes of the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveHeader {
    /// Format version (must be in [`SUPPORTED_VERSIONS`]).
    pub version: u32,
    /// Encoded size of this header.
    pub header_size: u32,
    /// Total archive length: payloads + TOC + header.
    pub archive_len: u64,
    /// Offset of the table of contents from the archive start.
    pub toc_offset: u64,
    /// Size of the table of contents in bytes.
    pub toc_size: u64,
    /// CRC-32 of the encoded table of contents.
    pub toc_crc32: u32,
    /// Reserved flags, zero in version 1.
    pub flags: u32,
    /// Runtime variant the bundle targets (`<arch>-<os>`).
    pub runtime_variant: String,
}

impl ArchiveHeader {
    /// Encode the header in its on-disk layout.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..8].copy_from_slice(&ARCHIVE_MAGIC);
        out[8..12].copy_from_slice(&self.version.to_le_bytes());
        out[12..16].copy_from_slice(&self.header_size.to_le_bytes());
        out[16..24].copy_from_slice(&self.archive_len.to_le_bytes());
        out[24..32].copy_from_slice(&self.toc_offset.to_le_bytes());
        out[32..40].copy_from_slice(&self.toc_size.to_le_bytes());
        out[40..44].copy_from_slice(&self.toc_crc32.to_le_bytes());
        out[44..48].copy_from_slice(&self.flags.to_le_bytes());
        let variant = self.runtime_variant.as_bytes();
        let len = variant.len().min(VARIANT_LEN - 1); // keep a terminating zero
        out[48..48 + len].copy_from_slice(&variant[..len]);
        out
    }

    /// Decode and validate a header. `bytes` must be exactly the image tail.
    ///
    /// Returns a human-readable reason on failure.
    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() != HEADER_SIZE {
            return Err(format!(
                "header is {} bytes, expected {}",
                bytes.len(),
                HEADER_SIZE
            ));
        }
        if bytes[0..8] != ARCHIVE_MAGIC {
            return Err("bad magic (no archive found)".to_string());
        }

        let mut cursor = ByteCursor::new(&bytes[8..48]);
        let version = cursor.u32()?;
        if !SUPPORTED_VERSIONS.contains(&version) {
            return Err(format!("unsupported format version {}", version));
        }
        let header_size = cursor.u32()?;
        if header_size as usize != HEADER_SIZE {
            return Err(format!("unexpected header size {}", header_size));
        }
        let archive_len = cursor.u64()?;
        let toc_offset = cursor.u64()?;
        let toc_size = cursor.u64()?;
        let toc_crc32 = cursor.u32()?;
        let flags = cursor.u32()?;

        let variant = &bytes[48..48 + VARIANT_LEN];
        let end = variant.iter().position(|&b| b == 0).unwrap_or(VARIANT_LEN);
        let runtime_variant = std::str::from_utf8(&variant[..end])
            .map_err(|_| "runtime variant is not UTF-8".to_string())?
            .to_string();

        Ok(Self {
            version,
            header_size,
            archive_len,
            toc_offset,
            toc_size,
            toc_crc32,
            flags,
            runtime_variant,
        })
    }

    /// Check the section layout against the archive length.
    pub fn validate_layout(&self) -> Result<(), String> {
        let body_len = self
            .archive_len
            .checked_sub(HEADER_SIZE as u64)
            .ok_or_else(|| format!("archive length {} smaller than header", self.archive_len))?;
        let toc_end = self
            .toc_offset
            .checked_add(self.toc_size)
            .ok_or_else(|| "table of contents bounds overflow".to_string())?;
        if toc_end != body_len {
            return Err(format!(
                "table of contents [{}..{}) does not end at header (offset {})",
                self.toc_offset, toc_end, body_len
            ));
        }
        Ok(())
    }
}

/// One record of the table of contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TocEntry {
    /// Logical name (relative path with `/` separators, unique).
    pub name: String,
    /// Payload offset from the archive start.
    pub offset: u64,
    /// Stored (possibly compressed) payload length.
    pub stored_len: u64,
    /// Uncompressed payload length.
    pub raw_len: u64,
    /// CRC-32 of the uncompressed payload.
    pub crc32: u32,
    pub compression: Compression,
    pub kind: EntryKind,
}

impl TocEntry {
    /// Size of this record once encoded.
    pub fn encoded_len(&self) -> usize {
        TOC_ENTRY_FIXED_SIZE + self.name.len()
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.encoded_len() as u32).to_le_bytes());
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.stored_len.to_le_bytes());
        out.extend_from_slice(&self.raw_len.to_le_bytes());
        out.extend_from_slice(&self.crc32.to_le_bytes());
        out.push(self.compression as u8);
        out.push(self.kind as u8);
        out.extend_from_slice(&(self.name.len() as u16).to_le_bytes());
        out.extend_from_slice(self.name.as_bytes());
    }

    /// Decode one record. Bounds and name rules are checked by the caller,
    /// which knows the archive geometry.
    pub fn decode(cursor: &mut ByteCursor<'_>) -> Result<Self, String> {
        let start = cursor.position();
        let entry_size = cursor.u32()? as usize;
        if entry_size < TOC_ENTRY_FIXED_SIZE {
            return Err(format!("record size {} below minimum", entry_size));
        }
        let offset = cursor.u64()?;
        let stored_len = cursor.u64()?;
        let raw_len = cursor.u64()?;
        let crc32 = cursor.u32()?;
        let compression_tag = cursor.u8()?;
        let kind_tag = cursor.u8()?;
        let name_len = cursor.u16()? as usize;

        let compression = Compression::from_u8(compression_tag)
            .ok_or_else(|| format!("unknown compression tag {}", compression_tag))?;
        let kind =
            EntryKind::from_u8(kind_tag).ok_or_else(|| format!("unknown type tag {}", kind_tag))?;
        if TOC_ENTRY_FIXED_SIZE + name_len > entry_size {
            return Err(format!(
                "name length {} overflows record of {} bytes",
                name_len, entry_size
            ));
        }
        let name = std::str::from_utf8(cursor.bytes(name_len)?)
            .map_err(|_| "entry name is not UTF-8".to_string())?
            .to_string();

        // Skip fields added by later revisions of the record.
        let consumed = cursor.position() - start;
        cursor.bytes(entry_size - consumed)?;

        Ok(Self {
            name,
            offset,
            stored_len,
            raw_len,
            crc32,
            compression,
            kind,
        })
    }
}

/// Check that an entry name is a safe relative path for extraction.
///
/// Accepts `/`-separated components; rejects absolute paths, `.`/`..`
/// components, backslashes, drive prefixes, empty components and NUL bytes.
pub fn validate_entry_path(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("empty name".to_string());
    }
    if name.len() > MAX_NAME_LEN {
        return Err(format!("name longer than {} bytes", MAX_NAME_LEN));
    }
    if name.contains('\0') || name.contains('\\') || name.contains(':') {
        return Err("name contains a reserved character".to_string());
    }
    if name.starts_with('/') {
        return Err("absolute path".to_string());
    }
    for component in name.split('/') {
        match component {
            "" => return Err("empty path component".to_string()),
            "." | ".." => return Err("relative path component escapes the root".to_string()),
            _ => {}
        }
    }
    Ok(())
}

/// Bounds-checked little-endian reader over a byte slice.
///
/// Every accessor fails instead of panicking when the slice is too short.
#[derive(Debug)]
pub struct ByteCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8], String> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                format!(
                    "truncated: need {} bytes at offset {}, have {}",
                    len,
                    self.pos,
                    self.remaining()
                )
            })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8, String> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, String> {
        let mut buf = [0u8; 2];
        buf.copy_from_slice(self.bytes(2)?);
        Ok(u16::from_le_bytes(buf))
    }

    pub fn u32(&mut self) -> Result<u32, String> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.bytes(4)?);
        Ok(u32::from_le_bytes(buf))
    }

    pub fn u64(&mut self) -> Result<u64, String> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.bytes(8)?);
        Ok(u64::from_le_bytes(buf))
    }
}
