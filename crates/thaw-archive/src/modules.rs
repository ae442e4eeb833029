//! Module archives
//!
//! A module blob is a compact, self-contained index of compiled modules
//! stored as a single [`EntryKind::ModuleBlob`] entry. Blobs are never
//! extracted: the runtime imports modules straight from memory.
//!
//! Blob layout (little-endian):
//!
//! ```text
//! magic "THAWMOD\0" | version u32 | count u32
//! count × { name_len u16 | flags u8 | stored_len u32 | raw_len u32 | crc32 u32
//!           | name | zlib payload }
//! ```
//!
//! Several blobs may be registered. They form layers: when two layers define
//! the same module name, the layer registered last wins.

use std::collections::{BTreeSet, HashMap};
use std::io::{Read, Seek, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use crate::error::{ArchiveError, Result};
use crate::format::{ByteCursor, EntryKind};
use crate::reader::Archive;

/// Magic bytes at the start of a module blob.
pub const MODULE_MAGIC: [u8; 8] = *b"THAWMOD\0";

/// Blob format version written by this crate.
pub const MODULE_FORMAT_VERSION: u32 = 1;

const FLAG_PACKAGE: u8 = 0x01;

/// A module loaded from an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    pub name: String,
    pub bytecode: Vec<u8>,
    /// Packages can contain submodules (`pkg.sub`).
    pub is_package: bool,
}

#[derive(Debug, Clone)]
struct ModuleRecord {
    payload: std::ops::Range<usize>,
    raw_len: u32,
    crc32: u32,
    is_package: bool,
}

#[derive(Debug)]
struct Layer {
    name: String,
    data: Vec<u8>,
    records: HashMap<String, ModuleRecord>,
}

/// Read-only view over one or more module blobs.
#[derive(Debug, Default)]
pub struct ModuleArchive {
    layers: Vec<Layer>,
}

impl ModuleArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every module blob of `archive`, in table-of-contents order.
    pub fn from_archive<R: Read + Seek>(archive: &Archive<R>) -> Result<Self> {
        let mut modules = Self::new();
        for entry in archive.entries_of(EntryKind::ModuleBlob) {
            let blob = archive.read(entry)?;
            modules.register(&entry.name, blob)?;
        }
        Ok(modules)
    }

    /// Parse and register a blob as the newest layer.
    ///
    /// The index is validated up front; module payloads are only
    /// decompressed and checksummed when looked up.
    pub fn register(&mut self, layer_name: &str, blob: Vec<u8>) -> Result<()> {
        let records = parse_index(layer_name, &blob)?;
        tracing::debug!(layer = layer_name, modules = records.len(), "registered module blob");
        self.layers.push(Layer {
            name: layer_name.to_string(),
            data: blob,
            records,
        });
        Ok(())
    }

    fn find(&self, name: &str) -> Option<(&Layer, &ModuleRecord)> {
        self.layers
            .iter()
            .rev()
            .find_map(|layer| layer.records.get(name).map(|record| (layer, record)))
    }

    /// Fetch a module by dotted name.
    ///
    /// Returns `Ok(None)` if no layer defines it and
    /// [`ArchiveError::Corrupt`] if the module's payload fails verification.
    pub fn lookup(&self, name: &str) -> Result<Option<Module>> {
        let Some((layer, record)) = self.find(name) else {
            return Ok(None);
        };

        let stored = &layer.data[record.payload.clone()];
        let mut bytecode = Vec::with_capacity(record.raw_len as usize);
        ZlibDecoder::new(stored)
            .take(record.raw_len as u64 + 1)
            .read_to_end(&mut bytecode)
            .map_err(|e| ArchiveError::corrupt(name, format!("in {}: {}", layer.name, e)))?;
        if bytecode.len() != record.raw_len as usize {
            return Err(ArchiveError::corrupt(
                name,
                format!(
                    "in {}: decoded {} bytes, expected {}",
                    layer.name,
                    bytecode.len(),
                    record.raw_len
                ),
            ));
        }
        let crc = crc32fast::hash(&bytecode);
        if crc != record.crc32 {
            return Err(ArchiveError::corrupt(
                name,
                format!("in {}: checksum mismatch", layer.name),
            ));
        }

        Ok(Some(Module {
            name: name.to_string(),
            bytecode,
            is_package: record.is_package,
        }))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    /// `Some(true)` for packages, `Some(false)` for plain modules.
    pub fn is_package(&self, name: &str) -> Option<bool> {
        self.find(name).map(|(_, record)| record.is_package)
    }

    /// Direct children of `package`, sorted and deduplicated across layers.
    pub fn submodules(&self, package: &str) -> Vec<String> {
        let prefix = format!("{}.", package);
        let children: BTreeSet<&str> = self
            .layers
            .iter()
            .flat_map(|layer| layer.records.keys())
            .filter_map(|name| name.strip_prefix(&prefix))
            .filter(|rest| !rest.is_empty() && !rest.contains('.'))
            .collect();
        children
            .into_iter()
            .map(|child| format!("{}{}", prefix, child))
            .collect()
    }

    /// All module names visible through the layers, sorted.
    pub fn names(&self) -> Vec<String> {
        let names: BTreeSet<&String> = self
            .layers
            .iter()
            .flat_map(|layer| layer.records.keys())
            .collect();
        names.into_iter().cloned().collect()
    }

    /// Number of distinct visible modules.
    pub fn len(&self) -> usize {
        self.names().len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.iter().all(|layer| layer.records.is_empty())
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }
}

fn parse_index(layer: &str, blob: &[u8]) -> Result<HashMap<String, ModuleRecord>> {
    let invalid = |reason: String| ArchiveError::corrupt(layer, format!("module blob: {}", reason));

    let mut cursor = ByteCursor::new(blob);
    let magic = cursor.bytes(MODULE_MAGIC.len()).map_err(invalid)?;
    if magic != &MODULE_MAGIC[..] {
        return Err(invalid("bad magic".to_string()));
    }
    let version = cursor.u32().map_err(invalid)?;
    if version != MODULE_FORMAT_VERSION {
        return Err(invalid(format!("unsupported version {}", version)));
    }
    let count = cursor.u32().map_err(invalid)?;

    let mut records = HashMap::new();
    for index in 0..count {
        let name_len = cursor.u16().map_err(invalid)? as usize;
        let flags = cursor.u8().map_err(invalid)?;
        let stored_len = cursor.u32().map_err(invalid)? as usize;
        let raw_len = cursor.u32().map_err(invalid)?;
        let crc32 = cursor.u32().map_err(invalid)?;
        let name = std::str::from_utf8(cursor.bytes(name_len).map_err(invalid)?)
            .map_err(|_| invalid(format!("module {} name is not UTF-8", index)))?;
        if name.is_empty() {
            return Err(invalid(format!("module {} has an empty name", index)));
        }
        let start = cursor.position();
        cursor.bytes(stored_len).map_err(invalid)?;

        let record = ModuleRecord {
            payload: start..start + stored_len,
            raw_len,
            crc32,
            is_package: flags & FLAG_PACKAGE != 0,
        };
        if records.insert(name.to_string(), record).is_some() {
            return Err(invalid(format!("duplicate module '{}'", name)));
        }
    }
    if !cursor.is_empty() {
        return Err(invalid(format!("{} trailing bytes", cursor.remaining())));
    }
    Ok(records)
}

/// Builds a module blob.
#[derive(Debug, Default)]
pub struct ModuleBlobBuilder {
    modules: Vec<(String, bool, Vec<u8>)>,
}

impl ModuleBlobBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_module(&mut self, name: impl Into<String>, bytecode: Vec<u8>) -> Result<&mut Self> {
        self.push(name.into(), false, bytecode)
    }

    pub fn add_package(&mut self, name: impl Into<String>, bytecode: Vec<u8>) -> Result<&mut Self> {
        self.push(name.into(), true, bytecode)
    }

    fn push(&mut self, name: String, is_package: bool, bytecode: Vec<u8>) -> Result<&mut Self> {
        if name.is_empty() || name.len() > u16::MAX as usize {
            return Err(ArchiveError::build(&name, "invalid module name"));
        }
        if u32::try_from(bytecode.len()).is_err() {
            return Err(ArchiveError::build(&name, "module too large"));
        }
        if self.modules.iter().any(|(existing, _, _)| *existing == name) {
            return Err(ArchiveError::build(&name, "duplicate module"));
        }
        self.modules.push((name, is_package, bytecode));
        Ok(self)
    }

    /// Encode the blob.
    pub fn build(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.extend_from_slice(&MODULE_MAGIC);
        out.extend_from_slice(&MODULE_FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&(self.modules.len() as u32).to_le_bytes());

        for (name, is_package, bytecode) in &self.modules {
            let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            let stored = encoder
                .write_all(bytecode)
                .and_then(|_| encoder.finish())
                .map_err(|e| ArchiveError::build(name, format!("compression failed: {}", e)))?;
            let stored_len = u32::try_from(stored.len())
                .map_err(|_| ArchiveError::build(name, "compressed module too large"))?;

            out.extend_from_slice(&(name.len() as u16).to_le_bytes());
            out.push(if *is_package { FLAG_PACKAGE } else { 0 });
            out.extend_from_slice(&stored_len.to_le_bytes());
            out.extend_from_slice(&(bytecode.len() as u32).to_le_bytes());
            out.extend_from_slice(&crc32fast::hash(bytecode).to_le_bytes());
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(&stored);
        }
        Ok(out)
    }
}
