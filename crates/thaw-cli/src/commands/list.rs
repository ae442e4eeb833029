//! `thaw list`: Show the header and table of contents.

use std::path::Path;

use anyhow::bail;
use thaw_archive::{Compression, EntryKind};

use super::{format_size, open};

const KINDS: [EntryKind; 5] = [
    EntryKind::NativeBinary,
    EntryKind::DataFile,
    EntryKind::ModuleBlob,
    EntryKind::RuntimeOption,
    EntryKind::Metadata,
];

pub fn execute(path: &Path, kind: Option<&str>) -> anyhow::Result<()> {
    let filter = match kind {
        Some(name) => match KINDS.iter().copied().find(|k| k.as_str() == name) {
            Some(kind) => Some(kind),
            None => bail!(
                "unknown entry kind '{}' (expected one of: {})",
                name,
                KINDS.map(EntryKind::as_str).join(", ")
            ),
        },
        None => None,
    };

    let archive = open(path)?;
    let header = archive.header();
    println!("Archive:  {}", path.display());
    println!("Format:   v{} ({})", header.version, header.runtime_variant);
    println!(
        "Offset:   {} (archive {}, {} entries)",
        archive.base_offset(),
        format_size(header.archive_len),
        archive.len()
    );
    println!();
    println!("{:<15} {:>10} {:>10}  {:<8} {:<8}  NAME", "KIND", "STORED", "SIZE", "CRC32", "CODEC");

    for entry in archive.entries() {
        if filter.is_some_and(|kind| kind != entry.kind) {
            continue;
        }
        let codec = match entry.compression {
            Compression::Stored => "stored",
            Compression::Zlib => "zlib",
        };
        println!(
            "{:<15} {:>10} {:>10}  {:08x} {:<8}  {}",
            entry.kind.as_str(),
            entry.stored_len,
            entry.raw_len,
            entry.crc32,
            codec,
            entry.name
        );
    }
    Ok(())
}
