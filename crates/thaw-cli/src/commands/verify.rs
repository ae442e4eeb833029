//! `thaw verify`: Read every payload and check it.

use std::io;
use std::path::Path;

use anyhow::bail;
use thaw_archive::{EntryKind, ModuleArchive};

use super::open;

pub fn execute(path: &Path) -> anyhow::Result<()> {
    let archive = open(path)?;
    if let Err(e) = archive.check_compatible() {
        println!("warning: {}", e);
    }

    let mut failures = 0usize;
    for entry in archive.entries() {
        match archive.read_into(entry, &mut io::sink()) {
            Ok(_) => println!("ok      {}", entry.name),
            Err(e) => {
                failures += 1;
                println!("FAILED  {}: {}", entry.name, e);
            }
        }
    }

    // Module blobs are parsed as a whole; each module carries its own checksum.
    if failures == 0 && archive.entries_of(EntryKind::ModuleBlob).next().is_some() {
        let modules = ModuleArchive::from_archive(&archive)?;
        for name in modules.names() {
            if let Err(e) = modules.lookup(&name) {
                failures += 1;
                println!("FAILED  module {}: {}", name, e);
            }
        }
        println!("ok      {} modules in {} blobs", modules.len(), modules.layer_count());
    }

    if failures > 0 {
        bail!("{} of {} entries failed verification", failures, archive.len());
    }
    println!();
    println!("{} entries verified", archive.len());
    Ok(())
}
