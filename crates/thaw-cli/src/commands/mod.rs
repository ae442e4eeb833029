pub mod extract;
pub mod list;
pub mod modules;
pub mod verify;

use std::path::Path;

use anyhow::Context;
use thaw_archive::Archive;

/// Open `path` as an archive, with the path in the error chain.
pub fn open(path: &Path) -> anyhow::Result<Archive> {
    Archive::open(path).with_context(|| format!("cannot open archive {}", path.display()))
}

/// Human-readable byte count.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
