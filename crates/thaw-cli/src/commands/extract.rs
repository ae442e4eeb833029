//! `thaw extract`: Materialize entries the way the bootloader would.

use std::fs;
use std::path::Path;

use anyhow::Context;
use thaw_runtime::extract::{ensure_extracted, extractable_names};

use super::open;

pub fn execute(path: &Path, names: &[String], out_dir: &Path) -> anyhow::Result<()> {
    let archive = open(path)?;
    let names = if names.is_empty() {
        extractable_names(&archive)
    } else {
        names.to_vec()
    };

    fs::create_dir_all(out_dir)
        .with_context(|| format!("cannot create {}", out_dir.display()))?;
    let extraction = ensure_extracted(&archive, &names, out_dir)
        .with_context(|| format!("extraction into {} failed", out_dir.display()))?;

    for path in &extraction.paths {
        println!("{}", path.display());
    }
    println!(
        "{} written, {} already up to date",
        extraction.written, extraction.skipped
    );
    Ok(())
}
