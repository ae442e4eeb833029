//! `thaw modules`: Browse the module blobs.

use std::path::Path;

use anyhow::bail;
use thaw_archive::ModuleArchive;

use super::{format_size, open};

pub fn execute(path: &Path, name: Option<&str>) -> anyhow::Result<()> {
    let archive = open(path)?;
    let modules = ModuleArchive::from_archive(&archive)?;

    let Some(name) = name else {
        for name in modules.names() {
            let marker = if modules.is_package(&name) == Some(true) { "/" } else { "" };
            println!("{}{}", name, marker);
        }
        return Ok(());
    };

    let Some(module) = modules.lookup(name)? else {
        bail!("no module named '{}'", name);
    };
    println!("Module:   {}", module.name);
    println!("Kind:     {}", if module.is_package { "package" } else { "module" });
    println!("Code:     {}", format_size(module.bytecode.len() as u64));
    if module.is_package {
        let children = modules.submodules(name);
        if !children.is_empty() {
            println!("Contains:");
            for child in children {
                println!("  {}", child);
            }
        }
    }
    Ok(())
}
