//! Arbitrary and mutated inputs must produce errors, never panics.

use std::io::Cursor;

use proptest::prelude::*;
use thaw_archive::{Archive, ArchiveBuilder, ModuleArchive, ModuleBlobBuilder};

fn valid_archive() -> Vec<u8> {
    let mut modules = ModuleBlobBuilder::new();
    modules.add_package("pkg", b"init".to_vec()).unwrap();
    modules.add_module("pkg.mod", b"body".to_vec()).unwrap();

    let mut builder = ArchiveBuilder::new();
    builder.add_data_file("a/b.txt", b"hello world".to_vec()).unwrap();
    builder.add_native_binary("lib.so", vec![1u8; 500]).unwrap();
    builder.add_module_blob("mods", modules.build().unwrap()).unwrap();
    builder.add_runtime_option("-O").unwrap();
    builder.to_bytes().unwrap()
}

fn exercise(bytes: Vec<u8>) {
    if let Ok(archive) = Archive::from_reader("fuzz", Cursor::new(bytes)) {
        for entry in archive.entries() {
            let _ = archive.read(entry);
        }
        if let Ok(modules) = ModuleArchive::from_archive(&archive) {
            for name in modules.names() {
                let _ = modules.lookup(&name);
            }
        }
    }
}

proptest! {
    #[test]
    fn arbitrary_bytes_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..2048)) {
        exercise(bytes);
    }

    #[test]
    fn mutated_archives_never_panic(
        flips in proptest::collection::vec((any::<prop::sample::Index>(), any::<u8>()), 1..8)
    ) {
        let mut bytes = valid_archive();
        for (index, value) in flips {
            let at = index.index(bytes.len());
            bytes[at] = value;
        }
        exercise(bytes);
    }

    #[test]
    fn truncated_archives_never_panic(cut in 0usize..2048) {
        let bytes = valid_archive();
        let keep = bytes.len().saturating_sub(cut % bytes.len().max(1));
        exercise(bytes[..keep].to_vec());
    }

    #[test]
    fn arbitrary_module_blobs_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
        let mut modules = ModuleArchive::new();
        if modules.register("fuzz", bytes).is_ok() {
            for name in modules.names() {
                let _ = modules.lookup(&name);
            }
        }
    }
}
