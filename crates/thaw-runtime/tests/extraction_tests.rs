use std::fs;
use std::io::Cursor;

use thaw_archive::{Archive, ArchiveBuilder, EntryKind};
use thaw_runtime::extract::{ensure_extracted, extractable_names};
use thaw_runtime::ErrorKind;

fn sample() -> Vec<u8> {
    let mut builder = ArchiveBuilder::new();
    builder.add_data_file("data/config.txt", b"greeting=hello\n".to_vec()).unwrap();
    builder.add_data_file("data/nested/deep/file.bin", vec![5u8; 4096]).unwrap();
    builder.add_native_binary("lib/libdemo.so", vec![0x7F; 2048]).unwrap();
    builder.add_metadata("thaw.toml", b"[bundle]\nname = \"demo\"\n".to_vec()).unwrap();
    builder.to_bytes().unwrap()
}

#[test]
fn test_second_extraction_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let archive = Archive::from_reader("mem", Cursor::new(sample())).unwrap();
    let names = extractable_names(&archive);
    assert_eq!(names.len(), 3);

    let first = ensure_extracted(&archive, &names, dir.path()).unwrap();
    assert_eq!((first.written, first.skipped), (3, 0));

    let mtime = fs::metadata(dir.path().join("lib/libdemo.so"))
        .unwrap()
        .modified()
        .unwrap();
    let second = ensure_extracted(&archive, &names, dir.path()).unwrap();
    assert_eq!((second.written, second.skipped), (0, 3));
    assert_eq!(second.records, first.records);
    assert_eq!(
        fs::metadata(dir.path().join("lib/libdemo.so"))
            .unwrap()
            .modified()
            .unwrap(),
        mtime
    );
}

#[test]
fn test_metadata_entries_are_never_extracted() {
    let dir = tempfile::tempdir().unwrap();
    let archive = Archive::from_reader("mem", Cursor::new(sample())).unwrap();
    let err = ensure_extracted(&archive, &["thaw.toml"], dir.path()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExtractionFailed);
    assert!(!dir.path().join("thaw.toml").exists());
}

#[test]
fn test_corrupt_entry_rolls_back_whole_batch() {
    let mut builder = ArchiveBuilder::new();
    builder.add("good.txt", EntryKind::DataFile, b"good".to_vec(), false).unwrap();
    builder.add("bad.txt", EntryKind::DataFile, b"bad!".to_vec(), false).unwrap();
    let mut bytes = builder.to_bytes().unwrap();
    bytes[5] ^= 0xFF; // second payload starts at offset 4

    let dir = tempfile::tempdir().unwrap();
    let archive = Archive::from_reader("mem", Cursor::new(bytes)).unwrap();
    let err = ensure_extracted(&archive, &["good.txt", "bad.txt"], dir.path()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ArchiveCorrupt);
    assert_eq!(err.exit_code(), 242);

    let leftovers: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
    assert!(leftovers.is_empty(), "{:?}", leftovers);
}

#[test]
fn test_truncated_file_on_disk_is_repaired() {
    let dir = tempfile::tempdir().unwrap();
    let archive = Archive::from_reader("mem", Cursor::new(sample())).unwrap();
    let names = extractable_names(&archive);
    ensure_extracted(&archive, &names, dir.path()).unwrap();

    let target = dir.path().join("data/nested/deep/file.bin");
    fs::write(&target, vec![5u8; 100]).unwrap();

    let again = ensure_extracted(&archive, &names, dir.path()).unwrap();
    assert_eq!(again.written, 1);
    assert_eq!(fs::read(&target).unwrap().len(), 4096);
}
