//! The `thaw` inspection tool against archives built in the test.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use thaw_archive::{ArchiveBuilder, ModuleBlobBuilder};

const THAW: &str = env!("CARGO_BIN_EXE_thaw");

fn write_archive(dir: &Path) -> PathBuf {
    let mut blob = ModuleBlobBuilder::new();
    blob.add_package("app", b"pkg".to_vec()).unwrap();
    blob.add_module("app.main", b"main code".to_vec()).unwrap();
    blob.add_module("app.util", b"util code".to_vec()).unwrap();

    let mut builder = ArchiveBuilder::new();
    builder.add_native_binary("lib/libdemo.so", vec![0x7F; 512]).unwrap();
    builder.add_data_file("data/config.txt", b"greeting=hello\n".to_vec()).unwrap();
    builder.add_module_blob("modules.bin", blob.build().unwrap()).unwrap();
    builder.add_runtime_option("env:LANG=C").unwrap();
    builder.add_metadata("thaw.toml", b"[bundle]\nname = \"demo\"\n".to_vec()).unwrap();

    let path = dir.join("demo.thaw");
    fs::write(&path, builder.to_bytes().unwrap()).unwrap();
    path
}

fn thaw(args: &[&str]) -> Output {
    Command::new(THAW).args(args).output().unwrap()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn test_list_shows_every_entry() {
    let dir = tempfile::tempdir().unwrap();
    let archive = write_archive(dir.path());

    let output = thaw(&["list", archive.to_str().unwrap()]);
    assert!(output.status.success());
    let text = stdout(&output);
    for name in ["lib/libdemo.so", "data/config.txt", "modules.bin", "env:LANG=C", "thaw.toml"] {
        assert!(text.contains(name), "missing {} in:\n{}", name, text);
    }

    let output = thaw(&["list", "--kind", "data-file", archive.to_str().unwrap()]);
    let text = stdout(&output);
    assert!(text.contains("data/config.txt"));
    assert!(!text.contains("lib/libdemo.so"));

    let output = thaw(&["list", "--kind", "nonsense", archive.to_str().unwrap()]);
    assert!(!output.status.success());
}

#[test]
fn test_verify_detects_corruption() {
    let dir = tempfile::tempdir().unwrap();
    let archive = write_archive(dir.path());

    let output = thaw(&["verify", archive.to_str().unwrap()]);
    assert!(output.status.success(), "{}", stdout(&output));
    assert!(stdout(&output).contains("3 modules in 1 blobs"));

    // The native binary is the first payload; its compressed stream starts at 0.
    let mut bytes = fs::read(&archive).unwrap();
    bytes[4] ^= 0xFF;
    fs::write(&archive, &bytes).unwrap();

    let output = thaw(&["verify", archive.to_str().unwrap()]);
    assert!(!output.status.success());
    assert!(stdout(&output).contains("FAILED  lib/libdemo.so"));
    assert!(stdout(&output).contains("ok      data/config.txt"));
}

#[test]
fn test_extract_writes_requested_entries() {
    let dir = tempfile::tempdir().unwrap();
    let archive = write_archive(dir.path());
    let out = dir.path().join("out");

    let output = thaw(&[
        "extract",
        archive.to_str().unwrap(),
        "data/config.txt",
        "--out-dir",
        out.to_str().unwrap(),
    ]);
    assert!(output.status.success());
    assert_eq!(fs::read(out.join("data/config.txt")).unwrap(), b"greeting=hello\n");
    assert!(!out.join("lib/libdemo.so").exists());

    let output = thaw(&["extract", archive.to_str().unwrap(), "-o", out.to_str().unwrap()]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("1 written, 1 already up to date"));
    assert!(out.join("lib/libdemo.so").is_file());
}

#[test]
fn test_modules_lists_and_describes() {
    let dir = tempfile::tempdir().unwrap();
    let archive = write_archive(dir.path());

    let output = thaw(&["modules", archive.to_str().unwrap()]);
    assert!(output.status.success());
    assert_eq!(stdout(&output), "app/\napp.main\napp.util\n");

    let output = thaw(&["modules", archive.to_str().unwrap(), "app"]);
    let text = stdout(&output);
    assert!(text.contains("package"));
    assert!(text.contains("  app.main"));

    let output = thaw(&["modules", archive.to_str().unwrap(), "app.missing"]);
    assert!(!output.status.success());
}

#[test]
fn test_not_an_archive_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let plain = dir.path().join("plain.bin");
    fs::write(&plain, vec![0u8; 200]).unwrap();

    let output = thaw(&["list", plain.to_str().unwrap()]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("cannot open archive"));
}
