//! On-disk lifecycle record
//!
//! Kept next to the lock file and only touched while the lock is held:
//! - `.thaw-owners/`: one file per owner, created and removed whole
//! - `.thaw-state`: JSON document with the extraction record, the current
//!   lock holder and the retirement tombstone
//!
//! Every file is written to a temporary sibling and renamed into place, so a
//! crash leaves either the old or the new version. Losing the JSON document
//! only costs a re-verification of the extraction; owners survive it.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::extract::FileRecord;

/// Version of the state document.
pub const STATE_VERSION: u32 = 2;

/// State document inside a cache directory.
pub const STATE_FILE: &str = ".thaw-state";

/// Directory of per-owner records inside a cache directory.
pub const OWNERS_DIR: &str = ".thaw-owners";

const OWNER_SUFFIX: &str = ".json";
const TEMP_SUFFIX: &str = ".tmp";

/// Which stage registered an owner record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OwnerRole {
    Outer,
    Inner,
}

/// One process holding a reference to the cache directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerRecord {
    pub pid: u32,
    /// Process start time in seconds since the epoch; 0 if unknown
    pub start_time: u64,
    pub role: OwnerRole,
    /// Distinguishes several records registered by the same process
    pub token: u64,
}

/// Process currently holding the file lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolderRecord {
    pub pid: u32,
    pub start_time: u64,
}

/// What has been materialized in the cache directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionRecord {
    pub complete: bool,
    #[serde(default)]
    pub files: BTreeMap<String, FileRecord>,
}

/// Everything known about a cache directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockState {
    pub version: u32,
    pub fingerprint: String,
    /// Number of owner records; kept equal to `owners.len()`
    pub count: u32,
    /// Stored as separate files under [`OWNERS_DIR`], in registration order
    #[serde(skip)]
    pub owners: Vec<OwnerRecord>,
    #[serde(default)]
    pub extraction: ExtractionRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder: Option<HolderRecord>,
    /// Set by the last owner right before the directory is removed
    #[serde(default)]
    pub retired: bool,
}

impl LockState {
    pub fn new(fingerprint: &str) -> Self {
        Self {
            version: STATE_VERSION,
            fingerprint: fingerprint.to_string(),
            count: 0,
            owners: Vec::new(),
            extraction: ExtractionRecord::default(),
            holder: None,
            retired: false,
        }
    }

    /// Read the record of the cache directory `dir`.
    ///
    /// A missing or unreadable state document yields a fresh one whose
    /// extraction is incomplete, so the directory gets re-verified. Owners
    /// are read from their own files either way.
    pub fn load(dir: &Path, fingerprint: &str) -> io::Result<Self> {
        remove_temporaries(dir)?;
        let mut state = match fs::read(dir.join(STATE_FILE)) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Self::new(fingerprint),
            Ok(bytes) => match serde_json::from_slice::<LockState>(&bytes) {
                Ok(mut state) => {
                    if state.fingerprint != fingerprint {
                        tracing::warn!(
                            recorded = %state.fingerprint,
                            expected = fingerprint,
                            "cache directory belongs to another bundle build; re-verifying"
                        );
                        state.fingerprint = fingerprint.to_string();
                        state.extraction = ExtractionRecord::default();
                    }
                    state
                }
                Err(e) => {
                    tracing::warn!(error = %e, "unreadable lifecycle record; re-verifying");
                    Self::new(fingerprint)
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Self::new(fingerprint),
            Err(e) => return Err(e),
        };

        state.owners = load_owners(&dir.join(OWNERS_DIR))?
            .into_iter()
            .map(|(_, owner)| owner)
            .collect();
        state.count = state.owners.len() as u32;
        Ok(state)
    }

    /// Write this record into `dir`: owner files first, then the document.
    pub fn save(&mut self, dir: &Path) -> io::Result<()> {
        self.count = self.owners.len() as u32;

        let owners_dir = dir.join(OWNERS_DIR);
        fs::create_dir_all(&owners_dir)?;
        let on_disk = load_owners(&owners_dir)?;
        for (file_name, owner) in &on_disk {
            if !self.owners.iter().any(|o| o.token == owner.token) {
                remove_if_present(&owners_dir.join(file_name))?;
            }
        }
        let mut next = on_disk
            .iter()
            .filter_map(|(file_name, _)| parse_owner_name(file_name))
            .map(|(seq, _)| seq + 1)
            .max()
            .unwrap_or(0);
        for owner in &self.owners {
            if on_disk.iter().any(|(_, o)| o.token == owner.token) {
                continue;
            }
            let text = serde_json::to_vec(owner).map_err(io::Error::other)?;
            let file_name = format!("{:010}-{:016x}{}", next, owner.token, OWNER_SUFFIX);
            write_atomic(&owners_dir.join(file_name), &text)?;
            next += 1;
        }

        let text = serde_json::to_vec_pretty(self).map_err(io::Error::other)?;
        write_atomic(&dir.join(STATE_FILE), &text)
    }

    /// Remove the record with `token`. Returns whether it was present.
    pub fn remove_owner(&mut self, token: u64) -> bool {
        let before = self.owners.len();
        self.owners.retain(|owner| owner.token != token);
        self.count = self.owners.len() as u32;
        before != self.owners.len()
    }
}

/// Owner files under `owners_dir`, sorted by registration. Files that do
/// not parse are dropped: they were not written by [`LockState::save`].
fn load_owners(owners_dir: &Path) -> io::Result<Vec<(String, OwnerRecord)>> {
    let entries = match fs::read_dir(owners_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut owners = Vec::new();
    for entry in entries {
        let entry = entry?;
        let file_name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();
        if file_name.ends_with(TEMP_SUFFIX) {
            remove_if_present(&path)?;
            continue;
        }
        let record = parse_owner_name(&file_name)
            .and_then(|_| fs::read(&path).ok())
            .and_then(|bytes| serde_json::from_slice::<OwnerRecord>(&bytes).ok());
        match record {
            Some(owner) => owners.push((file_name, owner)),
            None => {
                tracing::warn!(path = %path.display(), "discarding malformed owner record");
                remove_if_present(&path)?;
            }
        }
    }
    owners.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(owners)
}

/// `<seq>-<token>.json` into its sequence number and token.
fn parse_owner_name(file_name: &str) -> Option<(u64, u64)> {
    let stem = file_name.strip_suffix(OWNER_SUFFIX)?;
    let (seq, token) = stem.split_once('-')?;
    Some((seq.parse().ok()?, u64::from_str_radix(token, 16).ok()?))
}

/// Replace `path` with `data` through a synced temporary sibling.
fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let nonce: u32 = rand::random();
    let temp = path.with_file_name(format!(
        "{}.{}-{:08x}{}",
        file_name,
        std::process::id(),
        nonce,
        TEMP_SUFFIX
    ));

    let result = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&temp)
        .and_then(|mut file| {
            file.write_all(data)?;
            file.sync_all()
        })
        .and_then(|()| fs::rename(&temp, path));
    if result.is_err() {
        let _ = fs::remove_file(&temp);
    }
    result
}

/// Drop temporaries of a writer that died before its rename.
fn remove_temporaries(dir: &Path) -> io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let is_temp = entry.file_name().to_str().is_some_and(|name| {
            name.starts_with(STATE_FILE)
                && name.len() > STATE_FILE.len()
                && name.ends_with(TEMP_SUFFIX)
        });
        if is_temp {
            remove_if_present(&entry.path())?;
        }
    }
    Ok(())
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
