//! Bundle manifest (thaw.toml) and layered boot configuration
//!
//! Settings are resolved in three layers, later ones winning:
//! built-in defaults, the manifest stored in the archive, and environment
//! overrides of the launching process.

use std::ffi::OsString;
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thaw_archive::{Archive, EntryKind};

use crate::error::{BootError, Result};

/// Name of the metadata entry holding the manifest.
pub const MANIFEST_ENTRY: &str = "thaw.toml";

/// Overrides the lifecycle lock wait, in milliseconds.
pub const LOCK_TIMEOUT_VAR: &str = "THAW_LOCK_TIMEOUT_MS";

/// Overrides the directory under which cache directories are created.
pub const RUNTIME_TMPDIR_VAR: &str = "THAW_RUNTIME_TMPDIR";

/// Default bounded wait for the lifecycle lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// How the outer stage hands control to the inner stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LaunchMode {
    /// Re-execute the image as a supervised child
    #[default]
    Spawn,
    /// Run the inner stage in this process (persistent installs only)
    InProcess,
    /// Replace this process image (persistent installs, Unix only)
    Replace,
}

/// Bundle manifest
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    #[serde(default)]
    pub bundle: BundleInfo,

    #[serde(default)]
    pub runtime: RuntimeSettings,
}

/// `[bundle]` table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BundleInfo {
    #[serde(default = "default_bundle_name")]
    pub name: String,

    #[serde(default)]
    pub version: String,

    /// Extracted file the native entry runtime executes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,
}

fn default_bundle_name() -> String {
    "app".to_string()
}

impl Default for BundleInfo {
    fn default() -> Self {
        Self {
            name: default_bundle_name(),
            version: String::new(),
            entry: None,
        }
    }
}

/// `[runtime]` table
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RuntimeSettings {
    /// Fixed extraction directory; relative paths resolve against the
    /// executable's directory. Enables persistent mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistent_dir: Option<PathBuf>,

    /// Parent of per-fingerprint cache directories
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_tmpdir: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_timeout_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub launch: Option<LaunchMode>,
}

impl Manifest {
    /// Parse a manifest from TOML text
    pub fn from_str(content: &str) -> Result<Self> {
        let manifest: Manifest =
            toml::from_str(content).map_err(|e| BootError::Manifest(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Load the manifest entry of `archive`, or defaults if it has none.
    pub fn from_archive<R: Read + Seek>(archive: &Archive<R>) -> Result<Self> {
        match archive.entry(MANIFEST_ENTRY) {
            Some(entry) if entry.kind == EntryKind::Metadata => {
                let bytes = archive.read(entry)?;
                let text = std::str::from_utf8(&bytes)
                    .map_err(|_| BootError::Manifest(format!("{} is not UTF-8", MANIFEST_ENTRY)))?;
                Self::from_str(text)
            }
            Some(entry) => Err(BootError::Manifest(format!(
                "{} is stored as {}, expected metadata",
                MANIFEST_ENTRY, entry.kind
            ))),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.bundle.name.is_empty() {
            return Err(BootError::Manifest("bundle name cannot be empty".to_string()));
        }
        if let Some(entry) = &self.bundle.entry {
            thaw_archive::format::validate_entry_path(entry)
                .map_err(|reason| BootError::Manifest(format!("entry '{}': {}", entry, reason)))?;
        }
        Ok(())
    }
}

/// Effective settings for one launch.
#[derive(Debug, Clone, PartialEq)]
pub struct BootConfig {
    /// Parent directory of `_thaw-<fingerprint>` cache directories
    pub cache_root: PathBuf,
    /// Fixed extraction directory, if the bundle is a persistent install
    pub persistent_dir: Option<PathBuf>,
    pub lock_timeout: Duration,
    pub launch: LaunchMode,
}

impl BootConfig {
    /// Resolve settings from the manifest and environment.
    ///
    /// `exe_dir` anchors relative manifest paths. A `sibling` archive marks
    /// a one-directory install, which defaults to persistent mode.
    pub fn resolve<F>(
        manifest: &Manifest,
        exe_dir: &Path,
        exe_stem: &str,
        sibling: bool,
        env: F,
    ) -> Self
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let runtime = &manifest.runtime;

        let persistent_dir = match &runtime.persistent_dir {
            Some(dir) => Some(exe_dir.join(dir)),
            None if sibling => Some(exe_dir.join(format!("{}.d", exe_stem))),
            None => None,
        };

        let cache_root = env(RUNTIME_TMPDIR_VAR)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .or_else(|| runtime.runtime_tmpdir.clone())
            .unwrap_or_else(std::env::temp_dir);

        let lock_timeout = env(LOCK_TIMEOUT_VAR)
            .and_then(|value| {
                let parsed = value.to_str().and_then(|s| s.trim().parse::<u64>().ok());
                if parsed.is_none() {
                    tracing::warn!(value = ?value, "ignoring malformed {}", LOCK_TIMEOUT_VAR);
                }
                parsed
            })
            .or(runtime.lock_timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_LOCK_TIMEOUT);

        Self {
            cache_root,
            persistent_dir,
            lock_timeout,
            launch: runtime.launch.unwrap_or_default(),
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent_dir.is_some()
    }
}

/// Identity of a bundle build: name, version and table of contents.
///
/// Two builds that differ in any stored byte have different table-of-contents
/// checksums and so never share a fingerprint.
pub fn fingerprint<R: Read + Seek>(manifest: &Manifest, archive: &Archive<R>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(manifest.bundle.name.as_bytes());
    hasher.update([0u8]);
    hasher.update(manifest.bundle.version.as_bytes());
    hasher.update([0u8]);
    hasher.update(archive.toc_digest());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}
