//! Environment handed from the outer to the inner stage.

use std::collections::BTreeSet;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{BootError, Result};

/// Cache directory of the running bundle.
pub const CACHE_DIR_VAR: &str = "THAW_CACHE_DIR";
/// Fingerprint of the running bundle.
pub const FINGERPRINT_VAR: &str = "THAW_FINGERPRINT";
/// Path of the archive the inner stage reads.
pub const ARCHIVE_VAR: &str = "THAW_ARCHIVE";
/// Set to `1` to ignore an inherited marker and start an independent launch.
pub const RESET_ENVIRONMENT_VAR: &str = "THAW_RESET_ENVIRONMENT";

/// Variable the platform loader searches for shared libraries.
pub fn search_path_var() -> &'static str {
    if cfg!(windows) {
        "PATH"
    } else if cfg!(target_os = "macos") {
        "DYLD_LIBRARY_PATH"
    } else {
        "LD_LIBRARY_PATH"
    }
}

/// Name under which the previous search path is preserved.
pub fn orig_var(var: &str) -> String {
    format!("{}_ORIG", var)
}

/// Marker inherited from an outer stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    pub cache_dir: PathBuf,
    pub fingerprint: String,
    pub archive: PathBuf,
}

impl Marker {
    /// Read the marker variables. All three must be present and non-empty.
    pub fn from_env<F>(env: F) -> Option<Self>
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let non_empty = |key: &str| env(key).filter(|value| !value.is_empty());
        Some(Self {
            cache_dir: PathBuf::from(non_empty(CACHE_DIR_VAR)?),
            fingerprint: non_empty(FINGERPRINT_VAR)?.into_string().ok()?,
            archive: PathBuf::from(non_empty(ARCHIVE_VAR)?),
        })
    }
}

/// Whether the launching environment asks for an independent launch.
pub fn reset_requested<F>(env: F) -> bool
where
    F: Fn(&str) -> Option<OsString>,
{
    env(RESET_ENVIRONMENT_VAR).is_some_and(|value| value == "1")
}

/// Variables to set and remove on the inner stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildEnv {
    pub set: Vec<(OsString, OsString)>,
    pub remove: Vec<OsString>,
}

impl ChildEnv {
    /// Build the inner stage's environment.
    ///
    /// The search path starts with the cache directory, then every directory
    /// holding an extracted native binary, then the inherited value.
    pub fn build<F>(marker: &Marker, native_dirs: &[PathBuf], env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let var = search_path_var();
        let previous = env(var).filter(|value| !value.is_empty());

        let mut seen = BTreeSet::new();
        let mut dirs: Vec<PathBuf> = Vec::new();
        for dir in std::iter::once(&marker.cache_dir).chain(native_dirs) {
            if seen.insert(dir.clone()) {
                dirs.push(dir.clone());
            }
        }
        if let Some(previous) = &previous {
            dirs.extend(std::env::split_paths(previous));
        }
        let search_path = std::env::join_paths(dirs)
            .map_err(|e| BootError::launch(format!("cannot build {}: {}", var, e)))?;

        let mut set = vec![
            (OsString::from(CACHE_DIR_VAR), marker.cache_dir.clone().into_os_string()),
            (OsString::from(FINGERPRINT_VAR), OsString::from(&marker.fingerprint)),
            (OsString::from(ARCHIVE_VAR), marker.archive.clone().into_os_string()),
            (OsString::from(var), search_path),
        ];
        if let Some(previous) = previous {
            set.push((OsString::from(orig_var(var)), previous));
        }

        Ok(Self {
            set,
            remove: vec![OsString::from(RESET_ENVIRONMENT_VAR)],
        })
    }

    pub fn apply(&self, command: &mut Command) {
        for key in &self.remove {
            command.env_remove(key);
        }
        command.envs(self.set.iter().map(|(k, v)| (k.as_os_str(), v.as_os_str())));
    }

    pub fn get(&self, key: &str) -> Option<&OsStr> {
        self.set
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_os_str())
    }
}

/// Absolute parent directories of native binaries, in first-seen order.
pub fn native_dirs<'a, I>(paths: I) -> Vec<PathBuf>
where
    I: IntoIterator<Item = &'a Path>,
{
    let mut seen = BTreeSet::new();
    let mut dirs = Vec::new();
    for path in paths {
        if let Some(parent) = path.parent() {
            if seen.insert(parent.to_path_buf()) {
                dirs.push(parent.to_path_buf());
            }
        }
    }
    dirs
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<OsString> {
        let map: HashMap<String, OsString> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), OsString::from(v)))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn marker() -> Marker {
        Marker {
            cache_dir: PathBuf::from("/tmp/_thaw-abc"),
            fingerprint: "abc".to_string(),
            archive: PathBuf::from("/opt/app/app"),
        }
    }

    #[test]
    fn test_marker_requires_all_variables() {
        let full = env_of(&[
            (CACHE_DIR_VAR, "/tmp/_thaw-abc"),
            (FINGERPRINT_VAR, "abc"),
            (ARCHIVE_VAR, "/opt/app/app"),
        ]);
        assert_eq!(Marker::from_env(full), Some(marker()));

        let partial = env_of(&[(CACHE_DIR_VAR, "/tmp/_thaw-abc"), (FINGERPRINT_VAR, "abc")]);
        assert_eq!(Marker::from_env(partial), None);

        let empty = env_of(&[(CACHE_DIR_VAR, ""), (FINGERPRINT_VAR, "abc"), (ARCHIVE_VAR, "x")]);
        assert_eq!(Marker::from_env(empty), None);
    }

    #[test]
    fn test_reset_requested() {
        assert!(reset_requested(env_of(&[(RESET_ENVIRONMENT_VAR, "1")])));
        assert!(!reset_requested(env_of(&[(RESET_ENVIRONMENT_VAR, "0")])));
        assert!(!reset_requested(env_of(&[])));
    }

    #[cfg(unix)]
    #[test]
    fn test_search_path_prepends_and_saves_original() {
        let var = search_path_var();
        let native = vec![PathBuf::from("/tmp/_thaw-abc/lib"), PathBuf::from("/tmp/_thaw-abc")];
        let child =
            ChildEnv::build(&marker(), &native, env_of(&[(var, "/usr/local/lib")])).unwrap();

        assert_eq!(
            child.get(var).unwrap(),
            OsStr::new("/tmp/_thaw-abc:/tmp/_thaw-abc/lib:/usr/local/lib")
        );
        assert_eq!(child.get(&orig_var(var)).unwrap(), OsStr::new("/usr/local/lib"));
        assert_eq!(child.get(CACHE_DIR_VAR).unwrap(), OsStr::new("/tmp/_thaw-abc"));
        assert_eq!(child.remove, vec![OsString::from(RESET_ENVIRONMENT_VAR)]);
    }

    #[test]
    fn test_no_orig_without_previous_value() {
        let child = ChildEnv::build(&marker(), &[], env_of(&[])).unwrap();
        assert!(child.get(&orig_var(search_path_var())).is_none());
    }

    #[test]
    fn test_native_dirs_dedup() {
        let paths = [
            PathBuf::from("/c/lib/a.so"),
            PathBuf::from("/c/lib/b.so"),
            PathBuf::from("/c/bin/tool"),
        ];
        let dirs = native_dirs(paths.iter().map(PathBuf::as_path));
        assert_eq!(dirs, vec![PathBuf::from("/c/lib"), PathBuf::from("/c/bin")]);
    }
}
