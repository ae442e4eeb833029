//! Launch controller
//!
//! One binary plays two roles, told apart by the marker variables it
//! inherits:
//! - **Outer**: locates the archive, extracts what the application needs,
//!   prepares the environment and starts the inner stage
//! - **Inner**: attaches to the prepared cache directory, loads modules and
//!   runtime options, and runs the application
//!
//! The bootstrap's exit code is the inner stage's exit code.

pub mod env;
pub mod signals;

use std::ffi::OsString;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Command;

use thaw_archive::{Archive, EntryKind, ModuleArchive};

use crate::config::{fingerprint, BootConfig, LaunchMode, Manifest};
use crate::error::{BootError, Result};
use crate::extract::{ensure_extracted, extractable_names};
use crate::lifecycle::{cache_dir_for, Lifecycle, OwnerRole, Ownership};
use crate::runtime::{EmbeddedRuntime, RuntimeOptions};
use env::{ChildEnv, Marker};

/// Suffix of an archive stored next to the executable.
pub const SIBLING_SUFFIX: &str = ".thaw";

/// Role of this process in the launch sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Outer,
    Inner(Marker),
}

impl Role {
    /// Decide the role from the inherited marker.
    ///
    /// A marker for a different bundle build, or an explicit reset request,
    /// makes this an independent outer launch.
    pub fn detect<F>(fingerprint: &str, vars: F) -> Self
    where
        F: Fn(&str) -> Option<OsString>,
    {
        if env::reset_requested(&vars) {
            tracing::debug!("environment reset requested");
            return Role::Outer;
        }
        match Marker::from_env(&vars) {
            Some(marker) if marker.fingerprint == fingerprint => Role::Inner(marker),
            Some(marker) => {
                tracing::debug!(
                    inherited = %marker.fingerprint,
                    "ignoring marker of another bundle"
                );
                Role::Outer
            }
            None => Role::Outer,
        }
    }
}

/// Where the archive of this executable lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveLocation {
    pub path: PathBuf,
    /// Stored as `<exe>.thaw` rather than appended to the executable
    pub sibling: bool,
}

/// Find the archive for `exe`: appended to the image, else a sibling file.
pub fn locate_archive(exe: &Path) -> Result<ArchiveLocation> {
    if Archive::probe(exe).unwrap_or(false) {
        return Ok(ArchiveLocation {
            path: exe.to_path_buf(),
            sibling: false,
        });
    }
    let mut sibling = exe.as_os_str().to_os_string();
    sibling.push(SIBLING_SUFFIX);
    let sibling = PathBuf::from(sibling);
    if sibling.is_file() {
        return Ok(ArchiveLocation {
            path: sibling,
            sibling: true,
        });
    }
    // Neither form is present; report why the image itself is unusable.
    Archive::open(exe)?;
    Err(BootError::launch(format!("no archive found for {}", exe.display())))
}

/// Everything the application stage knows about this launch.
#[derive(Debug, Clone)]
pub struct RuntimeContext {
    pub role: OwnerRole,
    pub executable: PathBuf,
    pub archive_path: PathBuf,
    pub cache_dir: PathBuf,
    pub fingerprint: String,
    /// Full argv, including the program name
    pub args: Vec<OsString>,
    pub manifest: Manifest,
    /// Variables to apply to processes the runtime starts
    pub child_env: ChildEnv,
    pub owns_lifecycle: bool,
}

/// Opened archive plus everything derived from it.
struct Bundle {
    archive: Archive<File>,
    location: ArchiveLocation,
    manifest: Manifest,
    config: BootConfig,
    fingerprint: String,
}

/// Drives one launch of the bundle.
pub struct Launcher<E> {
    runtime: E,
    executable: PathBuf,
    args: Vec<OsString>,
    env: Box<dyn Fn(&str) -> Option<OsString>>,
}

impl<E: EmbeddedRuntime> Launcher<E> {
    /// Launcher for the running process.
    pub fn from_env(runtime: E) -> Result<Self> {
        let executable = std::env::current_exe()
            .map_err(|e| BootError::launch_io("cannot determine own executable", e))?;
        Ok(Self {
            runtime,
            executable,
            args: std::env::args_os().collect(),
            env: Box::new(|key: &str| std::env::var_os(key)),
        })
    }

    /// Launcher with explicit inputs.
    pub fn new<F>(runtime: E, executable: impl Into<PathBuf>, args: Vec<OsString>, env: F) -> Self
    where
        F: Fn(&str) -> Option<OsString> + 'static,
    {
        Self {
            runtime,
            executable: executable.into(),
            args,
            env: Box::new(env),
        }
    }

    /// Run the bundle and return the exit code to report.
    pub fn run(&self) -> Result<i32> {
        let bundle = self.open_bundle()?;
        match Role::detect(&bundle.fingerprint, &self.env) {
            Role::Outer => self.run_outer(bundle),
            Role::Inner(marker) => self.run_inner(bundle, marker),
        }
    }

    fn open_bundle(&self) -> Result<Bundle> {
        let location = locate_archive(&self.executable)?;
        let archive = Archive::open(&location.path)?;
        archive.check_compatible()?;
        let manifest = Manifest::from_archive(&archive)?;

        let exe_dir = self.executable.parent().unwrap_or_else(|| Path::new("."));
        let exe_stem = self
            .executable
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| manifest.bundle.name.clone());
        let config =
            BootConfig::resolve(&manifest, exe_dir, &exe_stem, location.sibling, &self.env);
        let fingerprint = fingerprint(&manifest, &archive);

        tracing::debug!(
            archive = %location.path.display(),
            bundle = %manifest.bundle.name,
            %fingerprint,
            "bundle opened"
        );
        Ok(Bundle {
            archive,
            location,
            manifest,
            config,
            fingerprint,
        })
    }

    fn lifecycle(&self, bundle: &Bundle, dir: PathBuf) -> Lifecycle {
        Lifecycle::new(
            dir,
            bundle.fingerprint.clone(),
            bundle.config.is_persistent(),
            bundle.config.lock_timeout,
        )
    }

    fn run_outer(&self, bundle: Bundle) -> Result<i32> {
        let cache_dir = match &bundle.config.persistent_dir {
            Some(dir) => dir.clone(),
            None => cache_dir_for(&bundle.config.cache_root, &bundle.fingerprint),
        };
        let lifecycle = self.lifecycle(&bundle, cache_dir);

        let mut native_paths = Vec::new();
        let ownership = lifecycle.acquire_with(OwnerRole::Outer, |record, dir| {
            let names = extractable_names(&bundle.archive);
            record.complete = false;
            let extraction = ensure_extracted(&bundle.archive, &names, dir)?;
            record.files = extraction.records;
            record.complete = true;
            native_paths = bundle
                .archive
                .entries_of(EntryKind::NativeBinary)
                .map(|entry| crate::extract::entry_path(dir, &entry.name))
                .collect();
            tracing::info!(
                dir = %dir.display(),
                written = extraction.written,
                skipped = extraction.skipped,
                "bundle ready"
            );
            Ok(())
        })?;

        let marker = Marker {
            cache_dir: absolute(lifecycle.dir()),
            fingerprint: bundle.fingerprint.clone(),
            archive: absolute(&bundle.location.path),
        };
        let native_dirs = env::native_dirs(native_paths.iter().map(PathBuf::as_path))
            .into_iter()
            .map(|dir| absolute(&dir))
            .collect::<Vec<_>>();
        let child_env = ChildEnv::build(&marker, &native_dirs, &self.env)?;

        let mode = self.effective_mode(&bundle.config);
        tracing::debug!(?mode, "starting inner stage");
        match mode {
            LaunchMode::Spawn => self.spawn_inner(ownership, &child_env),
            LaunchMode::InProcess => {
                let ctx = self.context(&bundle, OwnerRole::Outer, &marker, child_env);
                let code = self.run_application(&bundle, &ctx);
                ownership.release()?;
                code
            }
            LaunchMode::Replace => self.replace_with_inner(ownership, &child_env),
        }
    }

    fn effective_mode(&self, config: &BootConfig) -> LaunchMode {
        match config.launch {
            LaunchMode::InProcess if !config.is_persistent() => {
                tracing::warn!("in-process launch needs a persistent install; spawning instead");
                LaunchMode::Spawn
            }
            LaunchMode::Replace if !config.is_persistent() || !cfg!(unix) => {
                tracing::warn!(
                    "replace launch needs a persistent install on Unix; spawning instead"
                );
                LaunchMode::Spawn
            }
            mode => mode,
        }
    }

    fn spawn_inner(&self, ownership: Ownership, child_env: &ChildEnv) -> Result<i32> {
        let mut command = Command::new(&self.executable);
        command.args(self.args.iter().skip(1));
        child_env.apply(&mut command);

        let mut child = command.spawn().map_err(|e| {
            BootError::launch_io(format!("cannot start {}", self.executable.display()), e)
        })?;
        let status = {
            let _forwarding = signals::forward_to(child.id());
            child.wait()
        };
        let status = status.map_err(|e| BootError::launch_io("waiting for inner stage", e))?;
        let code = signals::exit_code(status);
        tracing::debug!(code, "inner stage exited");

        ownership.release()?;
        Ok(code)
    }

    #[cfg(unix)]
    fn replace_with_inner(&self, ownership: Ownership, child_env: &ChildEnv) -> Result<i32> {
        use std::os::unix::process::CommandExt;

        // Persistent directories are never deleted, so the record can go
        // before this image is replaced.
        ownership.release()?;
        let mut command = Command::new(&self.executable);
        command.args(self.args.iter().skip(1));
        child_env.apply(&mut command);
        let err = command.exec();
        Err(BootError::launch_io(
            format!("cannot exec {}", self.executable.display()),
            err,
        ))
    }

    #[cfg(not(unix))]
    fn replace_with_inner(&self, ownership: Ownership, child_env: &ChildEnv) -> Result<i32> {
        self.spawn_inner(ownership, child_env)
    }

    fn run_inner(&self, bundle: Bundle, marker: Marker) -> Result<i32> {
        tracing::debug!(dir = %marker.cache_dir.display(), "attaching to prepared bundle");
        let lifecycle = self.lifecycle(&bundle, marker.cache_dir.clone());

        // Attach; re-extract only if the directory lost its extraction,
        // e.g. for a descendant that outlived every other owner.
        let ownership = lifecycle.acquire_with(OwnerRole::Inner, |record, dir| {
            if record.complete {
                return Ok(());
            }
            tracing::info!(dir = %dir.display(), "cache directory incomplete; extracting");
            let names = extractable_names(&bundle.archive);
            let extraction = ensure_extracted(&bundle.archive, &names, dir)?;
            record.files = extraction.records;
            record.complete = true;
            Ok(())
        })?;

        let ctx = self.context(&bundle, OwnerRole::Inner, &marker, ChildEnv::default());
        let code = self.run_application(&bundle, &ctx);
        ownership.release()?;
        code
    }

    fn context(
        &self,
        bundle: &Bundle,
        role: OwnerRole,
        marker: &Marker,
        child_env: ChildEnv,
    ) -> RuntimeContext {
        RuntimeContext {
            role,
            executable: self.executable.clone(),
            archive_path: marker.archive.clone(),
            cache_dir: marker.cache_dir.clone(),
            fingerprint: bundle.fingerprint.clone(),
            args: self.args.clone(),
            manifest: bundle.manifest.clone(),
            child_env,
            owns_lifecycle: true,
        }
    }

    fn run_application(&self, bundle: &Bundle, ctx: &RuntimeContext) -> Result<i32> {
        let modules = ModuleArchive::from_archive(&bundle.archive)?;
        let options = RuntimeOptions::from_archive(&bundle.archive);
        let code = self.runtime.run(ctx, &modules, &options)?;
        tracing::debug!(code, "application exited");
        Ok(code)
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
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

    const MARKER: [(&str, &str); 3] = [
        (env::CACHE_DIR_VAR, "/tmp/_thaw-abc"),
        (env::FINGERPRINT_VAR, "abc"),
        (env::ARCHIVE_VAR, "/opt/app"),
    ];

    #[test]
    fn test_no_marker_is_outer() {
        assert_eq!(Role::detect("abc", env_of(&[])), Role::Outer);
    }

    #[test]
    fn test_matching_marker_is_inner() {
        match Role::detect("abc", env_of(&MARKER)) {
            Role::Inner(marker) => assert_eq!(marker.cache_dir, PathBuf::from("/tmp/_thaw-abc")),
            Role::Outer => panic!("expected inner role"),
        }
    }

    #[test]
    fn test_foreign_marker_is_outer() {
        assert_eq!(Role::detect("other", env_of(&MARKER)), Role::Outer);
    }

    #[test]
    fn test_reset_forces_outer() {
        let mut pairs = MARKER.to_vec();
        pairs.push((env::RESET_ENVIRONMENT_VAR, "1"));
        assert_eq!(Role::detect("abc", env_of(&pairs)), Role::Outer);
    }

    #[test]
    fn test_locate_sibling_archive() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("tool");
        std::fs::write(&exe, b"plain executable").unwrap();

        let mut builder = thaw_archive::ArchiveBuilder::new();
        builder.add_data_file("f", b"x".to_vec()).unwrap();
        std::fs::write(dir.path().join("tool.thaw"), builder.to_bytes().unwrap()).unwrap();

        let location = locate_archive(&exe).unwrap();
        assert!(location.sibling);
        assert_eq!(location.path, dir.path().join("tool.thaw"));
    }

    #[test]
    fn test_locate_without_archive_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("tool");
        std::fs::write(&exe, vec![0u8; 512]).unwrap();
        let err = locate_archive(&exe).unwrap_err();
        assert_eq!(err.exit_code(), 241);
    }
}
