//! Lifecycle coordinator
//!
//! Every process that uses an extraction directory registers an owner record
//! in the directory and removes it when done. The owner that removes the
//! last record deletes the directory. All reads and writes of the records
//! happen under an exclusive lock on `.thaw-lock`, which holds no data:
//!
//! 1. Open `.thaw-lock`, poll for the lock with a bounded wait
//! 2. Drop records of owners that no longer run (crash recovery)
//! 3. Throw away an extraction nobody finished
//! 4. Register, prepare the extraction, unregister or retire
//! 5. Write the records back (see [`state`]) and unlock
//!
//! A retiring owner sets the `retired` tombstone before deleting anything, so
//! a process that opened the old lock file retries against a fresh one.

pub mod process;
pub mod state;

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs4::FileExt;

use crate::error::{BootError, Result};
use crate::extract::sweep_partials;
use process::ProcessIdentity;
use state::{ExtractionRecord, HolderRecord, LockState, OwnerRecord};

pub use state::{OwnerRole, OWNERS_DIR, STATE_FILE};

/// Lock-file name inside a cache directory.
pub const LOCK_FILE: &str = ".thaw-lock";

/// Prefix of per-fingerprint cache directory names.
pub const CACHE_DIR_PREFIX: &str = "_thaw-";

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Cache directory for a bundle fingerprint under `root`.
pub fn cache_dir_for(root: &Path, fingerprint: &str) -> PathBuf {
    root.join(format!("{}{}", CACHE_DIR_PREFIX, fingerprint))
}

/// Coordinates all processes sharing one extraction directory.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    dir: PathBuf,
    fingerprint: String,
    persistent: bool,
    timeout: Duration,
}

/// An exclusively locked lock file with the directory's record.
struct Locked {
    file: File,
    state: LockState,
}

impl Lifecycle {
    pub fn new(
        dir: impl Into<PathBuf>,
        fingerprint: impl Into<String>,
        persistent: bool,
        timeout: Duration,
    ) -> Self {
        Self {
            dir: dir.into(),
            fingerprint: fingerprint.into(),
            persistent,
            timeout,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_FILE)
    }

    /// Register an owner without touching the extraction.
    pub fn acquire(&self, role: OwnerRole) -> Result<Ownership> {
        self.acquire_with(role, |_, _| Ok(()))
    }

    /// Register an owner, then run `prepare` under the lock.
    ///
    /// `prepare` sees the extraction record after stale owners were pruned
    /// and an interrupted extraction was discarded. If it fails the
    /// registration is undone and the error returned.
    pub fn acquire_with<F>(&self, role: OwnerRole, prepare: F) -> Result<Ownership>
    where
        F: FnOnce(&mut ExtractionRecord, &Path) -> Result<()>,
    {
        let mut locked = self.lock()?;
        self.prune(&mut locked.state);
        self.discard_interrupted(&mut locked.state);

        let me = ProcessIdentity::current();
        let token: u64 = rand::random();
        locked.state.owners.push(OwnerRecord {
            pid: me.pid,
            start_time: me.start_time,
            role,
            token,
        });

        if let Err(err) = prepare(&mut locked.state.extraction, &self.dir) {
            locked.state.remove_owner(token);
            if let Err(e) = self.finish(locked) {
                tracing::warn!(
                    dir = %self.dir.display(),
                    error = %e,
                    "cleanup after failed preparation"
                );
            }
            return Err(err);
        }

        tracing::debug!(
            dir = %self.dir.display(),
            ?role,
            owners = locked.state.owners.len(),
            "ownership acquired"
        );
        self.finish(locked)?;

        Ok(Ownership {
            lifecycle: self.clone(),
            token,
            released: false,
        })
    }

    /// Read the current record, pruning stale owners. Mostly for inspection.
    pub fn snapshot(&self) -> Result<LockState> {
        let mut locked = self.lock()?;
        self.prune(&mut locked.state);
        let state = locked.state.clone();
        self.finish(locked)?;
        Ok(state)
    }

    fn release(&self, token: u64) -> Result<()> {
        let mut locked = self.lock()?;
        if !locked.state.remove_owner(token) {
            tracing::warn!(dir = %self.dir.display(), token, "owner record already gone");
        }
        self.prune(&mut locked.state);
        tracing::debug!(
            dir = %self.dir.display(),
            owners = locked.state.owners.len(),
            "ownership released"
        );
        self.finish(locked)
    }

    /// Drop owners that no longer run.
    fn prune(&self, state: &mut LockState) {
        state.owners.retain(|owner| {
            let alive = ProcessIdentity {
                pid: owner.pid,
                start_time: owner.start_time,
            }
            .is_alive();
            if !alive {
                tracing::info!(pid = owner.pid, role = ?owner.role, "pruning stale owner");
            }
            alive
        });
        state.count = state.owners.len() as u32;
    }

    /// Clean up after an extraction that never completed.
    ///
    /// Extraction only runs under the lock, so temporary files found now
    /// belong to a writer that died. An unowned temporary directory is
    /// emptied entirely; a persistent or still-owned one keeps its files,
    /// which the next extraction verifies one by one.
    fn discard_interrupted(&self, state: &mut LockState) {
        if state.extraction.complete {
            return;
        }
        if state.owners.is_empty() && !self.persistent {
            tracing::debug!(dir = %self.dir.display(), "discarding incomplete extraction");
            if let Err(e) = purge_contents(&self.dir) {
                tracing::warn!(dir = %self.dir.display(), error = %e, "purge failed");
            }
            state.extraction = ExtractionRecord::default();
            return;
        }
        match sweep_partials(&self.dir) {
            Ok(0) => {}
            Ok(removed) => {
                tracing::info!(dir = %self.dir.display(), removed, "removed interrupted writes")
            }
            Err(e) => tracing::warn!(dir = %self.dir.display(), error = %e, "sweep failed"),
        }
    }

    /// Write the record and unlock. If no owner remains in a
    /// non-persistent directory, retire and delete it instead.
    fn finish(&self, mut locked: Locked) -> Result<()> {
        locked.state.holder = None;

        if !locked.state.owners.is_empty() || self.persistent {
            let saved = locked.state.save(&self.dir);
            unlock(&locked.file);
            return saved.map_err(|e| BootError::cache(&self.dir, e));
        }

        locked.state.retired = true;
        if let Err(e) = locked.state.save(&self.dir) {
            unlock(&locked.file);
            return Err(BootError::cache(&self.dir, e));
        }
        tracing::debug!(dir = %self.dir.display(), "last owner gone; removing cache directory");
        self.remove_retired(locked.file);
        Ok(())
    }

    #[cfg(unix)]
    fn remove_retired(&self, file: File) {
        // Unlink while still holding the lock: a newcomer either opened the
        // old file (and will see the tombstone) or creates a fresh one.
        if let Err(e) = purge_contents(&self.dir) {
            tracing::warn!(dir = %self.dir.display(), error = %e, "cleanup incomplete");
        }
        remove_records(&self.dir);
        if let Err(e) = fs::remove_file(self.lock_path()) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(dir = %self.dir.display(), error = %e, "cannot remove lock file");
            }
        }
        if let Err(e) = fs::remove_dir(&self.dir) {
            tracing::debug!(dir = %self.dir.display(), error = %e, "cache directory kept");
        }
        unlock(&file);
    }

    #[cfg(not(unix))]
    fn remove_retired(&self, file: File) {
        // Open files cannot be deleted here; release the lock first.
        if let Err(e) = purge_contents(&self.dir) {
            tracing::warn!(dir = %self.dir.display(), error = %e, "cleanup incomplete");
        }
        remove_records(&self.dir);
        unlock(&file);
        drop(file);
        let _ = fs::remove_file(self.lock_path());
        let _ = fs::remove_dir(&self.dir);
    }

    /// Take the exclusive lock on the current lock file.
    fn lock(&self) -> Result<Locked> {
        let started = Instant::now();
        let mut deadline = started + self.timeout;
        let mut retried = false;
        let lock_path = self.lock_path();

        loop {
            let file = self.open_lock_file()?;
            loop {
                match file.try_lock_exclusive() {
                    Ok(()) => break,
                    Err(e) if is_contended(&e) => {
                        if Instant::now() >= deadline {
                            if !retried && self.holder_is_stale() {
                                tracing::warn!(
                                    path = %lock_path.display(),
                                    "lock holder is gone; retrying once"
                                );
                                retried = true;
                                deadline = Instant::now() + self.timeout;
                                continue;
                            }
                            return Err(BootError::LockTimeout {
                                path: lock_path,
                                waited: started.elapsed(),
                                holder: describe_holder(&read_unlocked(&self.dir)),
                            });
                        }
                        thread::sleep(POLL_INTERVAL);
                    }
                    Err(e) => return Err(BootError::cache(&lock_path, e)),
                }
            }

            // The file may have been unlinked between open and lock.
            if !same_file(&file, &lock_path) {
                unlock(&file);
                continue;
            }

            let mut state = match LockState::load(&self.dir, &self.fingerprint) {
                Ok(state) => state,
                Err(e) => {
                    unlock(&file);
                    return Err(BootError::cache(&self.dir, e));
                }
            };
            if state.retired {
                // On Unix a retiring owner unlinks the file before unlocking,
                // so a tombstone that is still linked was left by a crash.
                // Elsewhere the owner unlinks after unlocking; give it until
                // the deadline.
                if cfg!(unix) || Instant::now() >= deadline {
                    tracing::warn!(dir = %self.dir.display(), "adopting abandoned cache directory");
                    if let Err(e) = purge_contents(&self.dir) {
                        tracing::warn!(dir = %self.dir.display(), error = %e, "purge failed");
                    }
                    state.retired = false;
                    state.extraction = ExtractionRecord::default();
                } else {
                    unlock(&file);
                    drop(file);
                    thread::sleep(POLL_INTERVAL);
                    continue;
                }
            }

            let me = ProcessIdentity::current();
            state.holder = Some(HolderRecord {
                pid: me.pid,
                start_time: me.start_time,
            });
            if let Err(e) = state.save(&self.dir) {
                unlock(&file);
                return Err(BootError::cache(&self.dir, e));
            }
            return Ok(Locked { file, state });
        }
    }

    fn open_lock_file(&self) -> Result<File> {
        let lock_path = self.lock_path();
        let mut attempts = 0;
        loop {
            create_private_dir(&self.dir).map_err(|e| BootError::cache(&self.dir, e))?;
            match OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&lock_path)
            {
                Ok(file) => return Ok(file),
                // Directory removed by a retiring owner between the two calls.
                Err(e) if e.kind() == io::ErrorKind::NotFound && attempts < 10 => attempts += 1,
                Err(e) => return Err(BootError::cache(&lock_path, e)),
            }
        }
    }

    fn holder_is_stale(&self) -> bool {
        match read_unlocked(&self.dir).and_then(|state| state.holder) {
            Some(holder) => !ProcessIdentity {
                pid: holder.pid,
                start_time: holder.start_time,
            }
            .is_alive(),
            None => false,
        }
    }
}

/// A registered use of a cache directory. Released on [`Ownership::release`]
/// or when dropped.
#[derive(Debug)]
pub struct Ownership {
    lifecycle: Lifecycle,
    token: u64,
    released: bool,
}

impl Ownership {
    pub fn dir(&self) -> &Path {
        self.lifecycle.dir()
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    /// Remove this owner's record. The last owner deletes a non-persistent
    /// directory.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.lifecycle.release(self.token)
    }
}

impl Drop for Ownership {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.lifecycle.release(self.token) {
            tracing::warn!(
                dir = %self.lifecycle.dir().display(),
                error = %e,
                "release on drop failed"
            );
        }
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs4::lock_contended_error().raw_os_error()
}

fn unlock(file: &File) {
    if let Err(e) = FileExt::unlock(file) {
        tracing::debug!(error = %e, "unlock failed");
    }
}

/// Best-effort read of the state document without the lock.
fn read_unlocked(dir: &Path) -> Option<LockState> {
    let bytes = fs::read(dir.join(STATE_FILE)).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn describe_holder(state: &Option<LockState>) -> String {
    match state.as_ref().and_then(|s| s.holder.as_ref()) {
        Some(holder) => format!("pid {}", holder.pid),
        None => "an unknown process".to_string(),
    }
}

/// Remove everything in `dir` except the lock file and the records.
fn purge_contents(dir: &Path) -> io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    let mut first_error = None;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        if name == LOCK_FILE || name == STATE_FILE || name == OWNERS_DIR {
            continue;
        }
        let path = entry.path();
        let result = if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        if let Err(e) = result {
            if e.kind() != io::ErrorKind::NotFound && first_error.is_none() {
                first_error = Some(e);
            }
        }
    }
    first_error.map_or(Ok(()), Err)
}

/// Delete the records of a retired directory.
fn remove_records(dir: &Path) {
    if let Err(e) = fs::remove_dir_all(dir.join(OWNERS_DIR)) {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!(dir = %dir.display(), error = %e, "cannot remove owner records");
        }
    }
    if let Err(e) = fs::remove_file(dir.join(STATE_FILE)) {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!(dir = %dir.display(), error = %e, "cannot remove state");
        }
    }
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    if let Some(parent) = dir.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::DirBuilder::new().mode(0o700).create(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && dir.is_dir() => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)
}

#[cfg(unix)]
fn same_file(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (file.metadata(), fs::metadata(path)) {
        (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn same_file(_file: &File, path: &Path) -> bool {
    path.exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lifecycle(root: &Path, persistent: bool) -> Lifecycle {
        Lifecycle::new(cache_dir_for(root, "f00d"), "f00d", persistent, Duration::from_secs(5))
    }

    #[test]
    fn test_last_release_removes_directory() {
        let root = tempfile::tempdir().unwrap();
        let lifecycle = lifecycle(root.path(), false);

        let first = lifecycle
            .acquire_with(OwnerRole::Outer, |record, dir| {
                fs::write(dir.join("payload"), b"x").unwrap();
                record.complete = true;
                Ok(())
            })
            .unwrap();
        let second = lifecycle.acquire(OwnerRole::Inner).unwrap();
        assert_eq!(lifecycle.snapshot().unwrap().count, 2);

        first.release().unwrap();
        assert!(lifecycle.dir().join("payload").exists());
        second.release().unwrap();
        assert!(!lifecycle.dir().exists());
    }

    #[test]
    fn test_drop_releases() {
        let root = tempfile::tempdir().unwrap();
        let lifecycle = lifecycle(root.path(), false);
        {
            let _owner = lifecycle.acquire(OwnerRole::Outer).unwrap();
            assert!(lifecycle.dir().exists());
        }
        assert!(!lifecycle.dir().exists());
    }

    #[test]
    fn test_persistent_directory_is_kept() {
        let root = tempfile::tempdir().unwrap();
        let lifecycle = lifecycle(root.path(), true);
        let owner = lifecycle.acquire(OwnerRole::Outer).unwrap();
        owner.release().unwrap();
        assert!(lifecycle.dir().exists());
        assert_eq!(lifecycle.snapshot().unwrap().count, 0);
    }

    #[test]
    fn test_failed_preparation_unregisters() {
        let root = tempfile::tempdir().unwrap();
        let lifecycle = lifecycle(root.path(), false);
        let _keep = lifecycle.acquire(OwnerRole::Inner).unwrap();

        let err = lifecycle
            .acquire_with(OwnerRole::Outer, |_, _| Err(BootError::launch("nope")))
            .unwrap_err();
        assert!(err.to_string().contains("nope"));
        assert_eq!(lifecycle.snapshot().unwrap().count, 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_cache_dir_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let root = tempfile::tempdir().unwrap();
        let lifecycle = lifecycle(root.path(), false);
        let _owner = lifecycle.acquire(OwnerRole::Outer).unwrap();
        let mode = fs::metadata(lifecycle.dir()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn test_lock_timeout_when_held() {
        let root = tempfile::tempdir().unwrap();
        let lifecycle = Lifecycle::new(
            cache_dir_for(root.path(), "beef"),
            "beef",
            false,
            Duration::from_millis(200),
        );
        let _owner = lifecycle.acquire(OwnerRole::Outer).unwrap();

        // Hold the lock from a separate open file description.
        let held = OpenOptions::new()
            .read(true)
            .write(true)
            .open(lifecycle.lock_path())
            .unwrap();
        held.lock_exclusive().unwrap();

        let err = lifecycle.acquire(OwnerRole::Inner).unwrap_err();
        assert!(matches!(err, BootError::LockTimeout { .. }));
        assert_eq!(err.exit_code(), 244);
        FileExt::unlock(&held).unwrap();
    }
}
