//! Bootstrap error types.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thaw_archive::ArchiveError;

/// Result type alias for bootstrap operations.
pub type Result<T> = std::result::Result<T, BootError>;

/// Failure categories visible to the operating system as exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ArchiveInvalid,
    ArchiveCorrupt,
    ExtractionFailed,
    LockTimeout,
    LaunchFailed,
}

impl ErrorKind {
    /// Reserved process exit code for this kind.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::ArchiveInvalid => 241,
            Self::ArchiveCorrupt => 242,
            Self::ExtractionFailed => 243,
            Self::LockTimeout => 244,
            Self::LaunchFailed => 245,
        }
    }
}

/// Errors that stop the bootstrap before the application runs.
#[derive(Debug, thiserror::Error)]
pub enum BootError {
    /// Archive could not be opened, parsed or read
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// Bundle manifest is present but unusable
    #[error("invalid bundle manifest: {0}")]
    Manifest(String),

    /// An entry could not be materialized on disk
    #[error("cannot extract '{entry}' to {path}: {source}")]
    ExtractionFailed {
        entry: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The cache directory or its lock file could not be managed
    #[error("cache directory {path}: {source}")]
    Cache {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Another process held the lifecycle lock for too long
    #[error("timed out after {}ms waiting for lock {path} (held by {holder})", .waited.as_millis())]
    LockTimeout {
        path: PathBuf,
        waited: Duration,
        holder: String,
    },

    /// The next stage could not be started
    #[error("launch failed: {reason}")]
    LaunchFailed {
        reason: String,
        #[source]
        source: Option<io::Error>,
    },
}

impl BootError {
    pub(crate) fn cache(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Cache {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn launch(reason: impl Into<String>) -> Self {
        Self::LaunchFailed {
            reason: reason.into(),
            source: None,
        }
    }

    pub(crate) fn launch_io(reason: impl Into<String>, source: io::Error) -> Self {
        Self::LaunchFailed {
            reason: reason.into(),
            source: Some(source),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Archive(ArchiveError::Corrupt { .. }) => ErrorKind::ArchiveCorrupt,
            Self::Archive(ArchiveError::Write { .. }) => ErrorKind::ExtractionFailed,
            Self::Archive(ArchiveError::Build { .. }) => ErrorKind::LaunchFailed,
            Self::Archive(_) | Self::Manifest(_) => ErrorKind::ArchiveInvalid,
            Self::ExtractionFailed { .. } | Self::Cache { .. } => ErrorKind::ExtractionFailed,
            Self::LockTimeout { .. } => ErrorKind::LockTimeout,
            Self::LaunchFailed { .. } => ErrorKind::LaunchFailed,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_reserved_and_distinct() {
        let kinds = [
            ErrorKind::ArchiveInvalid,
            ErrorKind::ArchiveCorrupt,
            ErrorKind::ExtractionFailed,
            ErrorKind::LockTimeout,
            ErrorKind::LaunchFailed,
        ];
        let codes: Vec<i32> = kinds.iter().map(|k| k.exit_code()).collect();
        assert_eq!(codes, vec![241, 242, 243, 244, 245]);
    }

    #[test]
    fn test_archive_error_kinds() {
        let invalid = BootError::from(ArchiveError::Invalid {
            path: PathBuf::from("app"),
            reason: "bad magic".to_string(),
        });
        assert_eq!(invalid.kind(), ErrorKind::ArchiveInvalid);
        assert!(invalid.to_string().contains("bad magic"));

        let corrupt = BootError::from(ArchiveError::Corrupt {
            entry: "lib.so".to_string(),
            reason: "checksum mismatch".to_string(),
        });
        assert_eq!(corrupt.exit_code(), 242);

        let missing = BootError::from(ArchiveError::NotFound {
            name: "thaw.toml".to_string(),
        });
        assert_eq!(missing.kind(), ErrorKind::ArchiveInvalid);
    }

    #[test]
    fn test_lock_timeout_message_names_holder() {
        let err = BootError::LockTimeout {
            path: PathBuf::from("/tmp/_thaw-1/.thaw-lock"),
            waited: Duration::from_millis(1500),
            holder: "pid 42".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("1500ms"));
        assert!(message.contains("pid 42"));
        assert_eq!(err.exit_code(), 244);
    }
}
