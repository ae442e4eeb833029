//! Archive error types.

use std::io;
use std::path::PathBuf;

/// Result type alias for archive operations.
pub type Result<T> = std::result::Result<T, ArchiveError>;

/// Errors produced while reading or writing bundle archives.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// Structural problem: bad magic, unsupported version, bounds outside the
    /// image, malformed table of contents. Never retried.
    #[error("invalid archive {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },

    /// The archive has no entry with this name.
    #[error("no entry named '{name}'")]
    NotFound { name: String },

    /// A single entry failed decompression or checksum verification.
    #[error("corrupt entry '{entry}': {reason}")]
    Corrupt { entry: String, reason: String },

    /// The destination of a streamed read refused the payload.
    #[error("failed to write entry '{entry}': {source}")]
    Write {
        entry: String,
        #[source]
        source: io::Error,
    },

    /// An entry could not be added to an archive or module blob under construction.
    #[error("cannot add entry '{name}': {reason}")]
    Build { name: String, reason: String },

    /// The archive image itself could not be read.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ArchiveError {
    pub(crate) fn invalid(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn corrupt(entry: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            entry: entry.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn build(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Build {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// True for structural failures (the archive as a whole is unusable).
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::Invalid { .. } | Self::Io { .. })
    }
}
