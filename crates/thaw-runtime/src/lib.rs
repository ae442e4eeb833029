//! Thaw Runtime Library
//!
//! The stages of the bootloader that turn a bundle into a running process:
//! - Extraction of native binaries and data files into a cache directory
//! - Reference-counted lifecycle of that directory across processes
//! - Two-role launch controller (outer bootstrap, inner application)
//! - Seam for the embedded runtime that finally runs the application

pub mod config;
pub mod error;
pub mod extract;
pub mod launch;
pub mod lifecycle;
pub mod runtime;

pub use config::{fingerprint, BootConfig, LaunchMode, Manifest};
pub use error::{BootError, ErrorKind, Result};
pub use extract::{ensure_extracted, Extraction, FileRecord};
pub use launch::{Launcher, Role, RuntimeContext};
pub use lifecycle::{Lifecycle, OwnerRole, Ownership};
pub use runtime::{EmbeddedRuntime, NativeEntryRuntime, RuntimeOptions};
