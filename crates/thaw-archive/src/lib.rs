//! Thaw Archive Library
//!
//! Container format for frozen application bundles:
//! - Archive reader over the tail of a host executable (or a sibling file)
//! - Archive builder for producing bundles and test fixtures
//! - Module archives served from memory with layered lookup

pub mod error;
pub mod format;
pub mod modules;
pub mod reader;
pub mod writer;

pub use error::{ArchiveError, Result};
pub use format::{host_variant, ArchiveHeader, Compression, EntryKind, TocEntry};
pub use modules::{Module, ModuleArchive, ModuleBlobBuilder};
pub use reader::Archive;
pub use writer::ArchiveBuilder;
