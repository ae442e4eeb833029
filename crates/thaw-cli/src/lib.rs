//! Shared pieces of the `thaw` and `thaw-boot` binaries.

pub mod logging;
