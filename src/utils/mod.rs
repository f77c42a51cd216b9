//! Utility functions
//!
//! **Why**: Helpers shared by the folder pipeline and the CLI
//!
//! - `scan`: directory enumeration, filtering, sorting, capping
//! - `format`: human-readable sizes and durations

pub mod format;
pub mod scan;

pub use format::{format_duration, format_size};
pub use scan::{FileEntry, Listing, ScanError, ScanOptions, SortKey, SortOrder, scan_dir};
