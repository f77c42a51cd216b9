//! vidgrid - video folder browsing engine
//!
//! Thumbnails and metadata for folders of video files, generated in the
//! background under bounded concurrency and cached in memory.

// Core engine (store, coordinator, generator, folder pipeline, workers)
pub mod core;

// App modules
pub mod cli;
pub mod config;
pub mod entities;
pub mod paths;
pub mod utils;

// Re-export commonly used types from core
pub use core::engine::Engine;
pub use core::folder::{FolderEvent, FolderLoader, Phase};

// Re-export entities
pub use entities::{CacheKey, FileId, FrameExtractor, Outcome, Priority, Thumbnail, VideoMetadata};
