//! Core engine modules - store, coordination, generation, folder pipeline
//!
//! These modules form the thumbnail/metadata engine, independent of any UI.

pub mod coordinator;
pub mod engine;
pub mod folder;
pub mod generator;
pub mod store;
pub mod workers;

// Re-exports for convenience
pub use coordinator::{Coordinator, CoordinatorStats, Limits, Producer, RequestHandle};
pub use engine::{Engine, EngineStats};
pub use folder::{FolderEvent, FolderLoader, FolderSnapshot, ItemSnapshot, ItemState, Phase};
pub use generator::{GenerationPolicy, MetadataProbe, ThumbnailGenerator, primary_offset};
pub use store::{CacheStats, LruStore};
pub use workers::Workers;
