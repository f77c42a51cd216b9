//! Engine configuration (JSON, every field optional)
//!
//! ```json
//! {
//!   "thumbnails": { "max_concurrent": 2, "cache_size": 500, "primary_timeout_ms": 3000 },
//!   "metadata": { "timeout_ms": 2000 },
//!   "folder": { "max_files": 1000, "sort": "modified", "descending": true }
//! }
//! ```
//!
//! Missing keys take defaults, so an empty object is a valid config.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::core::coordinator::Limits;
use crate::core::generator::{FALLBACK_OFFSET_SECS, GenerationPolicy};
use crate::entities::ThumbSize;
use crate::utils::scan::{SortKey, SortOrder};

pub const CONFIG_FILE: &str = "vidgrid.json";

/// Video container extensions listed by default (matched case-insensitively)
pub const DEFAULT_EXTENSIONS: &[&str] = &[
    "mp4", "m4v", "mov", "mkv", "avi", "webm", "wmv", "flv", "mpg", "mpeg", "ts", "m2ts", "3gp",
];

/// `clamp(cpus / 2, 1, 4)`: leaves cores for the consumer and the decoder's
/// own threads.
pub fn default_concurrency() -> usize {
    (num_cpus::get() / 2).clamp(1, 4)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ThumbnailConfig {
    pub max_concurrent: usize,
    pub cache_size: usize,
    pub max_pending: usize,
    pub primary_timeout_ms: u64,
    pub retry_timeout_ms: u64,
    pub fallback_offset_secs: f64,
    /// Queued requests older than this are dropped; 0 disables expiry
    pub max_queue_age_ms: u64,
    pub size: ThumbSize,
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_concurrency(),
            cache_size: 500,
            max_pending: 64,
            primary_timeout_ms: 3000,
            retry_timeout_ms: 1500,
            fallback_offset_secs: FALLBACK_OFFSET_SECS,
            max_queue_age_ms: 30_000,
            size: ThumbSize::default(),
        }
    }
}

impl ThumbnailConfig {
    pub fn limits(&self) -> Limits {
        Limits {
            max_active: self.max_concurrent,
            max_pending: self.max_pending,
            max_queue_age: queue_age(self.max_queue_age_ms),
            cache_size: self.cache_size,
        }
    }

    pub fn policy(&self) -> GenerationPolicy {
        GenerationPolicy {
            primary_timeout: Duration::from_millis(self.primary_timeout_ms),
            retry_timeout: Duration::from_millis(self.retry_timeout_ms),
            fallback_offset_secs: self.fallback_offset_secs,
            thumb_size: self.size,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetadataConfig {
    pub max_concurrent: usize,
    pub cache_size: usize,
    pub max_pending: usize,
    pub timeout_ms: u64,
    pub max_queue_age_ms: u64,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_concurrency(),
            cache_size: 2000,
            max_pending: 256,
            timeout_ms: 2000,
            max_queue_age_ms: 30_000,
        }
    }
}

impl MetadataConfig {
    pub fn limits(&self) -> Limits {
        Limits {
            max_active: self.max_concurrent,
            max_pending: self.max_pending,
            max_queue_age: queue_age(self.max_queue_age_ms),
            cache_size: self.cache_size,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FolderConfig {
    /// Cap applied after sorting; `None` lists everything
    pub max_files: Option<usize>,
    pub sort: SortKey,
    pub order: SortOrder,
    /// Case-insensitive substring the file name must contain
    pub filter: Option<String>,
    pub extensions: Vec<String>,
}

impl Default for FolderConfig {
    fn default() -> Self {
        Self {
            max_files: None,
            sort: SortKey::Name,
            order: SortOrder::Ascending,
            filter: None,
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        }
    }
}

/// Whole configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub thumbnails: ThumbnailConfig,
    pub metadata: MetadataConfig,
    pub folder: FolderConfig,
}

impl EngineConfig {
    /// Load from `path`; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        info!("Loaded config from {}", path.display());
        Ok(config.normalized())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        debug!("Saved config to {}", path.display());
        Ok(())
    }

    /// Clamp values that would stall the engine (zero workers, zero cache).
    pub fn normalized(mut self) -> Self {
        let t = &mut self.thumbnails;
        t.max_concurrent = t.max_concurrent.max(1);
        t.cache_size = t.cache_size.max(1);
        t.primary_timeout_ms = t.primary_timeout_ms.max(1);
        t.retry_timeout_ms = t.retry_timeout_ms.max(1);
        if !(t.fallback_offset_secs.is_finite() && t.fallback_offset_secs >= 0.0) {
            t.fallback_offset_secs = FALLBACK_OFFSET_SECS;
        }
        t.size.max_width = t.size.max_width.max(1);
        t.size.max_height = t.size.max_height.max(1);

        let m = &mut self.metadata;
        m.max_concurrent = m.max_concurrent.max(1);
        m.cache_size = m.cache_size.max(1);
        m.timeout_ms = m.timeout_ms.max(1);

        for ext in &mut self.folder.extensions {
            *ext = ext.trim_start_matches('.').to_ascii_lowercase();
        }
        self.folder.filter = self.folder.filter.take().filter(|f| !f.is_empty());
        self
    }
}

fn queue_age(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}
