//! Media identities and the values the engine hands out
//!
//! - `FileId`: canonical path, stable for the lifetime of a session
//! - `CacheKey`: (FileId, offset) with the offset rounded to 0.1s
//! - `Thumbnail`: decoded RGBA frame, cheap to clone (Arc)
//! - `VideoMetadata`: size, duration, resolution, frame rate
//! - `Outcome`: what a waiting caller receives, never an error

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::RgbaImage;
use serde::{Deserialize, Serialize};

/// Offset steps per second stored in a [`CacheKey`] (0.1s precision).
pub const OFFSET_STEPS_PER_SEC: f64 = 10.0;

/// Identity of a file for the lifetime of a session.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(Arc<Path>);

impl FileId {
    /// Canonicalize `path`. Falls back to the path as given when the file
    /// can't be resolved (deleted, permission denied).
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        Self(Arc::from(canonical))
    }

    /// Use the path verbatim, without touching the filesystem.
    pub fn from_raw(path: impl Into<PathBuf>) -> Self {
        Self(Arc::from(path.into()))
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    /// File name for display; falls back to the full path.
    pub fn display_name(&self) -> String {
        self.0
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.0.display().to_string())
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({})", self.0.display())
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Identifies one logical thumbnail: same file, same rounded offset.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    file: FileId,
    offset_steps: i64,
}

impl CacheKey {
    /// Negative and non-finite offsets clamp to 0.
    pub fn new(file: FileId, offset_secs: f64) -> Self {
        let secs = if offset_secs.is_finite() {
            offset_secs.max(0.0)
        } else {
            0.0
        };
        Self {
            file,
            offset_steps: (secs * OFFSET_STEPS_PER_SEC).round() as i64,
        }
    }

    pub fn file(&self) -> &FileId {
        &self.file
    }

    /// Rounded offset in seconds (the value extraction is performed at).
    pub fn offset_secs(&self) -> f64 {
        self.offset_steps as f64 / OFFSET_STEPS_PER_SEC
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:.1}s", self.file, self.offset_secs())
    }
}

/// Request priority. Ordering matters: `High > Normal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    #[default]
    Normal,
    High,
}

/// Bounding box for generated thumbnails (aspect ratio preserved).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThumbSize {
    pub max_width: u32,
    pub max_height: u32,
}

impl Default for ThumbSize {
    fn default() -> Self {
        Self {
            max_width: 320,
            max_height: 180,
        }
    }
}

impl ThumbSize {
    /// Scaled dimensions fitting `(width, height)` into the box. Never upscales,
    /// never returns a zero dimension.
    pub fn fit(&self, width: u32, height: u32) -> (u32, u32) {
        if width == 0 || height == 0 {
            return (self.max_width.max(1), self.max_height.max(1));
        }
        let scale = (self.max_width as f64 / width as f64)
            .min(self.max_height as f64 / height as f64)
            .min(1.0);
        let w = ((width as f64 * scale).round() as u32).max(1);
        let h = ((height as f64 * scale).round() as u32).max(1);
        (w, h)
    }
}

/// Decoded still frame for one video.
#[derive(Clone)]
pub struct Thumbnail {
    image: Arc<RgbaImage>,
    offset_secs: f64,
}

impl Thumbnail {
    pub fn new(image: RgbaImage, offset_secs: f64) -> Self {
        Self {
            image: Arc::new(image),
            offset_secs,
        }
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Offset the frame was actually taken at (primary or fallback).
    pub fn offset_secs(&self) -> f64 {
        self.offset_secs
    }

    /// True if both refer to the same decoded buffer.
    pub fn same_image(&self, other: &Thumbnail) -> bool {
        Arc::ptr_eq(&self.image, &other.image)
    }

    pub fn save_png(&self, path: &Path) -> image::ImageResult<()> {
        self.image.save_with_format(path, image::ImageFormat::Png)
    }
}

impl fmt::Debug for Thumbnail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thumbnail")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("offset_secs", &self.offset_secs)
            .finish()
    }
}

/// Stream properties reported by a [`FrameExtractor`](super::traits::FrameExtractor) probe.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VideoProbe {
    pub duration_secs: f64,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

/// Per-file metadata shown next to the thumbnail.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct VideoMetadata {
    pub size_bytes: u64,
    pub duration_secs: f64,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

impl VideoMetadata {
    pub fn new(size_bytes: u64, probe: VideoProbe) -> Self {
        Self {
            size_bytes,
            duration_secs: probe.duration_secs,
            width: probe.width,
            height: probe.height,
            fps: probe.fps,
        }
    }

    /// Duration if the probe produced a usable one.
    pub fn duration(&self) -> Option<f64> {
        (self.duration_secs.is_finite() && self.duration_secs > 0.0).then_some(self.duration_secs)
    }
}

/// Why a request produced nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Unavailable {
    /// Extraction failed or timed out, including the retry
    Failed,
    /// Queue full; re-request on the next visibility pass
    Busy,
    /// Sat in the queue longer than the configured maximum age
    Expired,
    /// Engine shut down
    Closed,
}

impl fmt::Display for Unavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unavailable::Failed => write!(f, "unavailable"),
            Unavailable::Busy => write!(f, "busy, try again"),
            Unavailable::Expired => write!(f, "expired in queue"),
            Unavailable::Closed => write!(f, "engine closed"),
        }
    }
}

/// Result delivered to a waiting caller.
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    Available(T),
    Unavailable(Unavailable),
}

impl<T> Outcome<T> {
    pub fn is_available(&self) -> bool {
        matches!(self, Outcome::Available(_))
    }

    pub fn available(self) -> Option<T> {
        match self {
            Outcome::Available(v) => Some(v),
            Outcome::Unavailable(_) => None,
        }
    }

    pub fn reason(&self) -> Option<Unavailable> {
        match self {
            Outcome::Available(_) => None,
            Outcome::Unavailable(r) => Some(*r),
        }
    }
}

impl<T> From<Option<T>> for Outcome<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Outcome::Available(v),
            None => Outcome::Unavailable(Unavailable::Failed),
        }
    }
}
