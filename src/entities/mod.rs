//! Entities module - media types and the frame extractor boundary
//!
//! - `media`: identities (FileId, CacheKey) and values (Thumbnail, VideoMetadata, Outcome)
//! - `traits`: FrameExtractor trait the engine depends on
//! - `loader_cmd`: extractor backed by the ffmpeg/ffprobe CLI tools
//! - `loader_video`: in-process FFmpeg extractor (feature `ffmpeg`)

pub mod loader_cmd;
#[cfg(feature = "ffmpeg")]
pub mod loader_video;
pub mod media;
pub mod traits;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

pub use loader_cmd::CommandExtractor;
#[cfg(feature = "ffmpeg")]
pub use loader_video::FfmpegExtractor;
pub use media::{
    CacheKey, FileId, Outcome, Priority, ThumbSize, Thumbnail, Unavailable, VideoMetadata,
    VideoProbe,
};
pub use traits::{AbortFlag, ExtractError, FrameExtractor};

/// Extractor for the compiled-in backend: linked FFmpeg when the `ffmpeg`
/// feature is on, the command-line tools otherwise.
pub fn default_extractor() -> Arc<dyn FrameExtractor> {
    #[cfg(feature = "ffmpeg")]
    {
        Arc::new(FfmpegExtractor::new())
    }
    #[cfg(not(feature = "ffmpeg"))]
    {
        Arc::new(CommandExtractor::new())
    }
}
