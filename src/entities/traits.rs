//! Abstract traits for dependency inversion.
//!
//! The engine in `core/` only knows the frame extractor through this trait.
//! Adapters (`loader_cmd`, `loader_video`) and test doubles implement it.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use image::RgbaImage;

use super::media::{ThumbSize, VideoProbe};

/// Cooperative stop signal for an extraction that overran its deadline.
///
/// Raised by the caller when it stops waiting. Extractors that can stop early
/// (kill a child process, break out of a packet loop) should poll it; the rest
/// simply have their result discarded.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// `Err(ExtractError::Aborted)` once raised, for use with `?` in loops.
    pub fn check(&self) -> Result<(), ExtractError> {
        if self.is_aborted() {
            Err(ExtractError::Aborted)
        } else {
            Ok(())
        }
    }
}

/// Frame extraction errors
#[derive(Debug)]
pub enum ExtractError {
    /// Container could not be opened
    Open(String),
    NoVideoStream,
    Decode(String),
    /// Decoder ran out of packets before reaching the offset
    FrameNotFound(f64),
    ZeroDuration,
    /// Caller stopped waiting
    Aborted,
    /// External tool missing or exited with failure
    Tool(String),
    Io(std::io::Error),
}

impl fmt::Display for ExtractError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractError::Open(msg) => write!(f, "Failed to open video: {}", msg),
            ExtractError::NoVideoStream => write!(f, "No video stream found"),
            ExtractError::Decode(msg) => write!(f, "Decode failed: {}", msg),
            ExtractError::FrameNotFound(secs) => write!(f, "No frame at {:.1}s", secs),
            ExtractError::ZeroDuration => write!(f, "Video has no usable duration"),
            ExtractError::Aborted => write!(f, "Extraction aborted"),
            ExtractError::Tool(msg) => write!(f, "Extractor tool failed: {}", msg),
            ExtractError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for ExtractError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExtractError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ExtractError {
    fn from(e: std::io::Error) -> Self {
        ExtractError::Io(e)
    }
}

/// Host media framework boundary: decodes a single frame, probes a stream.
///
/// Calls may block for an unpredictable time. Callers run them on a dedicated
/// thread under a deadline, so implementations need no timeout of their own.
pub trait FrameExtractor: Send + Sync {
    /// Short backend name for logs and `--version`.
    fn name(&self) -> &'static str;

    /// Decode the frame at `offset_secs`, scaled to fit `max_size`.
    fn extract_frame(
        &self,
        path: &Path,
        offset_secs: f64,
        max_size: ThumbSize,
        abort: &AbortFlag,
    ) -> Result<RgbaImage, ExtractError>;

    /// Read duration, resolution and frame rate without decoding frames.
    fn probe(&self, path: &Path, abort: &AbortFlag) -> Result<VideoProbe, ExtractError>;

    /// Duration in seconds; zero or non-finite durations are an error.
    fn load_duration(&self, path: &Path, abort: &AbortFlag) -> Result<f64, ExtractError> {
        let probe = self.probe(path, abort)?;
        if probe.duration_secs.is_finite() && probe.duration_secs > 0.0 {
            Ok(probe.duration_secs)
        } else {
            Err(ExtractError::ZeroDuration)
        }
    }
}

/// Blanket impl: Arc<T> implements the trait if T does
impl<T: FrameExtractor + ?Sized> FrameExtractor for Arc<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn extract_frame(
        &self,
        path: &Path,
        offset_secs: f64,
        max_size: ThumbSize,
        abort: &AbortFlag,
    ) -> Result<RgbaImage, ExtractError> {
        (**self).extract_frame(path, offset_secs, max_size, abort)
    }

    fn probe(&self, path: &Path, abort: &AbortFlag) -> Result<VideoProbe, ExtractError> {
        (**self).probe(path, abort)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProbe(f64);

    impl FrameExtractor for FixedProbe {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn extract_frame(
            &self,
            _path: &Path,
            _offset_secs: f64,
            _max_size: ThumbSize,
            _abort: &AbortFlag,
        ) -> Result<RgbaImage, ExtractError> {
            Ok(RgbaImage::new(1, 1))
        }

        fn probe(&self, _path: &Path, _abort: &AbortFlag) -> Result<VideoProbe, ExtractError> {
            Ok(VideoProbe {
                duration_secs: self.0,
                ..Default::default()
            })
        }
    }

    #[test]
    fn test_load_duration_rejects_zero() {
        let abort = AbortFlag::new();
        let path = Path::new("x.mp4");
        assert_eq!(FixedProbe(12.5).load_duration(path, &abort).unwrap(), 12.5);
        assert!(matches!(
            FixedProbe(0.0).load_duration(path, &abort),
            Err(ExtractError::ZeroDuration)
        ));
    }

    #[test]
    fn test_abort_flag_shared_between_clones() {
        let flag = AbortFlag::new();
        let other = flag.clone();
        assert!(flag.check().is_ok());
        other.abort();
        assert!(flag.is_aborted());
        assert!(matches!(flag.check(), Err(ExtractError::Aborted)));
    }
}
