//! Scripted extractor for tests: per-file durations, delays, stalls, failures,
//! and a log of every call.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use image::{Rgba, RgbaImage};

use super::media::{ThumbSize, VideoProbe};
use super::traits::{AbortFlag, ExtractError, FrameExtractor};

/// Behaviour for one file (matched by file name).
#[derive(Debug, Clone)]
pub struct Script {
    pub duration_secs: f64,
    /// Added to every extract call
    pub delay: Duration,
    /// Extract calls at these offsets stall until aborted (or 5s)
    pub stall_offsets: Vec<f64>,
    pub fail: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            duration_secs: 60.0,
            delay: Duration::ZERO,
            stall_offsets: Vec::new(),
            fail: false,
        }
    }
}

#[derive(Default)]
pub struct FakeExtractor {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<Vec<(PathBuf, f64)>>,
    probes: AtomicUsize,
    aborted: AtomicUsize,
}

impl FakeExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, file_name: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .insert(file_name.to_string(), script);
    }

    /// Every extract call in arrival order: (path, offset)
    pub fn calls(&self) -> Vec<(PathBuf, f64)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn offsets(&self) -> Vec<f64> {
        self.calls().into_iter().map(|(_, o)| o).collect()
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    /// Stalled calls that observed their abort flag
    pub fn aborted_count(&self) -> usize {
        self.aborted.load(Ordering::SeqCst)
    }

    fn script_for(&self, path: &Path) -> Script {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.scripts
            .lock()
            .unwrap()
            .get(&name)
            .cloned()
            .unwrap_or_default()
    }
}

impl FrameExtractor for FakeExtractor {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn extract_frame(
        &self,
        path: &Path,
        offset_secs: f64,
        max_size: ThumbSize,
        abort: &AbortFlag,
    ) -> Result<RgbaImage, ExtractError> {
        self.calls
            .lock()
            .unwrap()
            .push((path.to_path_buf(), offset_secs));
        let script = self.script_for(path);

        if script
            .stall_offsets
            .iter()
            .any(|o| (o - offset_secs).abs() < 1e-9)
        {
            let until = Instant::now() + Duration::from_secs(5);
            while Instant::now() < until {
                if abort.is_aborted() {
                    self.aborted.fetch_add(1, Ordering::SeqCst);
                    return Err(ExtractError::Aborted);
                }
                thread::sleep(Duration::from_millis(2));
            }
        }
        if !script.delay.is_zero() {
            thread::sleep(script.delay);
        }
        if script.fail {
            return Err(ExtractError::Decode("scripted failure".into()));
        }
        let (w, h) = max_size.fit(64, 36);
        Ok(RgbaImage::from_pixel(w, h, Rgba([(offset_secs * 10.0) as u8, 0, 0, 255])))
    }

    fn probe(&self, path: &Path, _abort: &AbortFlag) -> Result<VideoProbe, ExtractError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let script = self.script_for(path);
        if script.fail {
            return Err(ExtractError::Open("scripted failure".into()));
        }
        Ok(VideoProbe {
            duration_secs: script.duration_secs,
            width: 64,
            height: 36,
            fps: 25.0,
        })
    }
}
