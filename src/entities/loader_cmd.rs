//! Frame extractor driving the `ffmpeg` / `ffprobe` command-line tools
//!
//! Default backend: needs nothing at build time, only the tools on PATH (or
//! explicit binary paths). The child process is killed as soon as the caller
//! raises the abort flag, so a timed-out extraction doesn't keep decoding.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use image::RgbaImage;
use log::{debug, trace};
use serde::Deserialize;

use super::media::{ThumbSize, VideoProbe};
use super::traits::{AbortFlag, ExtractError, FrameExtractor};

/// Poll interval while waiting on a child process
const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct CommandExtractor {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl Default for CommandExtractor {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
        }
    }
}

impl CommandExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binaries(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    fn frame_args(path: &Path, offset_secs: f64, max_size: ThumbSize) -> Vec<String> {
        let scale = format!(
            "scale=w='min({},iw)':h='min({},ih)':force_original_aspect_ratio=decrease",
            max_size.max_width.max(1),
            max_size.max_height.max(1)
        );
        vec![
            "-v".into(),
            "error".into(),
            // Input seeking: jumps to the nearest keyframe, cheap on long files
            "-ss".into(),
            format!("{:.3}", offset_secs.max(0.0)),
            "-i".into(),
            path.to_string_lossy().into_owned(),
            "-frames:v".into(),
            "1".into(),
            "-vf".into(),
            scale,
            "-f".into(),
            "image2pipe".into(),
            "-vcodec".into(),
            "png".into(),
            "pipe:1".into(),
        ]
    }

    fn probe_args(path: &Path) -> Vec<String> {
        vec![
            "-v".into(),
            "error".into(),
            "-select_streams".into(),
            "v:0".into(),
            "-show_entries".into(),
            "stream=width,height,avg_frame_rate,duration:format=duration".into(),
            "-of".into(),
            "json".into(),
            path.to_string_lossy().into_owned(),
        ]
    }
}

impl FrameExtractor for CommandExtractor {
    fn name(&self) -> &'static str {
        "ffmpeg-cli"
    }

    fn extract_frame(
        &self,
        path: &Path,
        offset_secs: f64,
        max_size: ThumbSize,
        abort: &AbortFlag,
    ) -> Result<RgbaImage, ExtractError> {
        let child = Command::new(&self.ffmpeg)
            .args(Self::frame_args(path, offset_secs, max_size))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ExtractError::Tool(format!("{}: {}", self.ffmpeg.display(), e)))?;

        let output = run_until_done(child, abort)?;
        if !output.status.success() {
            return Err(ExtractError::Decode(output.last_error_line()));
        }
        if output.stdout.is_empty() {
            // ffmpeg exits cleanly when the seek lands past the last frame
            return Err(ExtractError::FrameNotFound(offset_secs));
        }

        let decoded = image::load_from_memory_with_format(&output.stdout, image::ImageFormat::Png)
            .map_err(|e| ExtractError::Decode(format!("PNG from ffmpeg: {}", e)))?
            .to_rgba8();

        // ffmpeg already scaled; guard against filters that ignored the box
        let (w, h) = max_size.fit(decoded.width(), decoded.height());
        if (w, h) != decoded.dimensions() {
            return Ok(image::imageops::thumbnail(&decoded, w, h));
        }
        trace!(
            "ffmpeg frame {}x{} from {} @ {:.1}s",
            w,
            h,
            path.display(),
            offset_secs
        );
        Ok(decoded)
    }

    fn probe(&self, path: &Path, abort: &AbortFlag) -> Result<VideoProbe, ExtractError> {
        let child = Command::new(&self.ffprobe)
            .args(Self::probe_args(path))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ExtractError::Tool(format!("{}: {}", self.ffprobe.display(), e)))?;

        let output = run_until_done(child, abort)?;
        if !output.status.success() {
            return Err(ExtractError::Open(output.last_error_line()));
        }
        parse_probe(&output.stdout)
    }
}

struct ChildOutput {
    status: ExitStatus,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl ChildOutput {
    fn last_error_line(&self) -> String {
        String::from_utf8_lossy(&self.stderr)
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("unknown error")
            .to_string()
    }
}

/// Wait for `child`, draining its pipes on helper threads so a full pipe
/// can't stall it. Kills the child when `abort` is raised.
fn run_until_done(mut child: Child, abort: &AbortFlag) -> Result<ChildOutput, ExtractError> {
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let status = loop {
        if abort.is_aborted() {
            debug!("Killing extractor process {} (aborted)", child.id());
            let _ = child.kill();
            let _ = child.wait();
            return Err(ExtractError::Aborted);
        }
        match child.try_wait()? {
            Some(status) => break status,
            None => thread::sleep(POLL_INTERVAL),
        }
    };

    let collect = |h: Option<thread::JoinHandle<Vec<u8>>>| {
        h.and_then(|h| h.join().ok()).unwrap_or_default()
    };
    Ok(ChildOutput {
        status,
        stdout: collect(stdout),
        stderr: collect(stderr),
    })
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Parse `ffprobe -of json` output. Stream duration wins over container
/// duration; either may be missing (e.g. live-style MKV).
fn parse_probe(json: &[u8]) -> Result<VideoProbe, ExtractError> {
    let parsed: ProbeOutput = serde_json::from_slice(json)
        .map_err(|e| ExtractError::Decode(format!("ffprobe output: {}", e)))?;
    let stream = parsed
        .streams
        .into_iter()
        .next()
        .ok_or(ExtractError::NoVideoStream)?;

    let parse_secs = |s: &Option<String>| s.as_deref().and_then(|v| v.parse::<f64>().ok());
    let duration_secs = parse_secs(&stream.duration)
        .or_else(|| parsed.format.as_ref().and_then(|f| parse_secs(&f.duration)))
        .filter(|d| d.is_finite() && *d > 0.0)
        .unwrap_or(0.0);

    Ok(VideoProbe {
        duration_secs,
        width: stream.width.unwrap_or(0),
        height: stream.height.unwrap_or(0),
        fps: stream
            .avg_frame_rate
            .as_deref()
            .map(parse_rate)
            .unwrap_or(0.0),
    })
}

/// "30000/1001" → 29.97; "0/0" → 0.0
fn parse_rate(rate: &str) -> f64 {
    match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().unwrap_or(0.0);
            let den: f64 = den.trim().parse().unwrap_or(0.0);
            if den > 0.0 { num / den } else { 0.0 }
        }
        None => rate.trim().parse().unwrap_or(0.0),
    }
}
