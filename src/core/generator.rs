//! Deadline-bounded extraction: one thumbnail or one metadata probe
//!
//! Each attempt runs on its own detached thread so the caller's deadline
//! holds no matter how long the extractor blocks. An attempt that overruns
//! has its [`AbortFlag`] raised and its result thrown away.
//!
//! Offset policy:
//! - primary offset = `max(duration * 2%, 1.0s)`, 1.0s when duration unknown
//! - on timeout or failure, one retry at 1.0s with the shorter retry deadline

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, bounded};
use log::{debug, trace, warn};

use crate::core::coordinator::Producer;
use crate::entities::{
    AbortFlag, CacheKey, ExtractError, FileId, FrameExtractor, ThumbSize, Thumbnail,
    VideoMetadata, VideoProbe,
};

pub const PRIMARY_OFFSET_FRACTION: f64 = 0.02;
pub const MIN_OFFSET_SECS: f64 = 1.0;
pub const FALLBACK_OFFSET_SECS: f64 = 1.0;

/// Warn once this many timed-out attempts are still stuck in the extractor
const ABANDONED_WARN_THRESHOLD: usize = 8;

const RUNNING: u8 = 0;
const FINISHED: u8 = 1;
const ABANDONED: u8 = 2;

static ABANDONED_ATTEMPTS: AtomicUsize = AtomicUsize::new(0);

/// Timed-out attempts whose extraction thread has not returned yet.
pub fn abandoned_attempts() -> usize {
    ABANDONED_ATTEMPTS.load(Ordering::Relaxed)
}

/// Offset of the representative frame for a video of `duration_secs`.
pub fn primary_offset(duration_secs: Option<f64>) -> f64 {
    match duration_secs {
        Some(d) if d.is_finite() && d > 0.0 => (d * PRIMARY_OFFSET_FRACTION).max(MIN_OFFSET_SECS),
        _ => MIN_OFFSET_SECS,
    }
}

/// Result of one deadline-bounded attempt
#[derive(Debug)]
pub enum Attempt<T> {
    Done(T),
    Failed(ExtractError),
    TimedOut,
}

/// Run `job` on a detached thread, waiting at most `deadline` for it.
///
/// On timeout the abort flag is raised and the thread is left to finish on
/// its own; whatever it sends afterwards lands in a dropped channel.
pub fn run_with_deadline<T, F>(label: &str, deadline: Duration, job: F) -> Attempt<T>
where
    T: Send + 'static,
    F: FnOnce(&AbortFlag) -> Result<T, ExtractError> + Send + 'static,
{
    let abort = AbortFlag::new();
    let (tx, rx) = bounded(1);
    let status = Arc::new(AtomicU8::new(RUNNING));

    let thread_abort = abort.clone();
    let thread_status = Arc::clone(&status);
    let spawned = thread::Builder::new()
        .name(format!("extract-{}", label))
        .spawn(move || {
            let result = job(&thread_abort);
            if thread_status.swap(FINISHED, Ordering::AcqRel) == ABANDONED {
                ABANDONED_ATTEMPTS.fetch_sub(1, Ordering::Relaxed);
            }
            // Receiver gone: caller timed out
            let _ = tx.send(result);
        });
    if let Err(e) = spawned {
        return Attempt::Failed(ExtractError::Io(e));
    }

    match rx.recv_timeout(deadline) {
        Ok(Ok(value)) => Attempt::Done(value),
        Ok(Err(e)) => Attempt::Failed(e),
        Err(RecvTimeoutError::Timeout) => {
            abort.abort();
            let abandoned = status
                .compare_exchange(RUNNING, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
            if abandoned {
                let stuck = ABANDONED_ATTEMPTS.fetch_add(1, Ordering::Relaxed) + 1;
                if stuck >= ABANDONED_WARN_THRESHOLD {
                    warn!("{} extraction threads still stuck after their deadline", stuck);
                } else {
                    trace!("{} attempt abandoned ({} stuck)", label, stuck);
                }
            }
            Attempt::TimedOut
        }
        // Job thread died without sending (panic inside the extractor)
        Err(RecvTimeoutError::Disconnected) => {
            Attempt::Failed(ExtractError::Decode("extractor thread panicked".into()))
        }
    }
}

/// Deadlines and sizing for thumbnail generation
#[derive(Debug, Clone)]
pub struct GenerationPolicy {
    pub primary_timeout: Duration,
    pub retry_timeout: Duration,
    pub fallback_offset_secs: f64,
    pub thumb_size: ThumbSize,
}

impl Default for GenerationPolicy {
    fn default() -> Self {
        Self {
            primary_timeout: Duration::from_millis(3000),
            retry_timeout: Duration::from_millis(1500),
            fallback_offset_secs: FALLBACK_OFFSET_SECS,
            thumb_size: ThumbSize::default(),
        }
    }
}

/// Turns a (file, offset) into a thumbnail, with one fallback retry.
#[derive(Clone)]
pub struct ThumbnailGenerator {
    extractor: Arc<dyn FrameExtractor>,
    policy: GenerationPolicy,
}

impl ThumbnailGenerator {
    pub fn new(extractor: Arc<dyn FrameExtractor>, policy: GenerationPolicy) -> Self {
        Self { extractor, policy }
    }

    pub fn policy(&self) -> &GenerationPolicy {
        &self.policy
    }

    /// Extract a frame at `offset_secs` within `deadline`, else retry once at
    /// the fallback offset. `None` when both attempts fail.
    pub fn generate(&self, path: &Path, offset_secs: f64, deadline: Duration) -> Option<Thumbnail> {
        let started = Instant::now();

        match self.attempt(path, offset_secs, deadline) {
            Attempt::Done(thumb) => {
                trace!(
                    "Thumbnail {} @ {:.1}s in {:?}",
                    path.display(),
                    offset_secs,
                    started.elapsed()
                );
                return Some(thumb);
            }
            Attempt::Failed(e) => {
                debug!("Extract {} @ {:.1}s failed: {}", path.display(), offset_secs, e);
            }
            Attempt::TimedOut => {
                debug!(
                    "Extract {} @ {:.1}s timed out after {:?}",
                    path.display(),
                    offset_secs,
                    deadline
                );
            }
        }

        let fallback = self.policy.fallback_offset_secs;
        match self.attempt(path, fallback, self.policy.retry_timeout) {
            Attempt::Done(thumb) => {
                debug!("Thumbnail {} from fallback @ {:.1}s", path.display(), fallback);
                Some(thumb)
            }
            Attempt::Failed(e) => {
                warn!("No thumbnail for {}: {}", path.display(), e);
                None
            }
            Attempt::TimedOut => {
                warn!(
                    "No thumbnail for {}: retry timed out after {:?}",
                    path.display(),
                    self.policy.retry_timeout
                );
                None
            }
        }
    }

    fn attempt(&self, path: &Path, offset_secs: f64, deadline: Duration) -> Attempt<Thumbnail> {
        let extractor = Arc::clone(&self.extractor);
        let path: PathBuf = path.to_path_buf();
        let max_size = self.policy.thumb_size;

        run_with_deadline("thumb", deadline, move |abort| {
            let image = extractor.extract_frame(&path, offset_secs, max_size, abort)?;
            Ok(Thumbnail::new(image, offset_secs))
        })
    }
}

impl Producer<CacheKey, Thumbnail> for ThumbnailGenerator {
    fn produce(&self, key: &CacheKey) -> Option<Thumbnail> {
        self.generate(key.file().path(), key.offset_secs(), self.policy.primary_timeout)
    }
}

/// Reads file size and stream properties for one file.
#[derive(Clone)]
pub struct MetadataProbe {
    extractor: Arc<dyn FrameExtractor>,
    timeout: Duration,
}

impl MetadataProbe {
    pub fn new(extractor: Arc<dyn FrameExtractor>, timeout: Duration) -> Self {
        Self { extractor, timeout }
    }

    /// `None` only when the file itself is gone. A failed or timed-out probe
    /// still yields the size, with zeroed stream fields.
    pub fn probe(&self, file: &FileId) -> Option<VideoMetadata> {
        let size_bytes = match fs::metadata(file.path()) {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!("Cannot stat {}: {}", file, e);
                return None;
            }
        };

        let extractor = Arc::clone(&self.extractor);
        let path = file.path().to_path_buf();
        let probe = match run_with_deadline("probe", self.timeout, move |abort| {
            extractor.probe(&path, abort)
        }) {
            Attempt::Done(probe) => probe,
            Attempt::Failed(e) => {
                debug!("Probe {} failed: {}", file, e);
                VideoProbe::default()
            }
            Attempt::TimedOut => {
                debug!("Probe {} timed out after {:?}", file, self.timeout);
                VideoProbe::default()
            }
        };
        Some(VideoMetadata::new(size_bytes, probe))
    }
}

impl Producer<FileId, VideoMetadata> for MetadataProbe {
    fn produce(&self, key: &FileId) -> Option<VideoMetadata> {
        self.probe(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::testing::{FakeExtractor, Script};
    use std::io::Write;

    fn generator(fake: &Arc<FakeExtractor>, primary_ms: u64, retry_ms: u64) -> ThumbnailGenerator {
        ThumbnailGenerator::new(
            Arc::clone(fake) as Arc<dyn FrameExtractor>,
            GenerationPolicy {
                primary_timeout: Duration::from_millis(primary_ms),
                retry_timeout: Duration::from_millis(retry_ms),
                ..GenerationPolicy::default()
            },
        )
    }

    #[test]
    fn test_primary_offset_policy() {
        assert_eq!(primary_offset(Some(100.0)), 2.0);
        assert_eq!(primary_offset(Some(3600.0)), 72.0);
        // Short clips hit the floor
        assert_eq!(primary_offset(Some(10.0)), 1.0);
        assert_eq!(primary_offset(Some(0.0)), 1.0);
        assert_eq!(primary_offset(Some(f64::NAN)), 1.0);
        assert_eq!(primary_offset(Some(f64::INFINITY)), 1.0);
        assert_eq!(primary_offset(None), 1.0);
    }

    #[test]
    fn test_primary_success_single_call() {
        let fake = Arc::new(FakeExtractor::new());
        let generator = generator(&fake, 1000, 500);

        let offset = primary_offset(Some(100.0));
        let thumb = generator
            .generate(Path::new("/videos/a.mp4"), offset, Duration::from_millis(1000))
            .unwrap();
        assert_eq!(thumb.offset_secs(), 2.0);
        assert_eq!(fake.offsets(), vec![2.0]);
    }

    #[test]
    fn test_timeout_retries_at_fallback() {
        let fake = Arc::new(FakeExtractor::new());
        fake.script(
            "slow.mp4",
            Script {
                duration_secs: 100.0,
                stall_offsets: vec![2.0],
                ..Script::default()
            },
        );
        let generator = generator(&fake, 50, 1000);

        let started = Instant::now();
        let thumb = generator
            .generate(Path::new("/videos/slow.mp4"), 2.0, Duration::from_millis(50))
            .unwrap();
        assert_eq!(thumb.offset_secs(), FALLBACK_OFFSET_SECS);
        assert_eq!(fake.offsets(), vec![2.0, 1.0]);
        assert!(started.elapsed() < Duration::from_secs(2));

        // The abandoned attempt saw its abort flag
        let deadline = Instant::now() + Duration::from_secs(2);
        while fake.aborted_count() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(fake.aborted_count(), 1);
    }

    #[test]
    fn test_abandoned_attempt_is_counted() {
        let (release_tx, release_rx) = bounded::<()>(1);
        let (done_tx, done_rx) = bounded::<()>(1);

        let attempt = run_with_deadline("stuck", Duration::from_millis(20), move |_abort| {
            // Ignores the abort flag, like a blocking open()
            let _ = release_rx.recv_timeout(Duration::from_secs(5));
            let _ = done_tx.send(());
            Ok(())
        });
        assert!(matches!(attempt, Attempt::TimedOut));
        assert!(abandoned_attempts() >= 1);

        release_tx.send(()).unwrap();
        done_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn test_failure_retries_then_gives_up() {
        let fake = Arc::new(FakeExtractor::new());
        fake.script(
            "broken.mp4",
            Script {
                fail: true,
                ..Script::default()
            },
        );
        let generator = generator(&fake, 500, 500);

        let result = generator.generate(Path::new("/videos/broken.mp4"), 5.0, Duration::from_millis(500));
        assert!(result.is_none());
        assert_eq!(fake.offsets(), vec![5.0, 1.0]);
    }

    #[test]
    fn test_both_attempts_time_out() {
        let fake = Arc::new(FakeExtractor::new());
        fake.script(
            "stuck.mp4",
            Script {
                stall_offsets: vec![4.0, 1.0],
                ..Script::default()
            },
        );
        let generator = generator(&fake, 30, 30);

        let started = Instant::now();
        assert!(generator
            .generate(Path::new("/videos/stuck.mp4"), 4.0, Duration::from_millis(30))
            .is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_produce_uses_key_offset() {
        let fake = Arc::new(FakeExtractor::new());
        let generator = generator(&fake, 1000, 500);

        let key = CacheKey::new(FileId::from_raw("/videos/k.mp4"), 7.04);
        let thumb = generator.produce(&key).unwrap();
        assert_eq!(thumb.offset_secs(), 7.0);
        assert_eq!(fake.offsets(), vec![7.0]);
    }

    #[test]
    fn test_metadata_probe_joins_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(&[0u8; 1234]).unwrap();

        let fake = Arc::new(FakeExtractor::new());
        fake.script(
            "clip.mp4",
            Script {
                duration_secs: 42.0,
                ..Script::default()
            },
        );
        let probe = MetadataProbe::new(fake.clone(), Duration::from_millis(500));

        let meta = probe.probe(&FileId::new(&path)).unwrap();
        assert_eq!(meta.size_bytes, 1234);
        assert_eq!(meta.duration(), Some(42.0));
        assert_eq!((meta.width, meta.height), (64, 36));
    }

    #[test]
    fn test_metadata_probe_failure_keeps_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.mkv");
        fs::write(&path, b"not a video").unwrap();

        let fake = Arc::new(FakeExtractor::new());
        fake.script(
            "bad.mkv",
            Script {
                fail: true,
                ..Script::default()
            },
        );
        let probe = MetadataProbe::new(fake, Duration::from_millis(500));

        let meta = probe.probe(&FileId::new(&path)).unwrap();
        assert_eq!(meta.size_bytes, 11);
        assert_eq!(meta.duration(), None);

        assert!(probe.probe(&FileId::new(dir.path().join("missing.mp4"))).is_none());
    }
}
