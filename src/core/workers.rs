//! Named thread pools for background tasks (generation, delivery, folder scans)
//!
//! Uses a crossbeam MPMC channel with closure-based task execution. Idle
//! workers block in `recv()`, so a pool costs nothing while there is no work.
//! Epoch mechanism skips jobs queued for a folder generation that has since
//! been superseded.

use crossbeam_channel::{Sender, unbounded};
use log::{error, trace};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Worker pool for CPU/IO-bound tasks.
///
/// Workers execute arbitrary closures with captured state (payloads).
/// A panicking job is logged and the worker keeps running.
///
/// # Example
/// ```ignore
/// let workers = Workers::new("thumb-gen", 3);
///
/// workers.execute(move || {
///     let thumb = generator.generate(&path, 2.0, deadline);
/// });
/// ```
pub struct Workers {
    sender: Option<Sender<Job>>,           // None once shutting down
    handles: Vec<thread::JoinHandle<()>>,  // Thread handles for proper shutdown
    current_epoch: Arc<AtomicU64>,         // Epoch counter (shared with the owner)
    name: String,
}

impl Workers {
    /// Create pool with `num_threads` threads named `{name}-{id}` and a
    /// private epoch counter.
    pub fn new(name: &str, num_threads: usize) -> Self {
        Self::with_epoch(name, num_threads, Arc::new(AtomicU64::new(0)))
    }

    /// Create pool with a shared epoch counter.
    ///
    /// # Arguments
    ///
    /// * `name` - Thread name prefix
    /// * `num_threads` - Number of worker threads (min 1)
    /// * `epoch` - Shared epoch counter for cancelling stale requests
    pub fn with_epoch(name: &str, num_threads: usize, epoch: Arc<AtomicU64>) -> Self {
        let num_threads = num_threads.max(1);
        let (tx, rx) = unbounded::<Job>();
        let mut handles = Vec::with_capacity(num_threads);

        for worker_id in 0..num_threads {
            let rx = rx.clone();
            let thread_name = format!("{}-{}", name, worker_id);

            let handle = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || {
                    trace!("Worker {} started", thread_name);

                    // Worker loop: execute closures until channel closes
                    while let Ok(job) = rx.recv() {
                        if catch_unwind(AssertUnwindSafe(job)).is_err() {
                            error!("Job panicked on worker {}", thread_name);
                        }
                    }

                    trace!("Worker {} stopped", thread_name);
                })
                .expect("Failed to spawn worker thread");

            handles.push(handle);
        }

        trace!("Workers '{}' initialized: {} threads", name, num_threads);

        Self {
            sender: Some(tx),
            handles,
            current_epoch: epoch,
            name: name.to_string(),
        }
    }

    /// Execute closure on a worker thread.
    ///
    /// Closure runs asynchronously, no return value.
    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(sender) = &self.sender else {
            error!("Workers '{}' shut down, job dropped", self.name);
            return;
        };
        if let Err(e) = sender.send(Box::new(f)) {
            error!("Failed to enqueue job on '{}': {}", self.name, e);
        }
    }

    /// Get current epoch
    pub fn current_epoch(&self) -> u64 {
        self.current_epoch.load(Ordering::Acquire)
    }

    /// Execute closure only if `epoch` still matches when a worker picks it up.
    ///
    /// The check happens at execution time, not enqueue time, so a job queued
    /// for a folder that was switched away from never starts.
    pub fn execute_with_epoch<F>(&self, epoch: u64, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let current_epoch = Arc::clone(&self.current_epoch);
        let name = self.name.clone();

        self.execute(move || {
            let current = current_epoch.load(Ordering::Acquire);
            if current == epoch {
                f();
            } else {
                trace!("'{}': skipping stale job (epoch {} != {})", name, epoch, current);
            }
        });
    }

    /// Number of worker threads
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        let num_threads = self.handles.len();
        trace!("Workers '{}' shutting down ({} threads)...", self.name, num_threads);

        // Sender drops → channel closes → workers exit recv() loop once drained
        self.sender = None;

        // A pool can be dropped from one of its own jobs, so never block
        // forever: wait up to 500ms, then leave stragglers to finish alone.
        let deadline = Instant::now() + Duration::from_millis(500);
        for handle in std::mem::take(&mut self.handles) {
            while !handle.is_finished() {
                if Instant::now() >= deadline {
                    trace!("Workers '{}': shutdown timeout reached", self.name);
                    return;
                }
                thread::sleep(Duration::from_millis(1));
            }
            let _ = handle.join();
        }

        trace!("Workers '{}': all {} threads stopped", self.name, num_threads);
    }
}
