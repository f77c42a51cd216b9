//! Folder load pipeline: scan, list, then fill in metadata and thumbnails
//!
//! **Why**: Listing must appear at once while the expensive per-file work
//! trickles in for whatever is on screen. Switching folders must not let
//! the previous folder's late results leak into the new listing.
//!
//! **Used by**: CLI (headless consumer); any UI front end
//!
//! # Generations
//!
//! Every `load_folder`, `refresh`, `cancel_active_load` and `close` bumps the
//! generation counter (shared as the scan pool's epoch) and cancels every
//! request the previous generation still tracks. Each callback carries the
//! generation it was issued under and is dropped unless it still matches
//! when it gets the state lock.
//!
//! # Phases
//!
//! ```text
//! Idle -> Scanning -> Populated -> Refreshing -> Populated
//!            |            any -> Cancelled
//!            +-> Failed   any -> Idle (close)
//! ```
//!
//! Lock order: folder state, then engine (coordinator, store). Callbacks run
//! on the engine's delivery threads, never under an engine lock.

use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, info, trace, warn};

use crate::config::FolderConfig;
use crate::core::coordinator::RequestHandle;
use crate::core::engine::Engine;
use crate::core::generator::primary_offset;
use crate::core::workers::Workers;
use crate::entities::{Outcome, Priority, Thumbnail, Unavailable, VideoMetadata};
use crate::utils::scan::{FileEntry, Listing, ScanOptions, scan_dir};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Scanning,
    Populated,
    /// Rescanning; the previous list stays until the new one lands
    Refreshing,
    Cancelled,
    Failed,
}

/// Per-item progress of one kind of work
#[derive(Debug, Clone)]
pub enum ItemState<T> {
    NotRequested,
    Loading,
    Available(T),
    Unavailable(Unavailable),
}

impl<T> ItemState<T> {
    /// Nothing more will happen without a new generation
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            ItemState::Available(_)
                | ItemState::Unavailable(Unavailable::Failed | Unavailable::Closed)
        )
    }

    /// Not asked yet, or refused for load reasons; ask on the next pass
    fn needs_request(&self) -> bool {
        matches!(
            self,
            ItemState::NotRequested
                | ItemState::Unavailable(Unavailable::Busy | Unavailable::Expired)
        )
    }
}

impl<T> From<Outcome<T>> for ItemState<T> {
    fn from(outcome: Outcome<T>) -> Self {
        match outcome {
            Outcome::Available(v) => ItemState::Available(v),
            Outcome::Unavailable(reason) => ItemState::Unavailable(reason),
        }
    }
}

/// Progress notifications, tagged with the generation that produced them
#[derive(Debug, Clone)]
pub enum FolderEvent {
    Listed {
        generation: u64,
        files: Vec<FileEntry>,
        truncated_from: Option<usize>,
    },
    Metadata {
        generation: u64,
        index: usize,
        outcome: Outcome<VideoMetadata>,
    },
    Thumbnail {
        generation: u64,
        index: usize,
        outcome: Outcome<Thumbnail>,
    },
    Failed {
        generation: u64,
        error: String,
    },
}

impl FolderEvent {
    pub fn generation(&self) -> u64 {
        match self {
            FolderEvent::Listed { generation, .. }
            | FolderEvent::Metadata { generation, .. }
            | FolderEvent::Thumbnail { generation, .. }
            | FolderEvent::Failed { generation, .. } => *generation,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ItemSnapshot {
    pub entry: FileEntry,
    pub metadata: ItemState<VideoMetadata>,
    pub thumbnail: ItemState<Thumbnail>,
}

impl ItemSnapshot {
    pub fn is_final(&self) -> bool {
        self.metadata.is_final() && self.thumbnail.is_final()
    }
}

#[derive(Debug, Clone)]
pub struct FolderSnapshot {
    pub folder: Option<PathBuf>,
    pub phase: Phase,
    pub generation: u64,
    pub items: Vec<ItemSnapshot>,
    pub truncated_from: Option<usize>,
    pub visible: Range<usize>,
}

impl FolderSnapshot {
    /// Visible items still waiting for something
    pub fn pending_visible(&self) -> usize {
        let end = self.visible.end.min(self.items.len());
        let start = self.visible.start.min(end);
        self.items[start..end].iter().filter(|i| !i.is_final()).count()
    }
}

/// Outstanding request for one item. The ticket tells a late callback from
/// the current one after a scroll-out and back in.
struct Tracked {
    handle: RequestHandle,
    ticket: u64,
}

struct Item {
    entry: FileEntry,
    metadata: ItemState<VideoMetadata>,
    thumbnail: ItemState<Thumbnail>,
    metadata_req: Option<Tracked>,
    thumbnail_req: Option<Tracked>,
}

impl Item {
    fn new(entry: FileEntry) -> Self {
        Self {
            entry,
            metadata: ItemState::NotRequested,
            thumbnail: ItemState::NotRequested,
            metadata_req: None,
            thumbnail_req: None,
        }
    }
}

struct FolderState {
    folder: Option<PathBuf>,
    phase: Phase,
    generation: u64,
    items: Vec<Item>,
    truncated_from: Option<usize>,
    visible: Range<usize>,
    events: Option<Sender<FolderEvent>>,
    next_ticket: u64,
}

impl FolderState {
    fn emit(&self, event: FolderEvent) {
        if let Some(tx) = &self.events {
            // Consumer dropped the receiver: nothing to do
            let _ = tx.send(event);
        }
    }

    fn ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }
}

struct LoaderInner {
    engine: Engine,
    options: ScanOptions,
    state: Mutex<FolderState>,
    /// Mirrors `FolderState::generation`; the scan pool checks it
    epoch: Arc<AtomicU64>,
    scan_pool: Workers,
}

/// Loads one folder at a time and feeds visible items through the engine.
pub struct FolderLoader {
    inner: Arc<LoaderInner>,
}

impl FolderLoader {
    pub fn new(engine: Engine, config: &FolderConfig) -> Self {
        let epoch = Arc::new(AtomicU64::new(0));
        let options = ScanOptions {
            extensions: config.extensions.clone(),
            filter: config.filter.clone(),
            sort: config.sort,
            order: config.order,
            max_files: config.max_files,
        };
        debug!("FolderLoader: {:?}", options);

        Self {
            inner: Arc::new(LoaderInner {
                engine,
                options,
                state: Mutex::new(FolderState {
                    folder: None,
                    phase: Phase::Idle,
                    generation: 0,
                    items: Vec::new(),
                    truncated_from: None,
                    visible: 0..0,
                    events: None,
                    next_ticket: 0,
                }),
                scan_pool: Workers::with_epoch("scan", 1, Arc::clone(&epoch)),
                epoch,
            }),
        }
    }

    /// Start loading `dir`, abandoning whatever was loading before.
    ///
    /// Returns the event stream for this folder; the previous folder's stream
    /// disconnects.
    pub fn load_folder(&self, dir: impl AsRef<Path>) -> Receiver<FolderEvent> {
        let dir = dir.as_ref().to_path_buf();
        let (tx, rx) = unbounded();

        let generation = {
            let mut state = self.inner.lock_state();
            let generation = self.inner.advance(&mut state);
            info!("Loading folder {} (generation {})", dir.display(), generation);
            state.folder = Some(dir.clone());
            state.phase = Phase::Scanning;
            state.items.clear();
            state.truncated_from = None;
            state.visible = 0..0;
            state.events = Some(tx);
            generation
        };

        self.inner.schedule_scan(generation, dir);
        rx
    }

    /// Rescan the current folder. The existing list stays in place (phase
    /// `Refreshing`) until the new listing replaces it. False if no folder.
    pub fn refresh(&self) -> bool {
        let (generation, dir) = {
            let mut state = self.inner.lock_state();
            let Some(dir) = state.folder.clone() else {
                return false;
            };
            let generation = self.inner.advance(&mut state);
            debug!("Refreshing {} (generation {})", dir.display(), generation);
            state.phase = Phase::Refreshing;
            (generation, dir)
        };

        self.inner.schedule_scan(generation, dir);
        true
    }

    /// Stop all work for the current folder. The listing stays readable.
    pub fn cancel_active_load(&self) {
        let mut state = self.inner.lock_state();
        let generation = self.inner.advance(&mut state);
        state.phase = Phase::Cancelled;
        debug!("Cancelled active load (generation {})", generation);
    }

    /// Forget the current folder entirely.
    pub fn close(&self) {
        let mut state = self.inner.lock_state();
        self.inner.advance(&mut state);
        state.phase = Phase::Idle;
        state.folder = None;
        state.items.clear();
        state.truncated_from = None;
        state.visible = 0..0;
        state.events = None;
    }

    /// Mark `range` as on screen. Items leaving it have their outstanding
    /// requests cancelled; items in it that still need work are requested.
    /// Before the listing lands the range is remembered and applied then.
    pub fn set_visible(&self, range: Range<usize>) {
        let mut state = self.inner.lock_state();
        state.visible = range;
        if state.phase == Phase::Populated {
            self.inner.apply_visible(&mut state);
        }
    }

    pub fn snapshot(&self) -> FolderSnapshot {
        let state = self.inner.lock_state();
        FolderSnapshot {
            folder: state.folder.clone(),
            phase: state.phase,
            generation: state.generation,
            items: state
                .items
                .iter()
                .map(|item| ItemSnapshot {
                    entry: item.entry.clone(),
                    metadata: item.metadata.clone(),
                    thumbnail: item.thumbnail.clone(),
                })
                .collect(),
            truncated_from: state.truncated_from,
            visible: state.visible.clone(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.inner.lock_state().phase
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock_state().generation
    }

    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }
}

impl Drop for FolderLoader {
    fn drop(&mut self) {
        // Outstanding callbacks only hold weak refs, cancel them so the
        // engine doesn't keep working for a loader that is gone
        let mut state = self.inner.lock_state();
        self.inner.advance(&mut state);
    }
}

impl LoaderInner {
    fn lock_state(&self) -> MutexGuard<'_, FolderState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// New generation: cancel everything tracked, reset in-progress items.
    fn advance(&self, state: &mut FolderState) -> u64 {
        let mut cancelled = 0;
        for item in &mut state.items {
            cancelled += self.release(item);
        }
        state.generation += 1;
        self.epoch.store(state.generation, Ordering::Release);
        if cancelled > 0 {
            debug!(
                "Generation {}: cancelled {} outstanding requests",
                state.generation, cancelled
            );
        }
        state.generation
    }

    /// Cancel an item's outstanding requests; `Loading` reverts to
    /// `NotRequested`. Returns the number of requests cancelled.
    fn release(&self, item: &mut Item) -> usize {
        let mut cancelled = 0;
        if let Some(tracked) = item.metadata_req.take() {
            if self.engine.cancel(&tracked.handle) {
                cancelled += 1;
            }
        }
        if let Some(tracked) = item.thumbnail_req.take() {
            if self.engine.cancel(&tracked.handle) {
                cancelled += 1;
            }
        }
        if matches!(item.metadata, ItemState::Loading) {
            item.metadata = ItemState::NotRequested;
        }
        if matches!(item.thumbnail, ItemState::Loading) {
            item.thumbnail = ItemState::NotRequested;
        }
        cancelled
    }

    fn schedule_scan(self: &Arc<Self>, generation: u64, dir: PathBuf) {
        let weak = Arc::downgrade(self);
        self.scan_pool.execute_with_epoch(generation, move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let result = scan_dir(&dir, &inner.options);
            inner.finish_scan(generation, &dir, result);
        });
    }

    fn finish_scan(
        self: &Arc<Self>,
        generation: u64,
        dir: &Path,
        result: Result<Listing, crate::utils::scan::ScanError>,
    ) {
        let mut state = self.lock_state();
        if state.generation != generation {
            trace!("Dropping stale scan of {} (generation {})", dir.display(), generation);
            return;
        }

        match result {
            Ok(listing) => {
                info!(
                    "Listed {}: {} files{}",
                    dir.display(),
                    listing.files.len(),
                    listing
                        .truncated_from
                        .map(|n| format!(" (capped from {})", n))
                        .unwrap_or_default()
                );
                state.items = listing.files.iter().cloned().map(Item::new).collect();
                state.truncated_from = listing.truncated_from;
                state.phase = Phase::Populated;
                state.emit(FolderEvent::Listed {
                    generation,
                    files: listing.files,
                    truncated_from: listing.truncated_from,
                });
                self.apply_visible(&mut state);
            }
            Err(e) => {
                warn!("Folder load failed: {}", e);
                state.items.clear();
                state.truncated_from = None;
                state.phase = Phase::Failed;
                state.emit(FolderEvent::Failed {
                    generation,
                    error: e.to_string(),
                });
            }
        }
    }

    fn apply_visible(self: &Arc<Self>, state: &mut FolderState) {
        let len = state.items.len();
        let visible = state.visible.start.min(len)..state.visible.end.min(len);

        // Scrolled out: stop paying for it
        let mut released = 0;
        for (index, item) in state.items.iter_mut().enumerate() {
            if !visible.contains(&index) && (item.metadata_req.is_some() || item.thumbnail_req.is_some()) {
                released += self.release(item);
            }
        }
        if released > 0 {
            trace!("Cancelled {} requests for items out of view", released);
        }

        for index in visible {
            self.request_item(state, index);
        }
    }

    /// Issue whatever the item needs next: metadata first, thumbnail once the
    /// duration is known.
    fn request_item(self: &Arc<Self>, state: &mut FolderState, index: usize) {
        let generation = state.generation;
        let ticket = state.ticket();
        let Some(item) = state.items.get_mut(index) else {
            return;
        };

        if item.metadata.needs_request() {
            let weak = Arc::downgrade(self);
            let handle = self.engine.request_metadata(&item.entry.id, Priority::High, move |outcome| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_metadata(generation, index, ticket, outcome);
                }
            });
            item.metadata = ItemState::Loading;
            item.metadata_req = Some(Tracked { handle, ticket });
            return;
        }

        let duration = match &item.metadata {
            ItemState::Available(meta) => meta.duration(),
            ItemState::Unavailable(Unavailable::Failed) => None,
            _ => return,
        };
        if item.thumbnail.needs_request() {
            let weak = Arc::downgrade(self);
            let handle = self.engine.request_thumbnail(
                &item.entry.id,
                primary_offset(duration),
                Priority::Normal,
                move |outcome| {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_thumbnail(generation, index, ticket, outcome);
                    }
                },
            );
            item.thumbnail = ItemState::Loading;
            item.thumbnail_req = Some(Tracked { handle, ticket });
        }
    }

    fn on_metadata(self: &Arc<Self>, generation: u64, index: usize, ticket: u64, outcome: Outcome<VideoMetadata>) {
        let mut state = self.lock_state();
        if state.generation != generation {
            trace!("Dropping stale metadata for item {} (generation {})", index, generation);
            return;
        }
        let Some(item) = state.items.get_mut(index) else {
            return;
        };
        if item.metadata_req.as_ref().map(|t| t.ticket) != Some(ticket) {
            trace!("Dropping superseded metadata for item {}", index);
            return;
        }
        item.metadata_req = None;
        item.metadata = ItemState::from(outcome.clone());
        // Refused (busy/expired) waits for the next visibility pass
        let settled = item.metadata.is_final();

        state.emit(FolderEvent::Metadata {
            generation,
            index,
            outcome,
        });
        if settled && state.visible.contains(&index) {
            self.request_item(&mut state, index);
        }
    }

    fn on_thumbnail(&self, generation: u64, index: usize, ticket: u64, outcome: Outcome<Thumbnail>) {
        let mut state = self.lock_state();
        if state.generation != generation {
            trace!("Dropping stale thumbnail for item {} (generation {})", index, generation);
            return;
        }
        let Some(item) = state.items.get_mut(index) else {
            return;
        };
        if item.thumbnail_req.as_ref().map(|t| t.ticket) != Some(ticket) {
            trace!("Dropping superseded thumbnail for item {}", index);
            return;
        }
        item.thumbnail_req = None;
        item.thumbnail = ItemState::from(outcome.clone());

        state.emit(FolderEvent::Thumbnail {
            generation,
            index,
            outcome,
        });
    }
}
