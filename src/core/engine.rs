//! Engine - thumbnail and metadata services behind one handle
//!
//! **Why**: Consumers need one object to request, cancel and inspect both
//! kinds of work, instead of wiring two coordinators themselves.
//!
//! **Used by**: FolderLoader, CLI
//!
//! Constructed explicitly and passed around (cheap to clone); there is no
//! global instance.

use std::sync::Arc;

use log::info;

use crate::config::EngineConfig;
use crate::core::coordinator::{Coordinator, CoordinatorStats, RequestHandle};
use crate::core::generator::{MetadataProbe, ThumbnailGenerator};
use crate::entities::{
    CacheKey, FileId, FrameExtractor, Outcome, Priority, Thumbnail, VideoMetadata,
};

/// Combined statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub thumbnails: CoordinatorStats,
    pub metadata: CoordinatorStats,
}

#[derive(Clone)]
pub struct Engine {
    thumbnails: Coordinator<CacheKey, Thumbnail>,
    metadata: Coordinator<FileId, VideoMetadata>,
    backend: &'static str,
}

impl Engine {
    pub fn new(config: &EngineConfig, extractor: Arc<dyn FrameExtractor>) -> Self {
        let backend = extractor.name();
        let generator = ThumbnailGenerator::new(Arc::clone(&extractor), config.thumbnails.policy());
        let probe = MetadataProbe::new(extractor, config.metadata.timeout());

        let thumbnails = Coordinator::new("thumb", generator, config.thumbnails.limits());
        let metadata = Coordinator::new("meta", probe, config.metadata.limits());

        info!(
            "Engine ready: backend={}, thumbnail workers={}, metadata workers={}",
            backend,
            thumbnails.limits().max_active,
            metadata.limits().max_active
        );
        Self {
            thumbnails,
            metadata,
            backend,
        }
    }

    /// Request the frame of `file` at `offset_secs` (rounded to 0.1s).
    pub fn request_thumbnail<F>(
        &self,
        file: &FileId,
        offset_secs: f64,
        priority: Priority,
        callback: F,
    ) -> RequestHandle
    where
        F: FnOnce(Outcome<Thumbnail>) + Send + 'static,
    {
        let key = CacheKey::new(file.clone(), offset_secs);
        self.thumbnails.request(key, priority, callback)
    }

    pub fn request_metadata<F>(&self, file: &FileId, priority: Priority, callback: F) -> RequestHandle
    where
        F: FnOnce(Outcome<VideoMetadata>) + Send + 'static,
    {
        self.metadata.request(file.clone(), priority, callback)
    }

    /// Cancel a request made through either service. Returns false if its
    /// callback already ran or was already cancelled.
    pub fn cancel(&self, handle: &RequestHandle) -> bool {
        let revoked = handle.revoke();
        // Ids are process-unique, at most one coordinator knows this one
        if !self.thumbnails.detach(handle, revoked) {
            self.metadata.detach(handle, revoked);
        }
        revoked
    }

    /// Cached thumbnail, without queuing anything
    pub fn cached_thumbnail(&self, file: &FileId, offset_secs: f64) -> Option<Thumbnail> {
        self.thumbnails
            .store()
            .peek(&CacheKey::new(file.clone(), offset_secs))
    }

    pub fn cached_metadata(&self, file: &FileId) -> Option<VideoMetadata> {
        self.metadata.store().peek(file)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            thumbnails: self.thumbnails.stats(),
            metadata: self.metadata.stats(),
        }
    }

    /// Extractor backend name
    pub fn backend(&self) -> &'static str {
        self.backend
    }

    /// Answer everything outstanding with `Closed` and refuse new work.
    pub fn shutdown(&self) {
        self.thumbnails.shutdown();
        self.metadata.shutdown();
        info!("Engine shut down");
    }
}
