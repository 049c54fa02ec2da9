//! Per-paste pull progress.

use dashmap::DashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use sync_core::ChunkBitmap;
use sync_types::PasteId;

/// Completion state of one transfer, shared by its chunk tasks.
#[derive(Debug)]
pub struct ProgressEntry {
    bitmap: Mutex<ChunkBitmap>,
}

impl ProgressEntry {
    fn new(bitmap: ChunkBitmap) -> Self {
        Self {
            bitmap: Mutex::new(bitmap),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChunkBitmap> {
        self.bitmap.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a finished chunk. Out-of-range and duplicate indices are
    /// ignored and return `false`.
    pub fn mark_done(&self, index: usize) -> bool {
        self.lock().mark_done(index)
    }

    /// Done chunks over total chunks.
    pub fn progress(&self) -> f64 {
        self.lock().progress()
    }

    /// Copy of the current bitmap.
    pub fn snapshot(&self) -> ChunkBitmap {
        self.lock().clone()
    }
}

/// Registry of in-flight transfers.
#[derive(Debug, Default)]
pub struct PullProgress {
    entries: DashMap<PasteId, Arc<ProgressEntry>>,
}

impl PullProgress {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `paste_id` from `bitmap`, replacing any earlier entry.
    pub fn track(&self, paste_id: PasteId, bitmap: ChunkBitmap) -> Arc<ProgressEntry> {
        let entry = Arc::new(ProgressEntry::new(bitmap));
        self.entries.insert(paste_id, Arc::clone(&entry));
        entry
    }

    /// Like [`PullProgress::track`], but the entry is removed again when
    /// the returned guard drops unless [`TrackGuard::keep`] is called.
    pub fn track_guarded(&self, paste_id: PasteId, bitmap: ChunkBitmap) -> TrackGuard<'_> {
        TrackGuard {
            progress: self,
            paste_id,
            entry: self.track(paste_id, bitmap),
            armed: true,
        }
    }

    /// Entry for `paste_id`.
    pub fn get(&self, paste_id: PasteId) -> Option<Arc<ProgressEntry>> {
        self.entries.get(&paste_id).map(|e| Arc::clone(e.value()))
    }

    /// Progress of `paste_id`, if tracked.
    pub fn progress(&self, paste_id: PasteId) -> Option<f64> {
        self.get(paste_id).map(|entry| entry.progress())
    }

    /// Stop tracking `paste_id`.
    pub fn remove(&self, paste_id: PasteId) {
        self.entries.remove(&paste_id);
    }
}

/// Tracking that ends with the attempt unless kept.
///
/// Only removes its own entry; a newer entry for the same paste stays.
pub struct TrackGuard<'a> {
    progress: &'a PullProgress,
    paste_id: PasteId,
    entry: Arc<ProgressEntry>,
    armed: bool,
}

impl TrackGuard<'_> {
    /// The tracked entry.
    pub fn entry(&self) -> &Arc<ProgressEntry> {
        &self.entry
    }

    /// Leave the entry registered after the guard drops.
    pub fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for TrackGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let entry = &self.entry;
            self.progress
                .entries
                .remove_if(&self.paste_id, |_, current| Arc::ptr_eq(current, entry));
        }
    }
}
