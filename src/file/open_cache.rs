//! The bounded set of currently open decoders.
//!
//! Opening a file is expensive, so decoders stay open after a read and are
//! closed least-recently-used-first when the count exceeds
//! `max_open_files`. A file whose decoder lock is held (a read in
//! progress) is skipped, so the cap can be transiently exceeded; strict
//! mode re-enforces after the read completes.
//!
//! Closing a decoder never discards the file's metadata or cached tiles.

use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use crate::stats::CacheStats;

use super::{FileId, FileIndex};

pub struct OpenFileCache {
    /// Recency order of open files; most recent first.
    lru: Mutex<LruCache<FileId, ()>>,
}

impl Default for OpenFileCache {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenFileCache {
    pub fn new() -> OpenFileCache {
        OpenFileCache {
            lru: Mutex::new(LruCache::unbounded()),
        }
    }

    /// Record that `id` is open and was just used.
    pub fn touch(&self, id: FileId) {
        self.lru.lock().put(id, ());
    }

    /// Record that `id` was closed outside the eviction path (invalidate
    /// or an explicit close).
    pub fn forget(&self, id: FileId) {
        self.lru.lock().pop(&id);
    }

    pub fn len(&self) -> usize {
        self.lru.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lru.lock().is_empty()
    }

    /// Close least-recently-used decoders until at most `cap` remain.
    /// Files whose decoder lock is contended are skipped; if a whole pass
    /// makes no progress, the overage is left standing.
    pub fn enforce(&self, index: &FileIndex, cap: usize, stats: &CacheStats) {
        loop {
            // Snapshot in LRU-first order; do not hold the list lock while
            // taking per-file locks.
            let candidates: Vec<FileId> = {
                let lru = self.lru.lock();
                if lru.len() <= cap {
                    return;
                }
                lru.iter().rev().map(|(id, _)| *id).collect()
            };
            let mut progressed = false;
            for id in candidates {
                if self.len() <= cap {
                    return;
                }
                let Some(rec) = index.get(id) else {
                    // Stale entry for a removed record.
                    self.forget(id);
                    progressed = true;
                    continue;
                };
                let Some(mut slot) = rec.decoder.try_lock() else {
                    continue; // mid-read; skip
                };
                if slot.take().is_some() {
                    stats.note_file_closed();
                    debug!(file = %id, name = rec.name(), "closed decoder (open-file cap)");
                }
                drop(slot);
                self.forget(id);
                progressed = true;
            }
            if !progressed {
                return;
            }
        }
    }

    /// Close every decoder not currently mid-read.
    pub fn close_all(&self, index: &FileIndex, stats: &CacheStats) {
        self.enforce(index, 0, stats);
    }
}
