//! Cache-wide statistics.
//!
//! Counters are plain atomics updated from the hot paths with relaxed
//! ordering; readers take a snapshot. Time counters accumulate nanoseconds
//! and are reported in seconds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug, Default)]
pub struct CacheStats {
    pub find_tile_calls: AtomicU64,
    pub tile_cache_hits: AtomicU64,
    pub microcache_hits: AtomicU64,
    pub tiles_created: AtomicU64,
    pub tiles_current: AtomicU64,
    pub tiles_peak: AtomicU64,
    pub open_files_created: AtomicU64,
    pub open_files_current: AtomicU64,
    pub open_files_peak: AtomicU64,
    pub bytes_read: AtomicU64,
    pub fileio_nanos: AtomicU64,
    pub fileopen_nanos: AtomicU64,
    pub file_locking_nanos: AtomicU64,
    pub tile_locking_nanos: AtomicU64,
    pub find_file_nanos: AtomicU64,
    pub find_tile_nanos: AtomicU64,
}

impl CacheStats {
    pub fn note_tile_created(&self) {
        self.tiles_created.fetch_add(1, Ordering::Relaxed);
        let now = self.tiles_current.fetch_add(1, Ordering::Relaxed) + 1;
        self.tiles_peak.fetch_max(now, Ordering::Relaxed);
    }

    pub fn note_tile_dropped(&self) {
        self.tiles_current.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn note_file_opened(&self) {
        self.open_files_created.fetch_add(1, Ordering::Relaxed);
        let now = self.open_files_current.fetch_add(1, Ordering::Relaxed) + 1;
        self.open_files_peak.fetch_max(now, Ordering::Relaxed);
    }

    pub fn note_file_closed(&self) {
        self.open_files_current.fetch_sub(1, Ordering::Relaxed);
    }

    /// Zero every counter except the `*_current` gauges, which track live
    /// state rather than history.
    pub fn reset(&self) {
        for counter in [
            &self.find_tile_calls,
            &self.tile_cache_hits,
            &self.microcache_hits,
            &self.tiles_created,
            &self.tiles_peak,
            &self.open_files_created,
            &self.open_files_peak,
            &self.bytes_read,
            &self.fileio_nanos,
            &self.fileopen_nanos,
            &self.file_locking_nanos,
            &self.tile_locking_nanos,
            &self.find_file_nanos,
            &self.find_tile_nanos,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.tiles_peak
            .store(self.tiles_current.load(Ordering::Relaxed), Ordering::Relaxed);
        self.open_files_peak.store(
            self.open_files_current.load(Ordering::Relaxed),
            Ordering::Relaxed,
        );
    }

    pub fn seconds(counter: &AtomicU64) -> f32 {
        counter.load(Ordering::Relaxed) as f32 * 1e-9
    }
}

/// Guard that adds elapsed wall time to a nanosecond counter when dropped.
pub struct TimeGuard<'a> {
    counter: &'a AtomicU64,
    start: Instant,
}

impl<'a> TimeGuard<'a> {
    pub fn new(counter: &'a AtomicU64) -> TimeGuard<'a> {
        TimeGuard {
            counter,
            start: Instant::now(),
        }
    }
}

impl Drop for TimeGuard<'_> {
    fn drop(&mut self) {
        self.counter
            .fetch_add(self.start.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }
}
