//! Per-thread state: the micro-cache and the error queue.
//!
//! Each thread keeps the last tile and last file it touched, so tight
//! loops over the same tile never take a shard lock. The held [`TileRef`]
//! pins that one tile; it is released when a different tile replaces it,
//! when an invalidation epoch passes, or when the thread state is dropped.
//!
//! A `Perthread` must never be shared between threads. Callers may own
//! one explicitly (and pass it to the `*_with` API variants) or let the
//! cache manage one per thread in thread-local storage.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};

use crate::file::FileId;
use crate::tile::{TileKey, TileRef};

/// Cap on queued error messages per thread; beyond this, the oldest are
/// discarded.
const MAX_QUEUED_ERRORS: usize = 64;

#[derive(Default)]
pub struct Perthread {
    /// Last filename resolution, bypassing the file index.
    last_file: Option<(String, FileId)>,
    /// Last tile touched, with a held reference.
    last_tile: Option<(TileKey, TileRef)>,
    /// Invalidation epoch the cached entries belong to.
    epoch: u64,
    errors: VecDeque<String>,
}

impl Perthread {
    pub fn new() -> Perthread {
        Perthread::default()
    }

    /// Drop cached entries that predate `epoch` (an invalidation happened).
    pub(crate) fn check_epoch(&mut self, epoch: u64) {
        if self.epoch != epoch {
            self.last_file = None;
            self.last_tile = None;
            self.epoch = epoch;
        }
    }

    pub(crate) fn lookup_file(&self, name: &str) -> Option<FileId> {
        match &self.last_file {
            Some((n, id)) if n == name => Some(*id),
            _ => None,
        }
    }

    pub(crate) fn remember_file(&mut self, name: &str, id: FileId) {
        self.last_file = Some((name.to_string(), id));
    }

    pub(crate) fn lookup_tile(&self, key: &TileKey) -> Option<TileRef> {
        match &self.last_tile {
            Some((k, r)) if k == key && r.is_valid() => Some(r.clone()),
            _ => None,
        }
    }

    pub(crate) fn remember_tile(&mut self, tile: TileRef) {
        self.last_tile = Some((*tile.key(), tile));
    }

    /// Release the held tile reference (e.g. before tearing down a cache).
    pub fn release(&mut self) {
        self.last_tile = None;
        self.last_file = None;
    }

    // -------------------------------------------------------------------------
    // Error queue
    // -------------------------------------------------------------------------

    pub(crate) fn report_error(&mut self, message: String) {
        if self.errors.len() >= MAX_QUEUED_ERRORS {
            self.errors.pop_front();
        }
        self.errors.push_back(message);
    }

    pub fn has_error(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Pending error text, oldest first, one message per line. Clears the
    /// queue when `clear` is set.
    pub fn geterror(&mut self, clear: bool) -> String {
        let text = self
            .errors
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join("\n");
        if clear {
            self.errors.clear();
        }
        text
    }
}

// =============================================================================
// Managed thread-local state
// =============================================================================

thread_local! {
    /// Per-cache-instance thread state for callers that do not manage
    /// their own `Perthread`.
    static MANAGED: RefCell<HashMap<u64, Perthread>> = RefCell::new(HashMap::new());
}

/// Run `f` with this thread's managed state for cache instance `cache_id`.
pub(crate) fn with_managed<R>(cache_id: u64, f: impl FnOnce(&mut Perthread) -> R) -> R {
    MANAGED.with(|cell| {
        let mut map = cell.borrow_mut();
        f(map.entry(cache_id).or_default())
    })
}

/// Drop this thread's managed state for a cache instance (on teardown).
pub(crate) fn drop_managed(cache_id: u64) {
    MANAGED.with(|cell| {
        cell.borrow_mut().remove(&cache_id);
    });
}
