//! The sharded tile store with second-chance eviction.
//!
//! The tile map is partitioned by key hash into independent shards, each
//! with its own lock and clock hand, so concurrent lookups from many
//! threads rarely contend. Resident-byte accounting is global (a single
//! atomic), because the memory budget is global.
//!
//! # Eviction
//!
//! Insertion charges the new tile against the budget and then sweeps:
//! starting at the inserting shard and proceeding round-robin, the clock
//! hand walks each shard's ring. A tile with its used bit set gets a
//! second chance (the bit is cleared); a tile with the bit clear and no
//! pins is evicted. A full pass over every shard that frees nothing ends
//! the sweep, leaving the budget transiently exceeded rather than spinning
//! or evicting pinned tiles.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::file::FileId;
use crate::stats::{CacheStats, TimeGuard};

use super::{Tile, TileKey, TileRef};

/// Upper bound on shard count; beyond this, extra shards stop paying for
/// themselves.
const MAX_SHARDS: usize = 64;

struct Shard {
    map: HashMap<TileKey, Arc<Tile>>,
    /// Clock ring of keys. Entries may be stale (key no longer mapped);
    /// the hand discards those as it encounters them.
    ring: Vec<TileKey>,
    hand: usize,
}

impl Shard {
    fn new() -> Shard {
        Shard {
            map: HashMap::new(),
            ring: Vec::new(),
            hand: 0,
        }
    }
}

pub struct TileCache {
    shards: Box<[Mutex<Shard>]>,
    /// Bytes of resident tiles, across all shards.
    mem_used: AtomicU64,
    /// Byte budget; a soft ceiling.
    budget: AtomicU64,
    /// Round-robin start hint for sweeps not tied to an insertion.
    sweep_start: AtomicUsize,
    stats: Arc<CacheStats>,
}

impl TileCache {
    pub fn new(budget_bytes: u64, stats: Arc<CacheStats>) -> TileCache {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let nshards = (threads * 4).next_power_of_two().min(MAX_SHARDS);
        let shards = (0..nshards)
            .map(|_| Mutex::new(Shard::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        TileCache {
            shards,
            mem_used: AtomicU64::new(0),
            budget: AtomicU64::new(budget_bytes),
            sweep_start: AtomicUsize::new(0),
            stats,
        }
    }

    fn shard_index(&self, key: &TileKey) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) & (self.shards.len() - 1)
    }

    pub fn set_budget(&self, bytes: u64) {
        self.budget.store(bytes, Ordering::Relaxed);
    }

    pub fn mem_used(&self) -> u64 {
        self.mem_used.load(Ordering::Relaxed)
    }

    /// Number of resident tiles.
    pub fn count(&self) -> usize {
        self.shards.iter().map(|s| s.lock().map.len()).sum()
    }

    /// Look up a tile, pinning it on hit and marking it recently used.
    pub fn find(&self, key: &TileKey) -> Option<TileRef> {
        let _t = TimeGuard::new(&self.stats.tile_locking_nanos);
        let shard = self.shards[self.shard_index(key)].lock();
        let tile = shard.map.get(key)?;
        if !tile.is_valid() {
            return None;
        }
        tile.mark_used();
        Some(TileRef::pin(tile))
    }

    /// Insert a tile, then sweep down to budget. If the key is already
    /// present (a concurrent reader won the race), the new tile is
    /// discarded and the resident one returned.
    pub fn insert(&self, tile: Arc<Tile>) -> TileRef {
        let key = *tile.key();
        let idx = self.shard_index(&key);
        let r = {
            let _t = TimeGuard::new(&self.stats.tile_locking_nanos);
            let mut shard = self.shards[idx].lock();
            if let Some(existing) = shard.map.get(&key) {
                if existing.is_valid() {
                    existing.mark_used();
                    return TileRef::pin(existing);
                }
                // Invalidated leftover; replace it.
                shard.map.remove(&key);
            }
            self.mem_used
                .fetch_add(tile.byte_size() as u64, Ordering::Relaxed);
            self.stats.note_tile_created();
            let r = TileRef::pin(&tile);
            shard.ring.push(key);
            shard.map.insert(key, tile);
            r
        };
        self.sweep_from(idx);
        r
    }

    /// Evict cold tiles until resident bytes fit the budget, or until a
    /// full pass finds nothing evictable.
    pub fn trim_to_budget(&self) {
        let start = self.sweep_start.fetch_add(1, Ordering::Relaxed) % self.shards.len();
        self.sweep_from(start);
    }

    fn sweep_from(&self, start: usize) {
        let budget = self.budget.load(Ordering::Relaxed);
        let n = self.shards.len();
        loop {
            if self.mem_used.load(Ordering::Relaxed) <= budget {
                return;
            }
            let mut freed = 0u64;
            let mut cleared = 0usize;
            for i in 0..n {
                if self.mem_used.load(Ordering::Relaxed) <= budget {
                    return;
                }
                let mut shard = self.shards[(start + i) % n].lock();
                let (f, c) = self.sweep_shard(&mut shard, budget);
                freed += f;
                cleared += c;
            }
            if freed == 0 && cleared == 0 {
                // Everything left is pinned; give up and let the budget
                // stay transiently exceeded.
                return;
            }
        }
    }

    /// One clock pass over a shard, at most ring-length steps. Returns
    /// (bytes freed, used bits cleared); a cleared bit makes that tile a
    /// candidate on the next pass.
    fn sweep_shard(&self, shard: &mut Shard, budget: u64) -> (u64, usize) {
        let mut freed = 0u64;
        let mut cleared = 0usize;
        let mut steps = shard.ring.len();
        while steps > 0 && self.mem_used.load(Ordering::Relaxed) > budget {
            steps -= 1;
            if shard.ring.is_empty() {
                break;
            }
            if shard.hand >= shard.ring.len() {
                shard.hand = 0;
            }
            let key = shard.ring[shard.hand];
            let evict = match shard.map.get(&key) {
                None => {
                    // Stale ring entry left behind by an invalidation.
                    shard.ring.swap_remove(shard.hand);
                    continue;
                }
                Some(tile) => {
                    if tile.take_used() {
                        cleared += 1;
                        false
                    } else {
                        tile.pin_count() == 0
                    }
                }
            };
            if evict {
                let tile = shard.map.remove(&key).expect("checked above");
                shard.ring.swap_remove(shard.hand);
                let size = tile.byte_size() as u64;
                self.mem_used.fetch_sub(size, Ordering::Relaxed);
                self.stats.note_tile_dropped();
                freed += size;
                trace!(?key, size, "evicted tile");
            } else {
                shard.hand += 1;
            }
        }
        (freed, cleared)
    }

    /// Drop every tile belonging to `file`, marking them invalid so
    /// outstanding refs and thread-local caches notice. Returns bytes
    /// removed from the accounting (actual storage lives until the last
    /// ref drops).
    pub fn remove_file(&self, file: FileId) -> u64 {
        let mut removed = 0u64;
        for shard in self.shards.iter() {
            let mut shard = shard.lock();
            let doomed: Vec<TileKey> = shard
                .map
                .keys()
                .filter(|k| k.file == file)
                .copied()
                .collect();
            for key in doomed {
                if let Some(tile) = shard.map.remove(&key) {
                    tile.mark_invalid();
                    let size = tile.byte_size() as u64;
                    self.mem_used.fetch_sub(size, Ordering::Relaxed);
                    self.stats.note_tile_dropped();
                    removed += size;
                }
            }
        }
        removed
    }

    /// Drop everything.
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            let mut shard = shard.lock();
            for (_, tile) in shard.map.drain() {
                tile.mark_invalid();
                self.mem_used
                    .fetch_sub(tile.byte_size() as u64, Ordering::Relaxed);
                self.stats.note_tile_dropped();
            }
            shard.ring.clear();
            shard.hand = 0;
        }
    }
}
