//! File records and the filename index.
//!
//! A [`FileRecord`] is created lazily the first time a filename is
//! referenced and lives until it is invalidated or the cache is destroyed.
//! Opening (creating the decoder and learning the specs) is separate from
//! existence: a record may be closed and reopened many times while its
//! metadata and cached tiles persist.
//!
//! The [`FileIndex`] owns three maps under one lock: filename → FileId,
//! FileId → record, and content fingerprint → FileId (the dedup table).

pub mod open_cache;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::config::CacheOptions;
use crate::format::{DecoderConfig, DecoderCreator, ImageDecoder, ImageSpec};

// =============================================================================
// FileId
// =============================================================================

/// Stable opaque identifier of a file record. Never reused within a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(u64);

impl FileId {
    pub(crate) fn new(raw: u64) -> FileId {
        debug_assert!(raw != 0);
        FileId(raw)
    }

    fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "file#{}", self.0)
    }
}

// =============================================================================
// Level / Subimage metadata
// =============================================================================

/// One miplevel as the cache sees it: the (native or synthesized) spec
/// plus the tile geometry actually used for caching.
#[derive(Debug, Clone)]
pub struct LevelInfo {
    pub spec: Arc<ImageSpec>,
    /// Tile size on the cached grid. Equals the native tile size for tiled
    /// files; for scanline files it is the autotile-imposed virtual grid
    /// (or the whole image when autotile is off).
    pub tile_width: u32,
    pub tile_height: u32,
    pub tile_depth: u32,
    /// True for miplevels that do not exist in the file and are produced
    /// by downsampling on demand.
    pub synthesized: bool,
}

impl LevelInfo {
    /// Origin of the cached-grid tile containing pixel coordinate `v`
    /// along an axis starting at `begin` with tiles of `size`.
    pub fn tile_floor(v: i32, begin: i32, size: u32) -> i32 {
        let size = size as i32;
        begin + (v - begin).div_euclid(size) * size
    }

    pub fn tile_origin(&self, x: i32, y: i32, z: i32) -> (i32, i32, i32) {
        (
            Self::tile_floor(x, self.spec.x, self.tile_width),
            Self::tile_floor(y, self.spec.y, self.tile_height),
            Self::tile_floor(z, self.spec.z, self.tile_depth),
        )
    }
}

/// One subimage: its miplevel stack, including synthesized levels.
#[derive(Debug, Clone, Default)]
pub struct SubimageInfo {
    pub levels: Vec<LevelInfo>,
}

impl SubimageInfo {
    pub fn nmiplevels(&self) -> u32 {
        self.levels.len() as u32
    }
}

// =============================================================================
// FileRecord
// =============================================================================

/// Metadata learned when a file is first opened.
#[derive(Default)]
pub struct FileState {
    /// Specs have been read; stays true while the decoder is closed.
    pub opened: bool,
    pub mtime: Option<SystemTime>,
    pub file_size: u64,
    pub subimages: Vec<SubimageInfo>,
    /// The file is scanline-organized.
    pub untiled: bool,
    /// The file carries no MIP chain of its own.
    pub unmipped: bool,
    pub fingerprint: Option<Bytes>,
}

/// Per-file I/O statistics.
#[derive(Default)]
pub struct FileIoStats {
    pub times_opened: AtomicU32,
    pub tiles_read: AtomicU64,
    pub bytes_read: AtomicU64,
    pub io_nanos: AtomicU64,
    /// Any synthesized-miplevel tile was produced for this file.
    pub mips_used: AtomicBool,
}

pub struct FileRecord {
    id: FileId,
    /// The name the caller used; the index key.
    name: String,
    /// Resolved on-disk path (equal to `name` for virtual files).
    path: PathBuf,
    creator: Option<DecoderCreator>,
    config: DecoderConfig,
    udim: bool,
    pub state: RwLock<FileState>,
    /// The open decoder, if any. This lock also serializes decoding, so
    /// decoders need no internal synchronization.
    pub decoder: Mutex<Option<Box<dyn ImageDecoder>>>,
    errors: AtomicI32,
    broken: AtomicBool,
    /// Raw id of the record this one duplicates, 0 when none.
    duplicate_of: AtomicU64,
    pub io: FileIoStats,
}

impl FileRecord {
    fn new(
        id: FileId,
        name: String,
        path: PathBuf,
        creator: Option<DecoderCreator>,
        config: DecoderConfig,
    ) -> Arc<FileRecord> {
        let udim = is_udim_pattern(&name);
        Arc::new(FileRecord {
            id,
            name,
            path,
            creator,
            config,
            udim,
            state: RwLock::new(FileState::default()),
            decoder: Mutex::new(None),
            errors: AtomicI32::new(0),
            broken: AtomicBool::new(false),
            duplicate_of: AtomicU64::new(0),
            io: FileIoStats::default(),
        })
    }

    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn creator(&self) -> Option<&DecoderCreator> {
        self.creator.as_ref()
    }

    pub fn decoder_config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn is_udim(&self) -> bool {
        self.udim
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    pub fn mark_broken(&self) {
        self.broken.store(true, Ordering::Release);
    }

    pub fn duplicate_of(&self) -> Option<FileId> {
        match self.duplicate_of.load(Ordering::Acquire) {
            0 => None,
            raw => Some(FileId::new(raw)),
        }
    }

    pub fn set_duplicate_of(&self, id: FileId) {
        self.duplicate_of.store(id.raw(), Ordering::Release);
    }

    pub fn error_count(&self) -> i32 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Count one error; returns true while the per-file cap has not been
    /// hit, meaning the error should still be reported.
    pub fn count_error(&self, max_errors: i32) -> bool {
        let n = self.errors.fetch_add(1, Ordering::Relaxed);
        n < max_errors
    }

    /// Copy of the subimage metadata, or None before first open.
    pub fn subimage(&self, subimage: u32) -> Option<SubimageInfo> {
        let state = self.state.read();
        if !state.opened {
            return None;
        }
        state.subimages.get(subimage as usize).cloned()
    }

    pub fn nsubimages(&self) -> u32 {
        self.state.read().subimages.len() as u32
    }

    /// Reset to the never-opened state, dropping the decoder. Identity
    /// (id, name, path) is preserved so outstanding handles stay usable.
    pub fn reset(&self) {
        *self.decoder.lock() = None;
        *self.state.write() = FileState::default();
        self.errors.store(0, Ordering::Relaxed);
        self.broken.store(false, Ordering::Release);
        self.duplicate_of.store(0, Ordering::Release);
    }
}

/// Recognize multi-file texture atlas patterns that cannot be read as a
/// single image.
pub fn is_udim_pattern(name: &str) -> bool {
    name.contains("<UDIM>")
        || name.contains("<U>")
        || name.contains("<V>")
        || name.contains("%(UDIM)d")
}

// =============================================================================
// FileIndex
// =============================================================================

#[derive(Default)]
struct FileMaps {
    by_name: HashMap<String, FileId>,
    by_id: HashMap<FileId, Arc<FileRecord>>,
    fingerprints: HashMap<Bytes, FileId>,
}

/// Filename → record resolution plus the dedup table, under one lock.
#[derive(Default)]
pub struct FileIndex {
    maps: RwLock<FileMaps>,
    next_id: AtomicU64,
}

impl FileIndex {
    pub fn new() -> FileIndex {
        FileIndex {
            maps: RwLock::new(FileMaps::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Find or lazily create the record for `name`. `creator` and
    /// `config` only apply when the record does not exist yet (or when
    /// `replace` re-registers it).
    pub fn resolve(
        &self,
        name: &str,
        options: &CacheOptions,
        creator: Option<DecoderCreator>,
        config: Option<DecoderConfig>,
        replace: bool,
    ) -> Arc<FileRecord> {
        {
            let maps = self.maps.read();
            if !replace {
                if let Some(id) = maps.by_name.get(name) {
                    if let Some(rec) = maps.by_id.get(id) {
                        return rec.clone();
                    }
                }
            }
        }
        let mut maps = self.maps.write();
        // Re-check under the write lock.
        if !replace {
            if let Some(id) = maps.by_name.get(name) {
                if let Some(rec) = maps.by_id.get(id) {
                    return rec.clone();
                }
            }
        }
        let id = FileId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let path = resolve_path(name, options);
        let config = config.unwrap_or_else(|| decoder_config_from(options));
        let rec = FileRecord::new(id, name.to_string(), path, creator, config);
        debug!(name, %id, "created file record");
        maps.by_name.insert(name.to_string(), id);
        maps.by_id.insert(id, rec.clone());
        rec
    }

    /// Look up a record without creating it.
    pub fn get_by_name(&self, name: &str) -> Option<Arc<FileRecord>> {
        let maps = self.maps.read();
        let id = maps.by_name.get(name)?;
        maps.by_id.get(id).cloned()
    }

    pub fn get(&self, id: FileId) -> Option<Arc<FileRecord>> {
        self.maps.read().by_id.get(&id).cloned()
    }

    /// Register a fingerprint, returning the id that owns it: the existing
    /// one on a dedup hit, otherwise `id` itself.
    pub fn register_fingerprint(&self, fingerprint: Bytes, id: FileId) -> FileId {
        let mut maps = self.maps.write();
        *maps.fingerprints.entry(fingerprint).or_insert(id)
    }

    /// Drop any fingerprint entries owned by `id` (on invalidation).
    pub fn forget_fingerprint(&self, id: FileId) {
        self.maps.write().fingerprints.retain(|_, v| *v != id);
    }

    /// Remove a record entirely (replace-registration path). Outstanding
    /// handles keep the record alive; only the index forgets it.
    pub fn remove(&self, id: FileId) {
        let mut maps = self.maps.write();
        if let Some(rec) = maps.by_id.remove(&id) {
            if maps.by_name.get(rec.name()) == Some(&id) {
                maps.by_name.remove(rec.name());
            }
        }
        maps.fingerprints.retain(|_, v| *v != id);
    }

    pub fn all_names(&self) -> Vec<String> {
        let maps = self.maps.read();
        let mut names: Vec<String> = maps.by_name.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn count(&self) -> usize {
        self.maps.read().by_id.len()
    }

    pub fn records(&self) -> Vec<Arc<FileRecord>> {
        self.maps.read().by_id.values().cloned().collect()
    }
}

/// Build decoder hints from the current options.
pub fn decoder_config_from(options: &CacheOptions) -> DecoderConfig {
    DecoderConfig {
        unassociated_alpha: options.unassociatedalpha,
        trust_extensions: options.trust_file_extensions,
        colorspace: options.colorspace.clone(),
    }
}

/// Resolve a filename against the search path. Absolute or directly
/// existing paths win; otherwise the first search directory containing the
/// file. Unresolvable names keep the raw name so the open failure reports
/// it verbatim.
fn resolve_path(name: &str, options: &CacheOptions) -> PathBuf {
    let direct = PathBuf::from(name);
    if direct.is_absolute() || direct.exists() {
        return direct;
    }
    for dir in options.search_dirs() {
        let candidate = dir.join(name);
        if candidate.exists() {
            return candidate;
        }
    }
    direct
}
