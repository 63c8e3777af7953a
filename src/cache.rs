//! The public image cache.
//!
//! [`ImageCache`] is the entry point: it owns the file index, the tile
//! store, the open-file set, and the option/statistics state, and it
//! orchestrates the read pipeline (thread state → tile store → file record
//! → decoder → pixel copy).
//!
//! # Shared mode
//!
//! `ImageCache::create(true)` returns a handle to a process-wide instance,
//! reference-counted by callers. `destroy(handle, true)` requests that the
//! singleton be torn down once the last handle drops.
//!
//! # Errors
//!
//! Query methods return `false`/`None` on failure and queue a message on
//! the calling thread, retrievable with [`ImageCache::geterror`]. Errors
//! for a file beyond `max_errors_per_file` are counted but no longer
//! queued.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::attribute::{self, AttrType, AttrValue, SideEffect};
use crate::config::CacheOptions;
use crate::error::CacheError;
use crate::file::{FileIndex, FileRecord, LevelInfo};
use crate::file::open_cache::OpenFileCache;
use crate::format::{DecoderConfig, DecoderCreator, ImageSpec};
use crate::perthread::{self, Perthread};
use crate::span::ImageSpan;
use crate::stats::{CacheStats, TimeGuard};
use crate::tile::cache::TileCache;
use crate::tile::{Tile, TileKey, TileRef};
use crate::types::{convert_elements, PixelFormat, Roi};

// =============================================================================
// CacheCore
// =============================================================================

/// Shared state behind every `ImageCache` handle. Read-path methods are
/// implemented in the `reader` module.
pub(crate) struct CacheCore {
    pub(crate) instance_id: u64,
    pub(crate) options: RwLock<CacheOptions>,
    pub(crate) files: FileIndex,
    pub(crate) tiles: TileCache,
    pub(crate) open_files: OpenFileCache,
    pub(crate) stats: Arc<CacheStats>,
    /// Bumped on every invalidation; thread states compare it to drop
    /// stale micro-cache entries.
    pub(crate) epoch: AtomicU64,
}

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

impl CacheCore {
    fn new() -> Arc<CacheCore> {
        let options = CacheOptions::default();
        let stats = Arc::new(CacheStats::default());
        let tiles = TileCache::new(options.max_memory_bytes(), stats.clone());
        Arc::new(CacheCore {
            instance_id: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            options: RwLock::new(options),
            files: FileIndex::new(),
            tiles,
            open_files: OpenFileCache::new(),
            stats,
            epoch: AtomicU64::new(0),
        })
    }

    /// Find or create the record for a name, consulting the thread state
    /// and applying `substitute_image`.
    pub(crate) fn resolve_file(&self, name: &str, pt: &mut Perthread) -> Arc<FileRecord> {
        let _t = TimeGuard::new(&self.stats.find_file_nanos);
        let substitute = {
            let o = self.options.read();
            if o.substitute_image.is_empty() {
                None
            } else {
                Some(o.substitute_image.clone())
            }
        };
        let name = substitute.as_deref().unwrap_or(name);
        if let Some(id) = pt.lookup_file(name) {
            if let Some(rec) = self.files.get(id) {
                return rec;
            }
        }
        let rec = self
            .files
            .resolve(name, &self.options.read(), None, None, false);
        pt.remember_file(name, rec.id());
        rec
    }

    /// Resolve, open, and follow dedup redirection; the returned record is
    /// the one that owns pixels.
    pub(crate) fn opened_file(
        &self,
        name: &str,
        pt: &mut Perthread,
    ) -> Result<Arc<FileRecord>, CacheError> {
        let rec = self.resolve_file(name, pt);
        self.ensure_open(&rec)?;
        let target = self.follow_duplicate(rec);
        self.ensure_open(&target)?;
        Ok(target)
    }

    /// Drop a file's decoder, tiles, fingerprint, and learned metadata.
    /// With `force` off, a file whose modification time still matches what
    /// was recorded at open is left alone.
    pub(crate) fn invalidate_record(&self, rec: &Arc<FileRecord>, force: bool) {
        if !force {
            let recorded = rec.state.read().mtime;
            if let Some(recorded) = recorded {
                if let Ok(meta) = std::fs::metadata(rec.path()) {
                    if meta.modified().ok() == Some(recorded) {
                        debug!(name = rec.name(), "invalidate skipped; file unchanged");
                        return;
                    }
                }
            } else if !rec.state.read().opened {
                return; // nothing cached yet
            }
        }
        debug!(name = rec.name(), force, "invalidating");
        self.close_decoder(rec);
        self.tiles.remove_file(rec.id());
        self.files.forget_fingerprint(rec.id());
        rec.reset();
        self.epoch.fetch_add(1, Ordering::Release);
    }

    fn unique_open_files(&self) -> usize {
        self.files
            .records()
            .iter()
            .filter(|r| r.state.read().opened && r.duplicate_of().is_none())
            .count()
    }

    fn total_image_bytes(&self) -> u64 {
        self.files
            .records()
            .iter()
            .map(|r| {
                let state = r.state.read();
                state
                    .subimages
                    .iter()
                    .flat_map(|s| s.levels.iter())
                    .filter(|l| !l.synthesized)
                    .map(|l| l.spec.image_bytes())
                    .sum::<u64>()
            })
            .sum()
    }

    fn total_file_bytes(&self) -> u64 {
        self.files
            .records()
            .iter()
            .map(|r| r.state.read().file_size)
            .sum()
    }
}

// =============================================================================
// ImageHandle
// =============================================================================

/// Opaque handle to a file record, bypassing the filename lookup.
#[derive(Clone)]
pub struct ImageHandle {
    rec: Arc<FileRecord>,
}

impl std::fmt::Debug for ImageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageHandle")
            .field("name", &self.rec.name())
            .finish()
    }
}

// =============================================================================
// Shared singleton
// =============================================================================

struct SharedHolder {
    core: Option<Arc<CacheCore>>,
    refs: usize,
    teardown: bool,
}

fn shared_holder() -> &'static Mutex<SharedHolder> {
    static HOLDER: OnceLock<Mutex<SharedHolder>> = OnceLock::new();
    HOLDER.get_or_init(|| {
        Mutex::new(SharedHolder {
            core: None,
            refs: 0,
            teardown: false,
        })
    })
}

// =============================================================================
// ImageCache
// =============================================================================

pub struct ImageCache {
    core: Arc<CacheCore>,
    shared: bool,
}

impl ImageCache {
    /// Create a cache. With `shared`, all callers in the process get the
    /// same underlying instance, reference-counted; otherwise the cache is
    /// private to this handle.
    pub fn create(shared: bool) -> ImageCache {
        if shared {
            let mut holder = shared_holder().lock();
            let core = match &holder.core {
                Some(core) => core.clone(),
                None => {
                    let core = CacheCore::new();
                    holder.core = Some(core.clone());
                    holder.teardown = false;
                    core
                }
            };
            holder.refs += 1;
            ImageCache { core, shared: true }
        } else {
            ImageCache {
                core: CacheCore::new(),
                shared: false,
            }
        }
    }

    /// Release this handle. For a shared cache, `teardown` requests that
    /// the process-wide instance be dropped when the last handle goes.
    pub fn destroy(self, teardown: bool) {
        if self.shared && teardown {
            shared_holder().lock().teardown = true;
        }
        drop(self);
    }

    // -------------------------------------------------------------------------
    // Thread state plumbing
    // -------------------------------------------------------------------------

    fn with_pt<R>(&self, pt: Option<&mut Perthread>, f: impl FnOnce(&mut Perthread) -> R) -> R {
        let epoch = self.core.epoch.load(Ordering::Acquire);
        match pt {
            Some(p) => {
                p.check_epoch(epoch);
                f(p)
            }
            None => perthread::with_managed(self.core.instance_id, |p| {
                p.check_epoch(epoch);
                f(p)
            }),
        }
    }

    fn report(&self, pt: &mut Perthread, rec: Option<&FileRecord>, err: &CacheError) {
        let max = self.core.options.read().max_errors_per_file;
        let queue = rec.map_or(true, |r| r.count_error(max));
        if queue {
            pt.report_error(err.to_string());
        }
    }

    // -------------------------------------------------------------------------
    // Attributes
    // -------------------------------------------------------------------------

    /// Set a named option. Returns false (and queues an error) for unknown
    /// names or type mismatches.
    pub fn attribute(&self, name: &str, value: impl Into<AttrValue>) -> bool {
        let value = value.into();
        let applied = {
            let mut options = self.core.options.write();
            attribute::apply(&mut options, name, &value)
        };
        match applied {
            Ok(effect) => {
                match effect {
                    SideEffect::TrimMemory => {
                        self.core
                            .tiles
                            .set_budget(self.core.options.read().max_memory_bytes());
                        self.core.tiles.trim_to_budget();
                    }
                    SideEffect::CloseFiles => {
                        let cap = self.core.options.read().max_open_files.max(1) as usize;
                        self.core
                            .open_files
                            .enforce(&self.core.files, cap, &self.core.stats);
                    }
                    SideEffect::InvalidateAll => self.invalidate_all(true),
                    SideEffect::None => {}
                }
                true
            }
            Err(e) => {
                self.with_pt(None, |pt| pt.report_error(e.to_string()));
                false
            }
        }
    }

    /// Read a named option or read-only statistic.
    pub fn getattribute(&self, name: &str) -> Option<AttrValue> {
        let core = &self.core;
        let stat = |c: &std::sync::atomic::AtomicU64| c.load(Ordering::Relaxed);
        Some(match name {
            "total_files" => AttrValue::Int(core.files.count() as i32),
            "all_filenames" => AttrValue::StrVec(core.files.all_names()),
            "stat:cache_memory_used" => AttrValue::Int64(core.tiles.mem_used() as i64),
            "stat:cache_footprint" => AttrValue::Int64(
                core.tiles.mem_used() as i64
                    + (core.files.count() * std::mem::size_of::<FileRecord>()) as i64,
            ),
            "stat:tiles_created" => AttrValue::Int(stat(&core.stats.tiles_created) as i32),
            "stat:tiles_current" => AttrValue::Int(stat(&core.stats.tiles_current) as i32),
            "stat:tiles_peak" => AttrValue::Int(stat(&core.stats.tiles_peak) as i32),
            "stat:open_files_created" => {
                AttrValue::Int(stat(&core.stats.open_files_created) as i32)
            }
            "stat:open_files_current" => {
                AttrValue::Int(stat(&core.stats.open_files_current) as i32)
            }
            "stat:open_files_peak" => AttrValue::Int(stat(&core.stats.open_files_peak) as i32),
            "stat:find_tile_calls" => AttrValue::Int64(stat(&core.stats.find_tile_calls) as i64),
            "stat:bytes_read" => AttrValue::Int64(stat(&core.stats.bytes_read) as i64),
            "stat:image_size" => AttrValue::Int64(core.total_image_bytes() as i64),
            "stat:file_size" => AttrValue::Int64(core.total_file_bytes() as i64),
            "stat:unique_files" => AttrValue::Int(core.unique_open_files() as i32),
            "stat:fileio_time" => AttrValue::Float(CacheStats::seconds(&core.stats.fileio_nanos)),
            "stat:fileopen_time" => {
                AttrValue::Float(CacheStats::seconds(&core.stats.fileopen_nanos))
            }
            "stat:file_locking_time" => {
                AttrValue::Float(CacheStats::seconds(&core.stats.file_locking_nanos))
            }
            "stat:tile_locking_time" => {
                AttrValue::Float(CacheStats::seconds(&core.stats.tile_locking_nanos))
            }
            "stat:find_file_time" => {
                AttrValue::Float(CacheStats::seconds(&core.stats.find_file_nanos))
            }
            "stat:find_tile_time" => {
                AttrValue::Float(CacheStats::seconds(&core.stats.find_tile_nanos))
            }
            _ => return attribute::get(&core.options.read(), name),
        })
    }

    /// Declared type of an attribute name, or `Unknown`.
    pub fn getattributetype(&self, name: &str) -> AttrType {
        attribute::declared_type(name)
    }

    // -------------------------------------------------------------------------
    // Handles and metadata
    // -------------------------------------------------------------------------

    /// Resolve a filename to a reusable handle, opening the file.
    pub fn get_image_handle(
        &self,
        name: &str,
        pt: Option<&mut Perthread>,
    ) -> Option<ImageHandle> {
        self.with_pt(pt, |pt| {
            let rec = self.core.resolve_file(name, pt);
            match self.core.ensure_open(&rec) {
                Ok(()) => Some(ImageHandle {
                    rec: self.core.follow_duplicate(rec),
                }),
                Err(e) => {
                    self.report(pt, Some(&rec), &e);
                    None
                }
            }
        })
    }

    /// Whether a handle refers to a usable (opened, unbroken) file.
    pub fn good(&self, handle: &ImageHandle) -> bool {
        handle.rec.state.read().opened && !handle.rec.is_broken()
    }

    pub fn filename_from_handle(&self, handle: &ImageHandle) -> String {
        handle.rec.name().to_string()
    }

    /// Copy of the spec for (subimage, miplevel).
    pub fn get_imagespec(&self, name: &str, subimage: u32, miplevel: u32) -> Option<ImageSpec> {
        self.imagespec(name, subimage, miplevel)
            .map(|spec| (*spec).clone())
    }

    /// Shared reference to the internal spec. Remains accurate until the
    /// file is invalidated.
    pub fn imagespec(&self, name: &str, subimage: u32, miplevel: u32) -> Option<Arc<ImageSpec>> {
        self.with_pt(None, |pt| {
            let result = self.core.opened_file(name, pt).and_then(|rec| {
                let sub = rec
                    .subimage(subimage)
                    .ok_or_else(|| CacheError::BadSubimage {
                        name: rec.name().to_string(),
                        subimage,
                    })?;
                sub.levels
                    .get(miplevel as usize)
                    .map(|l| l.spec.clone())
                    .ok_or_else(|| CacheError::BadMipLevel {
                        name: rec.name().to_string(),
                        subimage,
                        miplevel,
                    })
            });
            match result {
                Ok(spec) => Some(spec),
                Err(e) => {
                    self.report(pt, None, &e);
                    None
                }
            }
        })
    }

    /// The spec as the cache serves it: tile fields reflect the cached
    /// (possibly virtual) tile grid rather than the file's native one.
    pub fn get_cache_dimensions(
        &self,
        name: &str,
        subimage: u32,
        miplevel: u32,
    ) -> Option<ImageSpec> {
        self.with_pt(None, |pt| {
            let result = self.core.opened_file(name, pt).and_then(|rec| {
                let sub = rec
                    .subimage(subimage)
                    .ok_or_else(|| CacheError::BadSubimage {
                        name: rec.name().to_string(),
                        subimage,
                    })?;
                let level = sub.levels.get(miplevel as usize).ok_or_else(|| {
                    CacheError::BadMipLevel {
                        name: rec.name().to_string(),
                        subimage,
                        miplevel,
                    }
                })?;
                let mut spec = (*level.spec).clone();
                spec.tile_width = level.tile_width;
                spec.tile_height = level.tile_height;
                spec.tile_depth = level.tile_depth;
                spec.format = self.core.cached_format(level.spec.format);
                Ok(spec)
            });
            match result {
                Ok(spec) => Some(spec),
                Err(e) => {
                    self.report(pt, None, &e);
                    None
                }
            }
        })
    }

    /// Query a named property of an image. `"exists"` is special: it never
    /// reports an error and always answers.
    pub fn get_image_info(
        &self,
        name: &str,
        subimage: u32,
        miplevel: u32,
        what: &str,
    ) -> Option<AttrValue> {
        self.with_pt(None, |pt| {
            if what == "exists" {
                let rec = self.core.resolve_file(name, pt);
                let exists = self.core.ensure_open(&rec).is_ok();
                return Some(AttrValue::Int(exists as i32));
            }
            let result = self.core.opened_file(name, pt).and_then(|rec| {
                let sub = rec
                    .subimage(subimage)
                    .ok_or_else(|| CacheError::BadSubimage {
                        name: rec.name().to_string(),
                        subimage,
                    })?;
                let level = sub.levels.get(miplevel as usize).ok_or_else(|| {
                    CacheError::BadMipLevel {
                        name: rec.name().to_string(),
                        subimage,
                        miplevel,
                    }
                })?;
                let spec = &level.spec;
                match what {
                    "subimages" => Ok(AttrValue::Int(rec.nsubimages() as i32)),
                    "miplevels" => Ok(AttrValue::Int(sub.nmiplevels() as i32)),
                    "channels" => Ok(AttrValue::Int(spec.nchannels as i32)),
                    "resolution" => Ok(AttrValue::IntVec(vec![
                        spec.width as i32,
                        spec.height as i32,
                    ])),
                    "datawindow" => Ok(AttrValue::IntVec(vec![
                        spec.x,
                        spec.y,
                        spec.x + spec.width as i32,
                        spec.y + spec.height as i32,
                    ])),
                    "displaywindow" => Ok(AttrValue::IntVec(vec![
                        spec.full_x,
                        spec.full_y,
                        spec.full_x + spec.full_width as i32,
                        spec.full_y + spec.full_height as i32,
                    ])),
                    "format" => Ok(AttrValue::Str(spec.format.name().to_string())),
                    "cachedpixeltype" => Ok(AttrValue::Str(
                        self.core.cached_format(spec.format).name().to_string(),
                    )),
                    "fingerprint" => {
                        let state = rec.state.read();
                        let fp = state.fingerprint.as_ref().ok_or_else(|| {
                            CacheError::InvalidAttribute(format!(
                                "\"{}\" has no fingerprint",
                                rec.name()
                            ))
                        })?;
                        Ok(AttrValue::Str(
                            fp.iter().map(|b| format!("{b:02x}")).collect(),
                        ))
                    }
                    other => Err(CacheError::InvalidAttribute(format!(
                        "unknown image info \"{other}\""
                    ))),
                }
            });
            match result {
                Ok(v) => Some(v),
                Err(e) => {
                    self.report(pt, None, &e);
                    None
                }
            }
        })
    }

    /// Embedded thumbnail, if the file carries one.
    pub fn get_thumbnail(&self, name: &str, subimage: u32) -> Option<(ImageSpec, Bytes)> {
        self.with_pt(None, |pt| {
            let rec = match self.core.opened_file(name, pt) {
                Ok(rec) => rec,
                Err(e) => {
                    self.report(pt, None, &e);
                    return None;
                }
            };
            self.core
                .with_open_decoder(&rec, |decoder| Ok(decoder.thumbnail(subimage)))
                .ok()
                .flatten()
        })
    }

    // -------------------------------------------------------------------------
    // Pixels
    // -------------------------------------------------------------------------

    /// Gather a pixel region into `span` (which must cover exactly `roi`,
    /// converting to the span's format). `cache_channels` optionally names
    /// the wider channel range tiles are cached under.
    pub fn get_pixels(
        &self,
        name: &str,
        subimage: u32,
        miplevel: u32,
        roi: Roi,
        span: &mut ImageSpan<'_>,
        cache_channels: Option<(u16, u16)>,
    ) -> bool {
        self.with_pt(None, |pt| {
            let rec = self.core.resolve_file(name, pt);
            self.get_pixels_record(pt, rec, subimage, miplevel, roi, span, cache_channels)
        })
    }

    /// Handle-based variant of [`ImageCache::get_pixels`], optionally with
    /// caller-owned thread state.
    #[allow(clippy::too_many_arguments)]
    pub fn get_pixels_handle(
        &self,
        handle: &ImageHandle,
        pt: Option<&mut Perthread>,
        subimage: u32,
        miplevel: u32,
        roi: Roi,
        span: &mut ImageSpan<'_>,
        cache_channels: Option<(u16, u16)>,
    ) -> bool {
        self.with_pt(pt, |pt| {
            let rec = handle.rec.clone();
            self.get_pixels_record(pt, rec, subimage, miplevel, roi, span, cache_channels)
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn get_pixels_record(
        &self,
        pt: &mut Perthread,
        rec: Arc<FileRecord>,
        subimage: u32,
        miplevel: u32,
        roi: Roi,
        span: &mut ImageSpan<'_>,
        cache_channels: Option<(u16, u16)>,
    ) -> bool {
        let result = self.core.ensure_open(&rec).and_then(|_| {
            let target = self.core.follow_duplicate(rec.clone());
            self.core.ensure_open(&target)?;
            self.core
                .gather(&target, subimage, miplevel, roi, span, cache_channels)
        });
        match result {
            Ok(()) => true,
            Err(e) => {
                self.report(pt, Some(&rec), &e);
                false
            }
        }
    }

    // -------------------------------------------------------------------------
    // Tiles
    // -------------------------------------------------------------------------

    /// Pin the tile containing `(x, y, z)`. `channels` may name a stored
    /// channel subset; anything else pins the all-channels tile.
    #[allow(clippy::too_many_arguments)]
    pub fn get_tile(
        &self,
        name: &str,
        subimage: u32,
        miplevel: u32,
        x: i32,
        y: i32,
        z: i32,
        channels: Option<(u16, u16)>,
    ) -> Option<TileRef> {
        self.with_pt(None, |pt| {
            let rec = self.core.resolve_file(name, pt);
            let result = self.core.ensure_open(&rec).and_then(|_| {
                let target = self.core.follow_duplicate(rec.clone());
                self.core.ensure_open(&target)?;
                let sub = target
                    .subimage(subimage)
                    .ok_or_else(|| CacheError::BadSubimage {
                        name: target.name().to_string(),
                        subimage,
                    })?;
                let level = sub.levels.get(miplevel as usize).ok_or_else(|| {
                    CacheError::BadMipLevel {
                        name: target.name().to_string(),
                        subimage,
                        miplevel,
                    }
                })?;
                if !level.spec.roi().contains(x, y, z) {
                    return Err(CacheError::BadRoi(format!(
                        "({x}, {y}, {z}) is outside the data window"
                    )));
                }
                let (tx, ty, tz) = level.tile_origin(x, y, z);
                let nch = level.spec.nchannels;
                let (kb, ke) = match channels {
                    Some((b, e)) if b < e && e <= nch && !(b == 0 && e == nch) => (b, e),
                    _ => (0, nch),
                };
                let key = TileKey {
                    file: target.id(),
                    subimage,
                    miplevel,
                    x: tx,
                    y: ty,
                    z: tz,
                    chbegin: kb,
                    chend: ke,
                };
                if let Some(hit) = pt.lookup_tile(&key) {
                    self.core.stats.find_tile_calls.fetch_add(1, Ordering::Relaxed);
                    self.core.stats.microcache_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(hit);
                }
                let r = self.core.fetch_tile(&target, key)?;
                pt.remember_tile(r.clone());
                Ok(r)
            });
            match result {
                Ok(r) => Some(r),
                Err(e) => {
                    self.report(pt, Some(&rec), &e);
                    None
                }
            }
        })
    }

    /// Release a tile obtained from [`ImageCache::get_tile`]. Equivalent
    /// to dropping the ref; provided for call-site symmetry.
    pub fn release_tile(&self, tile: TileRef) {
        drop(tile);
    }

    /// Raw pixels of a pinned tile, with their storage format.
    pub fn tile_pixels<'a>(&self, tile: &'a TileRef) -> (&'a [u8], PixelFormat) {
        (tile.pixels(), tile.format())
    }

    pub fn tile_format(&self, tile: &TileRef) -> PixelFormat {
        tile.format()
    }

    pub fn tile_roi(&self, tile: &TileRef) -> Roi {
        tile.roi()
    }

    // -------------------------------------------------------------------------
    // Injection
    // -------------------------------------------------------------------------

    /// Pre-register a file, optionally with a custom decoder factory (for
    /// procedural sources) and open hints. With `replace`, an existing
    /// record for the name is invalidated and re-registered.
    pub fn add_file(
        &self,
        name: &str,
        creator: Option<DecoderCreator>,
        config: Option<DecoderConfig>,
        replace: bool,
    ) -> bool {
        self.with_pt(None, |pt| {
            if replace {
                if let Some(old) = self.core.files.get_by_name(name) {
                    self.core.invalidate_record(&old, true);
                    self.core.files.remove(old.id());
                }
            }
            let rec = self
                .core
                .files
                .resolve(name, &self.core.options.read(), creator, config, replace);
            pt.remember_file(name, rec.id());
            match self.core.ensure_open(&rec) {
                Ok(()) => true,
                Err(e) => {
                    self.report(pt, Some(&rec), &e);
                    false
                }
            }
        })
    }

    /// Inject an externally produced tile into the in-memory cache. The
    /// data must be a full tile (tile-aligned origin, full tile
    /// dimensions, densely interleaved) in `format`; it is converted to
    /// the cache format if they differ. Never touches disk.
    #[allow(clippy::too_many_arguments)]
    pub fn add_tile(
        &self,
        name: &str,
        subimage: u32,
        miplevel: u32,
        x: i32,
        y: i32,
        z: i32,
        channels: Option<(u16, u16)>,
        format: PixelFormat,
        data: Bytes,
    ) -> bool {
        self.with_pt(None, |pt| {
            let rec = self.core.resolve_file(name, pt);
            let result = self.core.ensure_open(&rec).and_then(|_| {
                let target = self.core.follow_duplicate(rec.clone());
                self.core.ensure_open(&target)?;
                let sub = target
                    .subimage(subimage)
                    .ok_or_else(|| CacheError::BadSubimage {
                        name: target.name().to_string(),
                        subimage,
                    })?;
                let level = sub.levels.get(miplevel as usize).ok_or_else(|| {
                    CacheError::BadMipLevel {
                        name: target.name().to_string(),
                        subimage,
                        miplevel,
                    }
                })?;
                let (tx, ty, tz) = level.tile_origin(x, y, z);
                if (tx, ty, tz) != (x, y, z) {
                    return Err(CacheError::BadRoi(format!(
                        "({x}, {y}, {z}) is not a tile origin"
                    )));
                }
                let nch = level.spec.nchannels;
                let (kb, ke) = match channels {
                    Some((b, e)) if b < e && e <= nch && !(b == 0 && e == nch) => (b, e),
                    _ => (0, nch),
                };
                let (tw, th, td) = (
                    level.tile_width as usize,
                    level.tile_height as usize,
                    level.tile_depth as usize,
                );
                let count = tw * th * td * (ke - kb) as usize;
                if data.len() != count * format.size() {
                    return Err(CacheError::TypeMismatch(format!(
                        "tile data is {} bytes; expected {}",
                        data.len(),
                        count * format.size()
                    )));
                }
                let cache_format = self.core.cached_format(level.spec.format);
                let pixels = if format == cache_format {
                    data
                } else {
                    let mut out = vec![0u8; count * cache_format.size()];
                    convert_elements(&data, format, &mut out, cache_format, count);
                    Bytes::from(out)
                };
                let key = TileKey {
                    file: target.id(),
                    subimage,
                    miplevel,
                    x: tx,
                    y: ty,
                    z: tz,
                    chbegin: kb,
                    chend: ke,
                };
                let tile = Tile::new(key, pixels, cache_format, tw as u32, th as u32, td as u32);
                drop(self.core.tiles.insert(tile));
                Ok(())
            });
            match result {
                Ok(()) => true,
                Err(e) => {
                    self.report(pt, Some(&rec), &e);
                    false
                }
            }
        })
    }

    // -------------------------------------------------------------------------
    // Invalidation
    // -------------------------------------------------------------------------

    /// Drop cached state for one file. Without `force`, a file whose
    /// modification time is unchanged is left cached.
    pub fn invalidate(&self, name: &str, force: bool) {
        if let Some(rec) = self.core.files.get_by_name(name) {
            self.core.invalidate_record(&rec, force);
        }
    }

    /// Invalidate every file.
    pub fn invalidate_all(&self, force: bool) {
        for rec in self.core.files.records() {
            self.core.invalidate_record(&rec, force);
        }
        if force {
            self.core.tiles.clear();
        }
        self.core.epoch.fetch_add(1, Ordering::Release);
    }

    /// Close one file's decoder, keeping its metadata and cached tiles.
    pub fn close(&self, name: &str) {
        if let Some(rec) = self.core.files.get_by_name(name) {
            self.core.close_decoder(&rec);
        }
    }

    /// Close every decoder, keeping all metadata and tiles.
    pub fn close_all(&self) {
        self.core
            .open_files
            .close_all(&self.core.files, &self.core.stats);
    }

    // -------------------------------------------------------------------------
    // Errors and statistics
    // -------------------------------------------------------------------------

    /// Whether this thread has queued error messages.
    pub fn has_error(&self) -> bool {
        self.with_pt(None, |pt| pt.has_error())
    }

    /// Pending error text for this thread, oldest first; clears the queue
    /// when `clear` is set.
    pub fn geterror(&self, clear: bool) -> String {
        self.with_pt(None, |pt| pt.geterror(clear))
    }

    /// Human-readable statistics. Level 1 is a summary; level 2 and above
    /// add per-file detail.
    pub fn getstats(&self, level: i32) -> String {
        use std::fmt::Write;
        let core = &self.core;
        let s = &core.stats;
        let ld = |c: &std::sync::atomic::AtomicU64| c.load(Ordering::Relaxed);
        let mb = |b: u64| b as f64 / (1024.0 * 1024.0);
        let mut out = String::new();
        writeln!(out, "tilecache statistics").ok();
        writeln!(
            out,
            "  Images : {} total, {} unique open",
            core.files.count(),
            core.unique_open_files()
        )
        .ok();
        writeln!(
            out,
            "  Files  : {} opens, {} current, {} peak",
            ld(&s.open_files_created),
            ld(&s.open_files_current),
            ld(&s.open_files_peak)
        )
        .ok();
        writeln!(
            out,
            "  Tiles  : {} created, {} current, {} peak",
            ld(&s.tiles_created),
            ld(&s.tiles_current),
            ld(&s.tiles_peak)
        )
        .ok();
        writeln!(
            out,
            "  Tile memory : {:.1} MB used of {:.1} MB budget",
            mb(core.tiles.mem_used()),
            core.options.read().max_memory_mb
        )
        .ok();
        writeln!(
            out,
            "  find_tile : {} calls, {} cache hits, {} microcache hits",
            ld(&s.find_tile_calls),
            ld(&s.tile_cache_hits),
            ld(&s.microcache_hits)
        )
        .ok();
        writeln!(out, "  Bytes read from disk : {:.1} MB", mb(ld(&s.bytes_read))).ok();
        writeln!(
            out,
            "  Time : {:.3}s I/O, {:.3}s open, {:.3}s file lock, {:.3}s tile lock",
            CacheStats::seconds(&s.fileio_nanos),
            CacheStats::seconds(&s.fileopen_nanos),
            CacheStats::seconds(&s.file_locking_nanos),
            CacheStats::seconds(&s.tile_locking_nanos)
        )
        .ok();
        if level >= 2 {
            let mut records = core.files.records();
            records.sort_by(|a, b| a.name().cmp(b.name()));
            for rec in records {
                let io = &rec.io;
                let mut line = format!(
                    "    {} : {} opens, {} tiles, {:.1} MB read",
                    rec.name(),
                    io.times_opened.load(Ordering::Relaxed),
                    io.tiles_read.load(Ordering::Relaxed),
                    mb(io.bytes_read.load(Ordering::Relaxed))
                );
                if io.mips_used.load(Ordering::Relaxed) {
                    line.push_str(", synthesized mips");
                }
                if rec.is_broken() {
                    line.push_str(", BROKEN");
                }
                if let Some(dup) = rec.duplicate_of() {
                    write!(line, ", duplicate of {dup}").ok();
                }
                writeln!(out, "{line}").ok();
            }
        }
        out
    }

    /// Zero the history counters.
    pub fn reset_stats(&self) {
        self.core.stats.reset();
    }
}

impl Drop for ImageCache {
    fn drop(&mut self) {
        perthread::drop_managed(self.core.instance_id);
        if self.shared {
            let mut holder = shared_holder().lock();
            holder.refs = holder.refs.saturating_sub(1);
            if holder.refs == 0 && holder.teardown {
                info!("tearing down shared image cache");
                holder.core = None;
                holder.teardown = false;
            }
        }
    }
}

impl std::fmt::Debug for ImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageCache")
            .field("shared", &self.shared)
            .field("files", &self.core.files.count())
            .field("tiles", &self.core.tiles.count())
            .finish()
    }
}

// Handle-based metadata access reuses the record already resolved.
impl ImageCache {
    /// Spec lookup via a handle (no name hash involved).
    pub fn imagespec_handle(
        &self,
        handle: &ImageHandle,
        subimage: u32,
        miplevel: u32,
    ) -> Option<Arc<ImageSpec>> {
        let sub = handle.rec.subimage(subimage)?;
        sub.levels.get(miplevel as usize).map(|l| l.spec.clone())
    }

    /// The cached-grid tile geometry for a level, via a handle.
    pub fn tile_dimensions_handle(
        &self,
        handle: &ImageHandle,
        subimage: u32,
        miplevel: u32,
    ) -> Option<(u32, u32, u32)> {
        let sub = handle.rec.subimage(subimage)?;
        sub.levels
            .get(miplevel as usize)
            .map(|l: &LevelInfo| (l.tile_width, l.tile_height, l.tile_depth))
    }
}
