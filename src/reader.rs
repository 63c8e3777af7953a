//! Tile production and pixel gathering.
//!
//! This module implements the miss path of the cache: opening decoders,
//! learning file metadata, decoding native or virtual (autotiled) tiles,
//! synthesizing missing MIP levels, and walking the tile grid to satisfy
//! rectangular pixel requests.
//!
//! Lock discipline on the miss path: the per-file decoder lock is held for
//! the whole decode (serializing decoding of one file and blocking
//! invalidation), while tile-shard locks are only ever taken before or
//! after, never across, the decode.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::cache::CacheCore;
use crate::config::CacheOptions;
use crate::error::{CacheError, DecodeError};
use crate::file::{FileRecord, LevelInfo, SubimageInfo};
use crate::format::{open_decoder, ImageDecoder, ImageSpec, Subimage};
use crate::span::ImageSpan;
use crate::stats::TimeGuard;
use crate::tile::{Tile, TileKey, TileRef};
use crate::types::{convert_elements, PixelFormat, Roi};

impl CacheCore {
    /// The format tiles are cached in for a file with the given native
    /// format.
    pub(crate) fn cached_format(&self, native: PixelFormat) -> PixelFormat {
        if self.options.read().forcefloat {
            PixelFormat::F32
        } else {
            native
        }
    }

    // =========================================================================
    // Opening
    // =========================================================================

    /// Make sure the file's metadata has been read (opening the decoder if
    /// this is the first touch). Does not follow duplicate redirection.
    pub(crate) fn ensure_open(&self, rec: &Arc<FileRecord>) -> Result<(), CacheError> {
        if rec.is_udim() {
            return Err(CacheError::UdimPattern(rec.name().to_string()));
        }
        if rec.state.read().opened {
            return Ok(());
        }
        if rec.is_broken() {
            return Err(CacheError::Unreadable {
                name: rec.name().to_string(),
                reason: "previous open failed".to_string(),
            });
        }
        let _open_time = TimeGuard::new(&self.stats.fileopen_nanos);
        let mut slot = {
            let _lock_time = TimeGuard::new(&self.stats.file_locking_nanos);
            rec.decoder.lock()
        };
        if rec.state.read().opened {
            return Ok(()); // another thread opened while we waited
        }
        match self.open_and_learn(rec, &mut slot) {
            Ok(()) => Ok(()),
            Err(e) => {
                rec.mark_broken();
                Err(e)
            }
        }
    }

    /// First open: create the decoder, record specs/mtime/fingerprint, and
    /// run dedup. Called with the decoder slot locked and empty.
    fn open_and_learn(
        &self,
        rec: &Arc<FileRecord>,
        slot: &mut Option<Box<dyn ImageDecoder>>,
    ) -> Result<(), CacheError> {
        let options = self.options.read().clone();
        let decoder = self.create_decoder(rec)?;

        let (mtime, file_size) = match std::fs::metadata(rec.path()) {
            Ok(meta) => (meta.modified().ok(), meta.len()),
            Err(_) => (None, 0), // virtual (creator-backed) file
        };
        let subimages = build_subimages(decoder.subimages(), &options, rec.name())?;
        let fingerprint = decoder.fingerprint();
        {
            let mut state = rec.state.write();
            state.opened = true;
            state.mtime = mtime;
            state.file_size = file_size;
            state.untiled = subimages.untiled;
            state.unmipped = subimages.unmipped;
            state.subimages = subimages.infos;
            state.fingerprint = fingerprint.clone();
        }
        *slot = Some(decoder);
        self.stats.note_file_opened();
        rec.io.times_opened.fetch_add(1, Ordering::Relaxed);
        self.open_files.touch(rec.id());

        if options.deduplicate {
            if let Some(fp) = fingerprint {
                let owner = self.files.register_fingerprint(fp, rec.id());
                if owner != rec.id() {
                    if let Some(target) = self.files.get(owner) {
                        if !target.is_broken() {
                            debug!(
                                name = rec.name(),
                                target = target.name(),
                                "identical content fingerprint; sharing tiles"
                            );
                            rec.set_duplicate_of(owner);
                            // This decoder will never be read from.
                            *slot = None;
                            self.stats.note_file_closed();
                            self.open_files.forget(rec.id());
                        }
                    }
                }
            }
        }

        let cap = options.max_open_files.max(1) as usize;
        self.open_files.enforce(&self.files, cap, &self.stats);
        Ok(())
    }

    fn create_decoder(&self, rec: &Arc<FileRecord>) -> Result<Box<dyn ImageDecoder>, CacheError> {
        let made = match rec.creator() {
            Some(creator) => creator(rec.path(), rec.decoder_config()),
            None => {
                if !rec.path().exists() {
                    return Err(CacheError::FileNotFound(rec.name().to_string()));
                }
                open_decoder(rec.path(), rec.decoder_config())
            }
        };
        made.map_err(|e| decode_to_cache_error(rec.name(), e))
    }

    /// Follow duplicate redirection to the record that owns the pixels.
    pub(crate) fn follow_duplicate(&self, rec: Arc<FileRecord>) -> Arc<FileRecord> {
        match rec.duplicate_of().and_then(|id| self.files.get(id)) {
            Some(target) => target,
            None => rec,
        }
    }

    /// Run `f` against the open decoder, reopening it if the open-file
    /// cache closed it. The decoder lock is held across the call.
    pub(crate) fn with_open_decoder<R>(
        &self,
        rec: &Arc<FileRecord>,
        f: impl FnOnce(&mut dyn ImageDecoder) -> Result<R, DecodeError>,
    ) -> Result<R, CacheError> {
        let mut slot = {
            let _lock_time = TimeGuard::new(&self.stats.file_locking_nanos);
            rec.decoder.lock()
        };
        if slot.is_none() {
            let _open_time = TimeGuard::new(&self.stats.fileopen_nanos);
            *slot = Some(self.create_decoder(rec)?);
            self.stats.note_file_opened();
            rec.io.times_opened.fetch_add(1, Ordering::Relaxed);
            self.open_files.touch(rec.id());
            let cap = self.options.read().max_open_files.max(1) as usize;
            self.open_files.enforce(&self.files, cap, &self.stats);
        } else {
            self.open_files.touch(rec.id());
        }
        let decoder = slot.as_mut().expect("just ensured open").as_mut();
        let _io_time = TimeGuard::new(&self.stats.fileio_nanos);
        let _file_io_time = TimeGuard::new(&rec.io.io_nanos);
        f(decoder).map_err(|e| decode_to_cache_error(rec.name(), e))
    }

    /// Drop the file's decoder (if idle this instant it closes
    /// immediately; a held lock means a read is mid-flight and the close
    /// happens via the open-file cache later).
    pub(crate) fn close_decoder(&self, rec: &Arc<FileRecord>) {
        if rec.decoder.lock().take().is_some() {
            self.stats.note_file_closed();
        }
        self.open_files.forget(rec.id());
    }

    // =========================================================================
    // Tile production
    // =========================================================================

    /// Tile lookup with fill-on-miss. The returned ref is pinned.
    pub(crate) fn fetch_tile(
        &self,
        rec: &Arc<FileRecord>,
        key: TileKey,
    ) -> Result<TileRef, CacheError> {
        self.stats.find_tile_calls.fetch_add(1, Ordering::Relaxed);
        let _t = TimeGuard::new(&self.stats.find_tile_nanos);
        if let Some(r) = self.tiles.find(&key) {
            self.stats.tile_cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(r);
        }
        let tile = self.produce_tile(rec, key)?;
        let r = self.tiles.insert(tile);
        let options = self.options.read();
        if options.max_open_files_strict {
            let cap = options.max_open_files.max(1) as usize;
            drop(options);
            self.open_files.enforce(&self.files, cap, &self.stats);
        }
        Ok(r)
    }

    fn produce_tile(&self, rec: &Arc<FileRecord>, key: TileKey) -> Result<Arc<Tile>, CacheError> {
        let (max_errors, retries) = {
            let o = self.options.read();
            (o.max_errors_per_file, o.failure_retries)
        };
        if rec.is_broken() && rec.error_count() >= max_errors {
            return Err(CacheError::Unreadable {
                name: rec.name().to_string(),
                reason: "too many errors".to_string(),
            });
        }
        self.ensure_open(rec)?;
        let sub = rec
            .subimage(key.subimage)
            .ok_or_else(|| CacheError::BadSubimage {
                name: rec.name().to_string(),
                subimage: key.subimage,
            })?;
        let level = sub
            .levels
            .get(key.miplevel as usize)
            .cloned()
            .ok_or_else(|| CacheError::BadMipLevel {
                name: rec.name().to_string(),
                subimage: key.subimage,
                miplevel: key.miplevel,
            })?;
        if level.synthesized {
            return self.synthesize_tile(rec, key, &sub, &level);
        }

        let mut attempt = 0;
        loop {
            match self.decode_tile(rec, &key, &level) {
                Ok(tile) => return Ok(tile),
                Err(e) if e.is_transient() && attempt < retries => {
                    attempt += 1;
                    warn!(
                        name = rec.name(),
                        attempt,
                        error = %e,
                        "read failed; closing and retrying"
                    );
                    self.close_decoder(rec);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Decode one tile off disk, zero-padded to full tile size and
    /// converted to the cache format.
    fn decode_tile(
        &self,
        rec: &Arc<FileRecord>,
        key: &TileKey,
        level: &LevelInfo,
    ) -> Result<Arc<Tile>, CacheError> {
        let spec = level.spec.clone();
        let (tw, th, td) = (
            level.tile_width as usize,
            level.tile_height as usize,
            level.tile_depth as usize,
        );
        let nch = key.nchannels() as usize;
        let es = spec.format.size();
        let native_len = tw * th * td * nch * es;
        // Zero-filled up front, so anything past the data window stays 0.
        let mut native = vec![0u8; native_len];

        self.with_open_decoder(rec, |decoder| {
            if spec.is_tiled() {
                // The cached grid is the native grid.
                decoder.read_tile(
                    key.subimage,
                    key.miplevel,
                    key.x,
                    key.y,
                    key.z,
                    key.chbegin,
                    key.chend,
                    &mut native,
                )
            } else {
                read_scanline_tile(decoder, key, &spec, (tw, th, td), &mut native)
            }
        })?;

        let bytes_read = native_len as u64;
        rec.io.tiles_read.fetch_add(1, Ordering::Relaxed);
        rec.io.bytes_read.fetch_add(bytes_read, Ordering::Relaxed);
        self.stats.bytes_read.fetch_add(bytes_read, Ordering::Relaxed);

        let cache_format = self.cached_format(spec.format);
        let pixels = if cache_format == spec.format {
            Bytes::from(native)
        } else {
            let count = tw * th * td * nch;
            let mut out = vec![0u8; count * cache_format.size()];
            convert_elements(&native, spec.format, &mut out, cache_format, count);
            Bytes::from(out)
        };
        Ok(Tile::new(
            *key,
            pixels,
            cache_format,
            tw as u32,
            th as u32,
            td as u32,
        ))
    }

    /// Produce a tile of a synthesized miplevel by box-averaging the next
    /// higher-resolution level (which may itself be synthesized; recursion
    /// bottoms out at a level that exists in the file, and every level is
    /// memoized as ordinary tiles).
    fn synthesize_tile(
        &self,
        rec: &Arc<FileRecord>,
        key: TileKey,
        sub: &SubimageInfo,
        level: &LevelInfo,
    ) -> Result<Arc<Tile>, CacheError> {
        let parent = &sub.levels[key.miplevel as usize - 1];
        let spec = &level.spec;
        let pspec = &parent.spec;
        let (tw, th, td) = (
            level.tile_width as usize,
            level.tile_height as usize,
            level.tile_depth as usize,
        );
        let nch = key.nchannels() as usize;
        let mut out = vec![0f32; tw * th * td * nch];

        // This tile's live region within the level.
        let x0 = key.x.max(spec.x);
        let x1 = (key.x + tw as i32).min(spec.x + spec.width as i32);
        let y0 = key.y.max(spec.y);
        let y1 = (key.y + th as i32).min(spec.y + spec.height as i32);
        let z0 = key.z.max(spec.z);
        let z1 = (key.z + td as i32).min(spec.z + spec.depth as i32);

        if x0 < x1 && y0 < y1 && z0 < z1 {
            // Axes only halve while the parent is still larger.
            let sx = if pspec.width > spec.width { 2 } else { 1 };
            let sy = if pspec.height > spec.height { 2 } else { 1 };
            let sz = if pspec.depth > spec.depth { 2 } else { 1 };

            let proi = Roi {
                xbegin: (x0 * sx).max(pspec.x),
                xend: (x1 * sx).min(pspec.x + pspec.width as i32),
                ybegin: (y0 * sy).max(pspec.y),
                yend: (y1 * sy).min(pspec.y + pspec.height as i32),
                zbegin: (z0 * sz).max(pspec.z),
                zend: (z1 * sz).min(pspec.z + pspec.depth as i32),
                chbegin: key.chbegin,
                chend: key.chend,
            };
            let (pw, ph, pd) = (
                proi.width() as usize,
                proi.height() as usize,
                proi.depth() as usize,
            );
            let mut parent_px = vec![0f32; pw * ph * pd * nch];
            {
                let mut span = ImageSpan::contiguous_3d(
                    bytemuck::cast_slice_mut(&mut parent_px),
                    PixelFormat::F32,
                    nch,
                    pw,
                    ph,
                    pd,
                )?;
                self.gather(
                    rec,
                    key.subimage,
                    key.miplevel - 1,
                    proi,
                    &mut span,
                    Some((key.chbegin, key.chend)),
                )?;
            }

            let sample = |px: i32, py: i32, pz: i32, c: usize| -> Option<f32> {
                if px < proi.xbegin || px >= proi.xend {
                    return None;
                }
                if py < proi.ybegin || py >= proi.yend {
                    return None;
                }
                if pz < proi.zbegin || pz >= proi.zend {
                    return None;
                }
                let idx = (((pz - proi.zbegin) as usize * ph + (py - proi.ybegin) as usize) * pw
                    + (px - proi.xbegin) as usize)
                    * nch
                    + c;
                Some(parent_px[idx])
            };

            for z in z0..z1 {
                for y in y0..y1 {
                    for x in x0..x1 {
                        let base =
                            (((z - key.z) as usize * th + (y - key.y) as usize) * tw
                                + (x - key.x) as usize)
                                * nch;
                        for c in 0..nch {
                            let mut sum = 0f32;
                            let mut n = 0u32;
                            for dz in 0..sz {
                                for dy in 0..sy {
                                    for dx in 0..sx {
                                        if let Some(v) =
                                            sample(x * sx + dx, y * sy + dy, z * sz + dz, c)
                                        {
                                            sum += v;
                                            n += 1;
                                        }
                                    }
                                }
                            }
                            out[base + c] = if n > 0 { sum / n as f32 } else { 0.0 };
                        }
                    }
                }
            }
        }

        rec.io.mips_used.store(true, Ordering::Relaxed);
        let cache_format = self.cached_format(spec.format);
        let count = tw * th * td * nch;
        let src = bytemuck::cast_slice::<f32, u8>(&out);
        let pixels = if cache_format == PixelFormat::F32 {
            Bytes::copy_from_slice(src)
        } else {
            let mut bytes = vec![0u8; count * cache_format.size()];
            convert_elements(src, PixelFormat::F32, &mut bytes, cache_format, count);
            Bytes::from(bytes)
        };
        Ok(Tile::new(
            key,
            pixels,
            cache_format,
            tw as u32,
            th as u32,
            td as u32,
        ))
    }

    // =========================================================================
    // Gather
    // =========================================================================

    /// Copy the requested region into `span`, fetching every tile it
    /// touches. `span` covers exactly `roi`; its channel 0 is
    /// `roi.chbegin`. `cache_channels`, when given and wider than the
    /// request, selects the channel range tiles are stored under.
    pub(crate) fn gather(
        &self,
        rec: &Arc<FileRecord>,
        subimage: u32,
        miplevel: u32,
        roi: Roi,
        span: &mut ImageSpan<'_>,
        cache_channels: Option<(u16, u16)>,
    ) -> Result<(), CacheError> {
        if roi.is_empty() {
            return Err(CacheError::BadRoi(format!(
                "empty region {}x{}x{} ch[{},{})",
                roi.width(),
                roi.height(),
                roi.depth(),
                roi.chbegin,
                roi.chend
            )));
        }
        let sub = rec
            .subimage(subimage)
            .ok_or_else(|| CacheError::BadSubimage {
                name: rec.name().to_string(),
                subimage,
            })?;
        let level = sub
            .levels
            .get(miplevel as usize)
            .ok_or_else(|| CacheError::BadMipLevel {
                name: rec.name().to_string(),
                subimage,
                miplevel,
            })?;
        let spec = level.spec.clone();

        if span.width() != roi.width() as usize
            || span.height() != roi.height() as usize
            || span.depth() != roi.depth() as usize
            || span.nchannels() != roi.nchannels() as usize
        {
            return Err(CacheError::TypeMismatch(format!(
                "span is {}x{}x{} ch{} but the region is {}x{}x{} ch{}",
                span.width(),
                span.height(),
                span.depth(),
                span.nchannels(),
                roi.width(),
                roi.height(),
                roi.depth(),
                roi.nchannels()
            )));
        }

        let clipped = roi.intersection(&spec.roi());
        if clipped != roi {
            // Anything outside the data window reads as zero.
            span.zero();
        }
        if clipped.is_empty() {
            return Ok(());
        }

        // Channel range tiles are stored under: the whole image unless a
        // valid covering subset was requested.
        let (kb, ke) = match cache_channels {
            Some((b, e))
                if b <= clipped.chbegin
                    && e >= clipped.chend
                    && b < e
                    && e <= spec.nchannels =>
            {
                (b, e)
            }
            _ => (0, spec.nchannels),
        };

        let (tw, th, td) = (
            level.tile_width as i32,
            level.tile_height as i32,
            level.tile_depth as i32,
        );
        let nch = (clipped.chend - clipped.chbegin) as usize;
        let mut last: Option<(TileKey, TileRef)> = None;

        let mut tz = LevelInfo::tile_floor(clipped.zbegin, spec.z, td as u32);
        while tz < clipped.zend {
            let mut ty = LevelInfo::tile_floor(clipped.ybegin, spec.y, th as u32);
            while ty < clipped.yend {
                let mut tx = LevelInfo::tile_floor(clipped.xbegin, spec.x, tw as u32);
                while tx < clipped.xend {
                    let key = TileKey {
                        file: rec.id(),
                        subimage,
                        miplevel,
                        x: tx,
                        y: ty,
                        z: tz,
                        chbegin: kb,
                        chend: ke,
                    };
                    let tile = match &last {
                        Some((k, r)) if *k == key => r.clone(),
                        _ => {
                            let r = self.fetch_tile(rec, key)?;
                            last = Some((key, r.clone()));
                            r
                        }
                    };

                    let ix0 = tx.max(clipped.xbegin);
                    let ix1 = (tx + tw).min(clipped.xend);
                    let iy0 = ty.max(clipped.ybegin);
                    let iy1 = (ty + th).min(clipped.yend);
                    let iz0 = tz.max(clipped.zbegin);
                    let iz1 = (tz + td).min(clipped.zend);

                    span.copy_from_buffer(
                        (ix0 - roi.xbegin) as usize,
                        (iy0 - roi.ybegin) as usize,
                        (iz0 - roi.zbegin) as usize,
                        (clipped.chbegin - roi.chbegin) as usize,
                        (ix1 - ix0) as usize,
                        (iy1 - iy0) as usize,
                        (iz1 - iz0) as usize,
                        nch,
                        tile.pixels(),
                        tile.format(),
                        tw as usize,
                        th as usize,
                        (ke - kb) as usize,
                        (ix0 - tx) as usize,
                        (iy0 - ty) as usize,
                        (iz0 - tz) as usize,
                        (clipped.chbegin - kb) as usize,
                    );
                    tx += tw;
                }
                ty += th;
            }
            tz += td;
        }
        Ok(())
    }
}

// =============================================================================
// Decoding helpers
// =============================================================================

fn decode_to_cache_error(name: &str, e: DecodeError) -> CacheError {
    match e {
        DecodeError::Io(io) => CacheError::TransientIo {
            name: name.to_string(),
            reason: io.to_string(),
        },
        other => CacheError::Unreadable {
            name: name.to_string(),
            reason: other.to_string(),
        },
    }
}

/// Fill a virtual tile of a scanline image by reading the covering
/// scanline bands. One virtual tile may pull several bands; bands narrower
/// than the image go through a scratch buffer to extract the x slice.
fn read_scanline_tile(
    decoder: &mut dyn ImageDecoder,
    key: &TileKey,
    spec: &ImageSpec,
    tile_dims: (usize, usize, usize),
    native: &mut [u8],
) -> Result<(), DecodeError> {
    let (tw, th, td) = tile_dims;
    let nch = key.nchannels() as usize;
    let es = spec.format.size();
    let px = nch * es;

    let x0 = key.x.max(spec.x);
    let x1 = (key.x + tw as i32).min(spec.x + spec.width as i32);
    let y0 = key.y.max(spec.y);
    let y1 = (key.y + th as i32).min(spec.y + spec.height as i32);
    let z0 = key.z.max(spec.z);
    let z1 = (key.z + td as i32).min(spec.z + spec.depth as i32);
    if x0 >= x1 || y0 >= y1 || z0 >= z1 {
        return Ok(()); // wholly outside the data window; stays zero
    }

    for z in z0..z1 {
        if tw as i32 == spec.width as i32 && key.x == spec.x {
            // Full-width virtual tile: decode straight into place.
            let row0 = ((z - key.z) as usize * th + (y0 - key.y) as usize) * tw * px;
            let len = (y1 - y0) as usize * tw * px;
            decoder.read_scanlines(
                key.subimage,
                key.miplevel,
                y0,
                y1,
                z,
                key.chbegin,
                key.chend,
                &mut native[row0..row0 + len],
            )?;
        } else {
            let band_w = spec.width as usize;
            let mut band = vec![0u8; (y1 - y0) as usize * band_w * px];
            decoder.read_scanlines(
                key.subimage,
                key.miplevel,
                y0,
                y1,
                z,
                key.chbegin,
                key.chend,
                &mut band,
            )?;
            let copy = (x1 - x0) as usize * px;
            for (ri, y) in (y0..y1).enumerate() {
                let src = (ri * band_w + (x0 - spec.x) as usize) * px;
                let dst = (((z - key.z) as usize * th + (y - key.y) as usize) * tw
                    + (x0 - key.x) as usize)
                    * px;
                native[dst..dst + copy].copy_from_slice(&band[src..src + copy]);
            }
        }
    }
    Ok(())
}

// =============================================================================
// Metadata construction
// =============================================================================

#[derive(Debug)]
pub(crate) struct BuiltSubimages {
    pub infos: Vec<SubimageInfo>,
    pub untiled: bool,
    pub unmipped: bool,
}

/// Translate decoder metadata into the cache's view: cached tile geometry
/// per level plus the synthesized MIP chain when automip applies.
pub(crate) fn build_subimages(
    subs: &[Subimage],
    options: &CacheOptions,
    name: &str,
) -> Result<BuiltSubimages, CacheError> {
    if subs.is_empty() {
        return Err(CacheError::Unreadable {
            name: name.to_string(),
            reason: "file declares no subimages".to_string(),
        });
    }
    let mut infos = Vec::with_capacity(subs.len());
    let mut any_untiled = false;
    let mut any_unmipped = false;
    for sub in subs {
        let Some(first) = sub.levels.first() else {
            return Err(CacheError::Unreadable {
                name: name.to_string(),
                reason: "subimage declares no miplevels".to_string(),
            });
        };
        let untiled = !first.is_tiled();
        if untiled && !options.accept_untiled {
            return Err(CacheError::Untiled(name.to_string()));
        }
        let unmipped = sub.levels.len() == 1 && (first.width > 1 || first.height > 1);
        if unmipped && !options.accept_unmipped {
            return Err(CacheError::Unmipped(name.to_string()));
        }
        any_untiled |= untiled;
        any_unmipped |= unmipped;

        let mut levels: Vec<LevelInfo> = sub
            .levels
            .iter()
            .map(|spec| {
                let (tw, th, td) = cached_tile_dims(spec, options);
                LevelInfo {
                    spec: Arc::new(spec.clone()),
                    tile_width: tw,
                    tile_height: th,
                    tile_depth: td,
                    synthesized: false,
                }
            })
            .collect();

        if options.automip && unmipped {
            let (btw, bth, btd) = (
                levels[0].tile_width,
                levels[0].tile_height,
                levels[0].tile_depth,
            );
            let mut prev = first.clone();
            while prev.width > 1 || prev.height > 1 || prev.depth > 1 {
                let next = downsample_spec(&prev);
                levels.push(LevelInfo {
                    tile_width: btw.min(next.width.max(1)),
                    tile_height: bth.min(next.height.max(1)),
                    tile_depth: btd.min(next.depth.max(1)),
                    spec: Arc::new(next.clone()),
                    synthesized: true,
                });
                prev = next;
            }
        }
        infos.push(SubimageInfo { levels });
    }
    Ok(BuiltSubimages {
        infos,
        untiled: any_untiled,
        unmipped: any_unmipped,
    })
}

/// Tile geometry used for caching a level: the native grid for tiled
/// files, the autotile virtual grid (or the whole image) for scanline
/// files.
fn cached_tile_dims(spec: &ImageSpec, options: &CacheOptions) -> (u32, u32, u32) {
    if spec.is_tiled() {
        return (
            spec.tile_width,
            spec.tile_height,
            spec.tile_depth.max(1),
        );
    }
    let autotile = options.effective_autotile();
    if autotile == 0 {
        return (spec.width.max(1), spec.height.max(1), spec.depth.max(1));
    }
    // The virtual grid is exactly autotile x autotile, or full-width bands
    // of autotile rows under autoscanline.
    let tw = if options.autoscanline {
        spec.width.max(1)
    } else {
        autotile
    };
    (tw, autotile, spec.depth.max(1))
}

/// Next miplevel down: dimensions halve (rounding down, clamped at 1),
/// origins halve toward negative infinity.
fn downsample_spec(prev: &ImageSpec) -> ImageSpec {
    ImageSpec {
        x: prev.x.div_euclid(2),
        y: prev.y.div_euclid(2),
        z: prev.z.div_euclid(2),
        width: (prev.width / 2).max(1),
        height: (prev.height / 2).max(1),
        depth: (prev.depth / 2).max(1),
        full_x: prev.full_x.div_euclid(2),
        full_y: prev.full_y.div_euclid(2),
        full_z: prev.full_z.div_euclid(2),
        full_width: (prev.full_width / 2).max(1),
        full_height: (prev.full_height / 2).max(1),
        full_depth: (prev.full_depth / 2).max(1),
        tile_width: 0,
        tile_height: 0,
        tile_depth: 0,
        nchannels: prev.nchannels,
        format: prev.format,
    }
}
