//! Tile identity, pixel storage, and the pinning protocol.
//!
//! # Tile Key
//!
//! Tiles are identified by a composite key: the owning file, subimage,
//! miplevel, the tile-aligned origin on the *cached* tile grid (which may
//! be a virtual grid imposed on scanline files), and the stored channel
//! range. All fields participate in equality and hashing.
//!
//! # Pinning
//!
//! A [`TileRef`] is a scoped guard over a cached tile: constructing one
//! increments the tile's pin count, dropping it decrements. A tile with a
//! nonzero pin count is never evicted, so the pixels behind any live
//! `TileRef` stay valid without copying.

pub mod cache;

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::file::FileId;
use crate::types::{PixelFormat, Roi};

// =============================================================================
// Tile Key
// =============================================================================

/// Unique identity of one cached tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileKey {
    pub file: FileId,
    pub subimage: u32,
    pub miplevel: u32,
    /// Tile origin, aligned to the cached tile grid.
    pub x: i32,
    pub y: i32,
    pub z: i32,
    /// Stored channel range. (0, nchannels) when all channels are cached.
    pub chbegin: u16,
    pub chend: u16,
}

impl TileKey {
    pub fn nchannels(&self) -> u16 {
        self.chend - self.chbegin
    }
}

// =============================================================================
// Tile
// =============================================================================

/// A resident cached tile: full tile-sized pixel block, densely
/// interleaved, zero-padded where it extends past the data window.
pub struct Tile {
    key: TileKey,
    pixels: Bytes,
    format: PixelFormat,
    width: u32,
    height: u32,
    depth: u32,
    /// Number of `TileRef` guards outstanding.
    pins: AtomicI32,
    /// Second-chance bit: set on every lookup, cleared by the clock hand.
    used: AtomicBool,
    /// Cleared when the owning file is invalidated.
    valid: AtomicBool,
}

impl Tile {
    /// Wrap a pixel block. `pixels` must be exactly
    /// `width × height × depth × nchannels` elements of `format`.
    pub fn new(
        key: TileKey,
        pixels: Bytes,
        format: PixelFormat,
        width: u32,
        height: u32,
        depth: u32,
    ) -> Arc<Tile> {
        debug_assert_eq!(
            pixels.len(),
            width as usize
                * height as usize
                * depth as usize
                * key.nchannels() as usize
                * format.size()
        );
        Arc::new(Tile {
            key,
            pixels,
            format,
            width,
            height,
            depth,
            pins: AtomicI32::new(0),
            used: AtomicBool::new(true),
            valid: AtomicBool::new(true),
        })
    }

    pub fn key(&self) -> &TileKey {
        &self.key
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// The pixel region this tile covers.
    pub fn roi(&self) -> Roi {
        Roi {
            xbegin: self.key.x,
            xend: self.key.x + self.width as i32,
            ybegin: self.key.y,
            yend: self.key.y + self.height as i32,
            zbegin: self.key.z,
            zend: self.key.z + self.depth as i32,
            chbegin: self.key.chbegin,
            chend: self.key.chend,
        }
    }

    /// Bytes charged against the memory budget.
    pub fn byte_size(&self) -> usize {
        self.pixels.len() + std::mem::size_of::<Tile>()
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub(crate) fn mark_invalid(&self) {
        self.valid.store(false, Ordering::Release);
    }

    pub(crate) fn mark_used(&self) {
        self.used.store(true, Ordering::Relaxed);
    }

    /// Clear the second-chance bit, returning its previous value.
    pub(crate) fn take_used(&self) -> bool {
        self.used.swap(false, Ordering::Relaxed)
    }

    pub(crate) fn pin_count(&self) -> i32 {
        self.pins.load(Ordering::Acquire)
    }
}

// =============================================================================
// TileRef
// =============================================================================

/// Scoped pin on a cached tile. Cloning adds a pin; dropping releases one.
pub struct TileRef {
    tile: Arc<Tile>,
}

impl TileRef {
    pub(crate) fn pin(tile: &Arc<Tile>) -> TileRef {
        tile.pins.fetch_add(1, Ordering::AcqRel);
        TileRef { tile: tile.clone() }
    }

    pub fn key(&self) -> &TileKey {
        self.tile.key()
    }

    pub fn pixels(&self) -> &[u8] {
        self.tile.pixels()
    }

    pub fn format(&self) -> PixelFormat {
        self.tile.format()
    }

    pub fn roi(&self) -> Roi {
        self.tile.roi()
    }

    /// False once the owning file has been invalidated; the pixels remain
    /// readable until this guard drops, but should not be reused.
    pub fn is_valid(&self) -> bool {
        self.tile.is_valid()
    }

    pub(crate) fn tile(&self) -> &Arc<Tile> {
        &self.tile
    }
}

impl Clone for TileRef {
    fn clone(&self) -> TileRef {
        TileRef::pin(&self.tile)
    }
}

impl Drop for TileRef {
    fn drop(&mut self) {
        self.tile.pins.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for TileRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileRef")
            .field("key", self.tile.key())
            .field("pins", &self.tile.pin_count())
            .finish()
    }
}
