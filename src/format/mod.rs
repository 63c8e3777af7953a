//! Format decoder contract.
//!
//! This module defines the [`ImageDecoder`] trait, the seam between the
//! cache core and image formats. A decoder exposes per-subimage,
//! per-miplevel metadata ([`ImageSpec`]) and reads pixel data either by
//! tile or by scanline range, always in the file's native pixel format.
//!
//! Decoders are created on demand when a file is first touched and closed
//! whenever the open-file budget requires it; a closed file keeps its
//! metadata and cached tiles and is simply reopened on the next miss.

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::DecodeError;
use crate::types::PixelFormat;

mod file_image;

pub use file_image::FileImageDecoder;

// =============================================================================
// Image Spec
// =============================================================================

/// Geometry and storage metadata for one miplevel of one subimage.
///
/// The data window (`x`, `y`, `z`, `width`, `height`, `depth`) is where
/// pixels actually exist; the full (display) window is advisory metadata.
/// `tile_width == 0` marks a scanline (untiled) image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSpec {
    /// Data window origin.
    pub x: i32,
    pub y: i32,
    pub z: i32,
    /// Data window size in pixels.
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    /// Full (display) window origin.
    pub full_x: i32,
    pub full_y: i32,
    pub full_z: i32,
    /// Full (display) window size.
    pub full_width: u32,
    pub full_height: u32,
    pub full_depth: u32,
    /// Native tile size; 0 means scanline organization.
    pub tile_width: u32,
    pub tile_height: u32,
    pub tile_depth: u32,
    pub nchannels: u16,
    /// Native pixel format.
    pub format: PixelFormat,
}

impl ImageSpec {
    /// A 2D spec with data and display windows coincident at the origin.
    pub fn new_2d(width: u32, height: u32, nchannels: u16, format: PixelFormat) -> ImageSpec {
        ImageSpec {
            x: 0,
            y: 0,
            z: 0,
            width,
            height,
            depth: 1,
            full_x: 0,
            full_y: 0,
            full_z: 0,
            full_width: width,
            full_height: height,
            full_depth: 1,
            tile_width: 0,
            tile_height: 0,
            tile_depth: 0,
            nchannels,
            format,
        }
    }

    /// Builder-style helper to mark the spec tiled.
    pub fn with_tiles(mut self, tile_width: u32, tile_height: u32) -> ImageSpec {
        self.tile_width = tile_width;
        self.tile_height = tile_height;
        self.tile_depth = 1;
        self
    }

    pub fn is_tiled(&self) -> bool {
        self.tile_width > 0
    }

    /// Number of pixels in the data window.
    pub fn image_pixels(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.depth as u64
    }

    /// Uncompressed byte size of the data window in the native format.
    pub fn image_bytes(&self) -> u64 {
        self.image_pixels() * self.nchannels as u64 * self.format.size() as u64
    }

    /// The data window as a region of interest.
    pub fn roi(&self) -> crate::types::Roi {
        crate::types::Roi {
            xbegin: self.x,
            xend: self.x + self.width as i32,
            ybegin: self.y,
            yend: self.y + self.height as i32,
            zbegin: self.z,
            zend: self.z + self.depth as i32,
            chbegin: 0,
            chend: self.nchannels,
        }
    }
}

// =============================================================================
// Decoder Contract
// =============================================================================

/// One subimage of a file: a stack of miplevels, highest resolution first.
#[derive(Debug, Clone)]
pub struct Subimage {
    pub levels: Vec<ImageSpec>,
}

/// Hints passed to a decoder when a file is opened.
#[derive(Debug, Clone, Default)]
pub struct DecoderConfig {
    /// Leave alpha unassociated (do not premultiply) if the file stores it
    /// that way.
    pub unassociated_alpha: bool,
    /// Pick the decoder by file extension instead of sniffing content.
    pub trust_extensions: bool,
    /// Color space to assume for files that do not declare one.
    pub colorspace: String,
}

/// Format-agnostic interface for reading pixels from an image file.
///
/// Implementations decode into the caller-provided destination in the
/// file's **native** pixel format for the requested channel range, densely
/// interleaved. The cache performs any format conversion afterwards.
///
/// A decoder is driven from behind a per-file lock and need not be
/// internally synchronized, but it must be `Send` so files can migrate
/// between worker threads.
pub trait ImageDecoder: Send {
    /// Short format name, e.g. `"png"`.
    fn format_name(&self) -> &str;

    /// All subimages with their miplevel stacks.
    fn subimages(&self) -> &[Subimage];

    /// Read one native tile. `x`, `y`, `z` are the tile's origin on the
    /// file's native tile grid (absolute pixel coordinates).
    #[allow(clippy::too_many_arguments)]
    fn read_tile(
        &mut self,
        subimage: u32,
        miplevel: u32,
        x: i32,
        y: i32,
        z: i32,
        chbegin: u16,
        chend: u16,
        dest: &mut [u8],
    ) -> Result<(), DecodeError>;

    /// Read the scanline range `[ybegin, yend)` of slice `z`. Only used
    /// for untiled images.
    #[allow(clippy::too_many_arguments)]
    fn read_scanlines(
        &mut self,
        subimage: u32,
        miplevel: u32,
        ybegin: i32,
        yend: i32,
        z: i32,
        chbegin: u16,
        chend: u16,
        dest: &mut [u8],
    ) -> Result<(), DecodeError>;

    /// Content fingerprint recorded in the file, if any. Byte-identical
    /// sources must produce equal fingerprints.
    fn fingerprint(&self) -> Option<Bytes> {
        None
    }

    /// Reduced-resolution preview stored in the file, if any.
    fn thumbnail(&mut self, _subimage: u32) -> Option<(ImageSpec, Bytes)> {
        None
    }
}

/// Factory for decoders, used by `add_file` to inject synthetic sources
/// and by tests to mock file I/O.
pub type DecoderCreator =
    Arc<dyn Fn(&Path, &DecoderConfig) -> Result<Box<dyn ImageDecoder>, DecodeError> + Send + Sync>;

/// Open a decoder for `path` using the built-in format support.
pub fn open_decoder(
    path: &Path,
    config: &DecoderConfig,
) -> Result<Box<dyn ImageDecoder>, DecodeError> {
    Ok(Box::new(FileImageDecoder::open(path, config)?))
}
