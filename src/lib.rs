//! tilecache - a tiled image cache
//!
//! This library gives many worker threads random access to collections of
//! image files whose total pixel data far exceeds RAM, while keeping both
//! resident memory and open file descriptors under configured ceilings.
//! Pixels are fetched by (filename, subimage, miplevel, region, channels);
//! the cache opens files on demand, decodes only the tiles touched, keeps
//! hot tiles resident, and evicts cold ones as budgets require.
//!
//! # Quick start
//!
//! ```no_run
//! use tilecache::{ImageCache, ImageSpan, Roi};
//!
//! let cache = ImageCache::create(false);
//! cache.attribute("max_memory_MB", 256.0f32);
//! cache.attribute("autotile", 64);
//!
//! let mut pixels = vec![0f32; 64 * 64 * 4];
//! let mut span = ImageSpan::of(&mut pixels, 4, 64, 64).unwrap();
//! let roi = Roi::new_2d(0, 64, 0, 64, 0, 4);
//! if !cache.get_pixels("render.png", 0, 0, roi, &mut span, None) {
//!     eprintln!("read failed: {}", cache.geterror(true));
//! }
//! ```

pub mod attribute;
pub mod cache;
pub mod config;
pub mod error;
pub mod file;
pub mod format;
pub mod perthread;
pub mod span;
pub mod stats;
pub mod tile;
pub mod types;

mod reader;

// Re-export the primary public surface.
pub use attribute::{AttrType, AttrValue};
pub use cache::{ImageCache, ImageHandle};
pub use config::CacheOptions;
pub use error::{CacheError, DecodeError};
pub use file::FileId;
pub use format::{DecoderConfig, DecoderCreator, FileImageDecoder, ImageDecoder, ImageSpec, Subimage};
pub use perthread::Perthread;
pub use span::{ImageSpan, PixelElement};
pub use tile::{TileKey, TileRef};
pub use types::{PixelFormat, Roi};
