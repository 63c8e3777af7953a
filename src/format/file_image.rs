//! Built-in decoder for common raster formats.
//!
//! Backed by the `image` crate: PNG, JPEG, and TIFF sources decode fully at
//! open time and are served as scanline (untiled) images with a single
//! subimage and miplevel. The content fingerprint is the SHA-1 of the raw
//! file bytes, so byte-identical files deduplicate regardless of name.

use std::path::Path;

use bytes::Bytes;
use image::{DynamicImage, GenericImageView};
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::error::DecodeError;
use crate::types::PixelFormat;

use super::{DecoderConfig, ImageDecoder, ImageSpec, Subimage};

pub struct FileImageDecoder {
    format_name: &'static str,
    subimages: Vec<Subimage>,
    /// Decoded pixels, densely interleaved in the native format.
    pixels: Bytes,
    fingerprint: Bytes,
}

impl FileImageDecoder {
    pub fn open(path: &Path, config: &DecoderConfig) -> Result<FileImageDecoder, DecodeError> {
        let raw = std::fs::read(path)?;
        let fingerprint = Bytes::copy_from_slice(&Sha1::digest(&raw));

        let decoded = if config.trust_extensions {
            let fmt = image::ImageFormat::from_path(path)
                .map_err(|e| DecodeError::Unsupported(e.to_string()))?;
            image::load_from_memory_with_format(&raw, fmt)
        } else {
            image::load_from_memory(&raw)
        };
        let img = decoded.map_err(|e| match e {
            image::ImageError::IoError(io) => DecodeError::Io(io),
            other => DecodeError::Corrupt(other.to_string()),
        })?;

        let format_name = image::guess_format(&raw)
            .map(|f| f.to_mime_type())
            .unwrap_or("image");

        let (nchannels, format, pixels): (u16, PixelFormat, Vec<u8>) = match &img {
            DynamicImage::ImageLuma8(b) => (1, PixelFormat::U8, b.as_raw().clone()),
            DynamicImage::ImageLumaA8(b) => (2, PixelFormat::U8, b.as_raw().clone()),
            DynamicImage::ImageRgb8(b) => (3, PixelFormat::U8, b.as_raw().clone()),
            DynamicImage::ImageRgba8(b) => (4, PixelFormat::U8, b.as_raw().clone()),
            DynamicImage::ImageLuma16(b) => (1, PixelFormat::U16, bytemuck::cast_slice(b.as_raw()).to_vec()),
            DynamicImage::ImageLumaA16(b) => (2, PixelFormat::U16, bytemuck::cast_slice(b.as_raw()).to_vec()),
            DynamicImage::ImageRgb16(b) => (3, PixelFormat::U16, bytemuck::cast_slice(b.as_raw()).to_vec()),
            DynamicImage::ImageRgba16(b) => (4, PixelFormat::U16, bytemuck::cast_slice(b.as_raw()).to_vec()),
            DynamicImage::ImageRgb32F(b) => (3, PixelFormat::F32, bytemuck::cast_slice(b.as_raw()).to_vec()),
            DynamicImage::ImageRgba32F(b) => (4, PixelFormat::F32, bytemuck::cast_slice(b.as_raw()).to_vec()),
            other => {
                // Uncommon layouts funnel through an RGBA8 conversion.
                let rgba = other.to_rgba8();
                (4, PixelFormat::U8, rgba.into_raw())
            }
        };

        let spec = ImageSpec::new_2d(img.width(), img.height(), nchannels, format);
        debug!(
            path = %path.display(),
            width = spec.width,
            height = spec.height,
            nchannels,
            format = %format,
            "opened image file"
        );

        Ok(FileImageDecoder {
            format_name,
            subimages: vec![Subimage { levels: vec![spec] }],
            pixels: Bytes::from(pixels),
            fingerprint,
        })
    }

    fn spec(&self) -> &ImageSpec {
        &self.subimages[0].levels[0]
    }
}

impl ImageDecoder for FileImageDecoder {
    fn format_name(&self) -> &str {
        self.format_name
    }

    fn subimages(&self) -> &[Subimage] {
        &self.subimages
    }

    fn read_tile(
        &mut self,
        _subimage: u32,
        _miplevel: u32,
        _x: i32,
        _y: i32,
        _z: i32,
        _chbegin: u16,
        _chend: u16,
        _dest: &mut [u8],
    ) -> Result<(), DecodeError> {
        Err(DecodeError::Unsupported(
            "tiled reads on a scanline image".to_string(),
        ))
    }

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
    ) -> Result<(), DecodeError> {
        if subimage != 0 || miplevel != 0 || z != 0 {
            return Err(DecodeError::Corrupt(format!(
                "no subimage {subimage} miplevel {miplevel} slice {z}"
            )));
        }
        let spec = self.spec().clone();
        if ybegin < 0 || yend > spec.height as i32 || ybegin >= yend {
            return Err(DecodeError::Corrupt(format!(
                "scanline range [{ybegin}, {yend}) out of range"
            )));
        }
        if chbegin >= chend || chend > spec.nchannels {
            return Err(DecodeError::Corrupt(format!(
                "channel range [{chbegin}, {chend}) out of range"
            )));
        }

        let es = spec.format.size();
        let width = spec.width as usize;
        let src_nch = spec.nchannels as usize;
        let nch = (chend - chbegin) as usize;
        let full_range = chbegin == 0 && chend == spec.nchannels;

        let mut out = 0usize;
        for y in ybegin..yend {
            let row = y as usize * width * src_nch;
            if full_range {
                let bytes = width * src_nch * es;
                dest[out..out + bytes]
                    .copy_from_slice(&self.pixels[row * es..row * es + bytes]);
                out += bytes;
            } else {
                for x in 0..width {
                    let px = (row + x * src_nch + chbegin as usize) * es;
                    dest[out..out + nch * es].copy_from_slice(&self.pixels[px..px + nch * es]);
                    out += nch * es;
                }
            }
        }
        Ok(())
    }

    fn fingerprint(&self) -> Option<Bytes> {
        Some(self.fingerprint.clone())
    }
}
