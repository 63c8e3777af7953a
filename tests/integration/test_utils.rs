//! Test utilities for integration tests.
//!
//! Provides a mock decoder source with request tracking (for verifying
//! open/read patterns) and helpers for writing real image files to a
//! scratch directory.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use tilecache::{
    DecodeError, DecoderCreator, ImageDecoder, ImageSpec, PixelFormat, Subimage,
};

/// Install a test logger once per process; `RUST_LOG` filters as usual.
pub fn init_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

// =============================================================================
// Deterministic pixel values
// =============================================================================

/// The value a mock image stores at (x, y, channel), as a normalized
/// float. Chosen so u8 storage round-trips exactly (k/255 with k < 251).
pub fn expected_value(x: i32, y: i32, c: usize) -> f32 {
    ((x * 7 + y * 13 + c as i32 * 31).rem_euclid(251)) as f32 / 255.0
}

// =============================================================================
// Tracking mock source
// =============================================================================

/// Describes a mock image and counts every decoder interaction, shared by
/// all decoders its creator produces.
pub struct TrackingSource {
    spec: ImageSpec,
    fingerprint: Option<Bytes>,
    pub opens: AtomicUsize,
    pub tile_reads: AtomicUsize,
    pub scanline_reads: AtomicUsize,
    /// Countdown of injected transient read failures.
    pub fail_reads: AtomicUsize,
}

impl TrackingSource {
    pub fn scanline(
        width: u32,
        height: u32,
        nchannels: u16,
        format: PixelFormat,
    ) -> TrackingSource {
        TrackingSource {
            spec: ImageSpec::new_2d(width, height, nchannels, format),
            fingerprint: None,
            opens: AtomicUsize::new(0),
            tile_reads: AtomicUsize::new(0),
            scanline_reads: AtomicUsize::new(0),
            fail_reads: AtomicUsize::new(0),
        }
    }

    pub fn tiled(
        width: u32,
        height: u32,
        nchannels: u16,
        format: PixelFormat,
        tile: u32,
    ) -> TrackingSource {
        TrackingSource {
            spec: ImageSpec::new_2d(width, height, nchannels, format).with_tiles(tile, tile),
            ..TrackingSource::scanline(width, height, nchannels, format)
        }
    }

    pub fn fingerprinted(mut self, fp: &[u8]) -> TrackingSource {
        self.fingerprint = Some(Bytes::copy_from_slice(fp));
        self
    }

    pub fn arc(self) -> Arc<TrackingSource> {
        Arc::new(self)
    }

    /// A decoder factory handing out decoders backed by this source.
    pub fn creator(self: &Arc<TrackingSource>) -> DecoderCreator {
        let src = self.clone();
        Arc::new(move |_path, _config| {
            src.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockDecoder {
                src: src.clone(),
                subimages: vec![Subimage {
                    levels: vec![src.spec.clone()],
                }],
            }) as Box<dyn ImageDecoder>)
        })
    }

    fn check_injected_failure(&self) -> Result<(), DecodeError> {
        loop {
            let n = self.fail_reads.load(Ordering::SeqCst);
            if n == 0 {
                return Ok(());
            }
            if self
                .fail_reads
                .compare_exchange(n, n - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Err(DecodeError::Io(std::io::Error::new(
                    std::io::ErrorKind::Interrupted,
                    "injected transient failure",
                )));
            }
        }
    }
}

struct MockDecoder {
    src: Arc<TrackingSource>,
    subimages: Vec<Subimage>,
}

impl MockDecoder {
    fn spec(&self) -> &ImageSpec {
        &self.subimages[0].levels[0]
    }
}

impl ImageDecoder for MockDecoder {
    fn format_name(&self) -> &str {
        "mock"
    }

    fn subimages(&self) -> &[Subimage] {
        &self.subimages
    }

    fn read_tile(
        &mut self,
        _subimage: u32,
        _miplevel: u32,
        x: i32,
        y: i32,
        _z: i32,
        chbegin: u16,
        chend: u16,
        dest: &mut [u8],
    ) -> Result<(), DecodeError> {
        self.src.check_injected_failure()?;
        self.src.tile_reads.fetch_add(1, Ordering::SeqCst);
        let spec = self.spec().clone();
        let (tw, th) = (spec.tile_width as i32, spec.tile_height as i32);
        let nch = (chend - chbegin) as usize;
        for j in 0..th {
            for i in 0..tw {
                let (px, py) = (x + i, y + j);
                let inside = px >= spec.x
                    && px < spec.x + spec.width as i32
                    && py >= spec.y
                    && py < spec.y + spec.height as i32;
                for c in 0..nch {
                    let v = if inside {
                        expected_value(px, py, chbegin as usize + c)
                    } else {
                        0.0
                    };
                    spec.format
                        .write_f32(dest, (j * tw + i) as usize * nch + c, v);
                }
            }
        }
        Ok(())
    }

    fn read_scanlines(
        &mut self,
        _subimage: u32,
        _miplevel: u32,
        ybegin: i32,
        yend: i32,
        _z: i32,
        chbegin: u16,
        chend: u16,
        dest: &mut [u8],
    ) -> Result<(), DecodeError> {
        self.src.check_injected_failure()?;
        self.src.scanline_reads.fetch_add(1, Ordering::SeqCst);
        let spec = self.spec().clone();
        let width = spec.width as i32;
        let nch = (chend - chbegin) as usize;
        for (row, y) in (ybegin..yend).enumerate() {
            for x in 0..width {
                for c in 0..nch {
                    let v = expected_value(spec.x + x, y, chbegin as usize + c);
                    spec.format.write_f32(
                        dest,
                        (row * width as usize + x as usize) * nch + c,
                        v,
                    );
                }
            }
        }
        Ok(())
    }

    fn fingerprint(&self) -> Option<Bytes> {
        self.src.fingerprint.clone()
    }
}

// =============================================================================
// Real files on disk
// =============================================================================

/// Write a small RGB PNG whose pixel at (x, y) is (x, y, seed), returning
/// its path in the scratch directory.
pub fn write_png(name: &str, width: u32, height: u32, seed: u8) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("tilecache-it-{}-{}", std::process::id(), name));
    let img = image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([x as u8, y as u8, seed])
    });
    img.save_with_format(&path, image::ImageFormat::Png)
        .expect("write test png");
    path
}

pub fn remove_file(path: &std::path::Path) {
    std::fs::remove_file(path).ok();
}
