//! Pixel-path integration tests: cold reads, conversion, clipping,
//! channel handling, tile pinning, and tile injection.

use tilecache::{AttrValue, ImageCache, ImageSpan, PixelFormat, Roi};

use super::test_utils::{expected_value, remove_file, write_png, TrackingSource};

fn stat_int(cache: &ImageCache, name: &str) -> i32 {
    match cache.getattribute(name) {
        Some(AttrValue::Int(v)) => v,
        other => panic!("{name} was {other:?}"),
    }
}

// =============================================================================
// Cold reads
// =============================================================================

#[test]
fn test_cold_read_scanline_whole_image() {
    let cache = ImageCache::create(false);
    let src = TrackingSource::scanline(64, 64, 4, PixelFormat::F32).arc();
    assert!(cache.add_file("mock://cold", Some(src.creator()), None, false));

    let mut pixels = vec![0f32; 64 * 64 * 4];
    let mut span = ImageSpan::of(&mut pixels, 4, 64, 64).unwrap();
    let roi = Roi::new_2d(0, 64, 0, 64, 0, 4);
    assert!(cache.get_pixels("mock://cold", 0, 0, roi, &mut span, None));

    for y in 0..64 {
        for x in 0..64 {
            for c in 0..4 {
                let got = pixels[(y * 64 + x) * 4 + c];
                assert_eq!(got, expected_value(x as i32, y as i32, c), "at ({x},{y},{c})");
            }
        }
    }
    // One whole-image virtual tile, one open file.
    assert_eq!(stat_int(&cache, "stat:tiles_created"), 1);
    assert_eq!(stat_int(&cache, "stat:tiles_current"), 1);
    assert_eq!(stat_int(&cache, "stat:open_files_current"), 1);
    assert!(!cache.has_error());
}

#[test]
fn test_cold_read_real_png() {
    let path = write_png("cold.png", 16, 8, 200);
    let name = path.to_string_lossy().to_string();
    let cache = ImageCache::create(false);

    let mut pixels = vec![0u8; 16 * 8 * 3];
    let mut span = ImageSpan::of(&mut pixels, 3, 16, 8).unwrap();
    let roi = Roi::new_2d(0, 16, 0, 8, 0, 3);
    assert!(cache.get_pixels(&name, 0, 0, roi, &mut span, None));
    for y in 0..8u32 {
        for x in 0..16u32 {
            let p = ((y * 16 + x) * 3) as usize;
            assert_eq!(&pixels[p..p + 3], &[x as u8, y as u8, 200]);
        }
    }
    remove_file(&path);
}

#[test]
fn test_u8_source_converted_to_float() {
    let cache = ImageCache::create(false);
    let src = TrackingSource::scanline(8, 8, 3, PixelFormat::U8).arc();
    assert!(cache.add_file("mock://conv", Some(src.creator()), None, false));

    let mut pixels = vec![0f32; 8 * 8 * 3];
    let mut span = ImageSpan::of(&mut pixels, 3, 8, 8).unwrap();
    assert!(cache.get_pixels(
        "mock://conv",
        0,
        0,
        Roi::new_2d(0, 8, 0, 8, 0, 3),
        &mut span,
        None
    ));
    for y in 0..8 {
        for x in 0..8 {
            for c in 0..3 {
                assert_eq!(pixels[(y * 8 + x) * 3 + c], expected_value(x as i32, y as i32, c));
            }
        }
    }
}

// =============================================================================
// Autotile and clipping
// =============================================================================

#[test]
fn test_autotile_subrect_across_tiles() {
    let cache = ImageCache::create(false);
    cache.attribute("autotile", 16);
    let src = TrackingSource::scanline(64, 64, 3, PixelFormat::F32).arc();
    assert!(cache.add_file("mock://sub", Some(src.creator()), None, false));

    // A 20x20 region straddling four 16x16 virtual tiles.
    let roi = Roi::new_2d(10, 30, 10, 30, 0, 3);
    let mut pixels = vec![0f32; 20 * 20 * 3];
    let mut span = ImageSpan::of(&mut pixels, 3, 20, 20).unwrap();
    assert!(cache.get_pixels("mock://sub", 0, 0, roi, &mut span, None));

    for y in 0..20 {
        for x in 0..20 {
            for c in 0..3 {
                assert_eq!(
                    pixels[(y * 20 + x) * 3 + c],
                    expected_value(x as i32 + 10, y as i32 + 10, c)
                );
            }
        }
    }
    assert_eq!(stat_int(&cache, "stat:tiles_created"), 4);
    // The decoder was driven by scanline bands, not native tiles.
    assert!(src.scanline_reads.load(std::sync::atomic::Ordering::SeqCst) >= 4);
}

#[test]
fn test_roi_outside_data_window_reads_zero() {
    let cache = ImageCache::create(false);
    let src = TrackingSource::scanline(16, 16, 1, PixelFormat::F32).arc();
    assert!(cache.add_file("mock://clip", Some(src.creator()), None, false));

    // Request extends 4 pixels past the right/bottom edges.
    let roi = Roi::new_2d(12, 20, 12, 20, 0, 1);
    let mut pixels = vec![9f32; 8 * 8];
    let mut span = ImageSpan::of(&mut pixels, 1, 8, 8).unwrap();
    assert!(cache.get_pixels("mock://clip", 0, 0, roi, &mut span, None));

    for y in 0..8 {
        for x in 0..8 {
            let (ix, iy) = (x + 12, y + 12);
            let want = if ix < 16 && iy < 16 {
                expected_value(ix, iy, 0)
            } else {
                0.0
            };
            assert_eq!(pixels[(y * 8 + x) as usize], want, "at ({ix},{iy})");
        }
    }
}

#[test]
fn test_negative_ystride_destination() {
    let cache = ImageCache::create(false);
    let src = TrackingSource::scanline(4, 4, 1, PixelFormat::F32).arc();
    assert!(cache.add_file("mock://flip", Some(src.creator()), None, false));

    let mut bytes = vec![0u8; 16 * 4];
    {
        let es = 4isize;
        let mut span = ImageSpan::with_strides(
            &mut bytes,
            PixelFormat::F32,
            1,
            4,
            4,
            1,
            es,
            es,
            -4 * es, // bottom-up rows
            16 * es,
        )
        .unwrap();
        assert!(cache.get_pixels(
            "mock://flip",
            0,
            0,
            Roi::new_2d(0, 4, 0, 4, 0, 1),
            &mut span,
            None
        ));
    }
    // Row y of the image lands at buffer row (3 - y).
    let read = |i: usize| {
        f32::from_ne_bytes([bytes[i * 4], bytes[i * 4 + 1], bytes[i * 4 + 2], bytes[i * 4 + 3]])
    };
    for y in 0..4 {
        for x in 0..4 {
            assert_eq!(read(((3 - y) * 4 + x) as usize), expected_value(x, y, 0));
        }
    }
}

#[test]
fn test_channel_subset_gather() {
    let cache = ImageCache::create(false);
    let src = TrackingSource::scanline(8, 4, 4, PixelFormat::F32).arc();
    assert!(cache.add_file("mock://chans", Some(src.creator()), None, false));

    // Only channels [1, 3).
    let roi = Roi::new_2d(0, 8, 0, 4, 1, 3);
    let mut pixels = vec![0f32; 8 * 4 * 2];
    let mut span = ImageSpan::of(&mut pixels, 2, 8, 4).unwrap();
    assert!(cache.get_pixels("mock://chans", 0, 0, roi, &mut span, None));
    for y in 0..4 {
        for x in 0..8 {
            for (slot, c) in (1..3).enumerate() {
                assert_eq!(
                    pixels[(y * 8 + x) * 2 + slot],
                    expected_value(x as i32, y as i32, c)
                );
            }
        }
    }
}

#[test]
fn test_span_geometry_mismatch_fails() {
    let cache = ImageCache::create(false);
    let src = TrackingSource::scanline(8, 8, 1, PixelFormat::F32).arc();
    assert!(cache.add_file("mock://geom", Some(src.creator()), None, false));

    let mut pixels = vec![0f32; 4 * 4];
    let mut span = ImageSpan::of(&mut pixels, 1, 4, 4).unwrap();
    // ROI is 8x8 but the span covers 4x4.
    assert!(!cache.get_pixels(
        "mock://geom",
        0,
        0,
        Roi::new_2d(0, 8, 0, 8, 0, 1),
        &mut span,
        None
    ));
    assert!(cache.geterror(true).contains("span"));
}

// =============================================================================
// Tiles
// =============================================================================

#[test]
fn test_get_tile_pin_and_microcache() {
    let cache = ImageCache::create(false);
    cache.attribute("autotile", 16);
    let src = TrackingSource::scanline(64, 64, 3, PixelFormat::F32).arc();
    assert!(cache.add_file("mock://tile", Some(src.creator()), None, false));

    let t1 = cache.get_tile("mock://tile", 0, 0, 20, 20, 0, None).unwrap();
    // Any coordinate inside the same tile returns the same tile.
    let t2 = cache.get_tile("mock://tile", 0, 0, 31, 31, 0, None).unwrap();
    assert_eq!(t1.key(), t2.key());
    assert_eq!(stat_int(&cache, "stat:tiles_created"), 1);

    let roi = cache.tile_roi(&t1);
    assert_eq!((roi.xbegin, roi.xend, roi.ybegin, roi.yend), (16, 32, 16, 32));
    let (pixels, format) = cache.tile_pixels(&t1);
    assert_eq!(format, PixelFormat::F32);
    assert_eq!(pixels.len(), 16 * 16 * 3 * 4);

    cache.release_tile(t1);
    cache.release_tile(t2);

    // Out-of-window coordinates fail cleanly.
    assert!(cache.get_tile("mock://tile", 0, 0, 99, 0, 0, None).is_none());
    assert!(cache.geterror(true).contains("outside"));
}

#[test]
fn test_add_tile_round_trip() {
    let cache = ImageCache::create(false);
    let src = TrackingSource::scanline(16, 16, 1, PixelFormat::F32).arc();
    assert!(cache.add_file("mock://rt", Some(src.creator()), None, false));

    let roi = Roi::new_2d(0, 16, 0, 16, 0, 1);
    let mut first = vec![0f32; 16 * 16];
    let mut span = ImageSpan::of(&mut first, 1, 16, 16).unwrap();
    assert!(cache.get_pixels("mock://rt", 0, 0, roi, &mut span, None));

    // Re-inject the same pixels (whole-image tile at the origin).
    let data: Vec<u8> = first.iter().flat_map(|v| v.to_ne_bytes()).collect();
    assert!(cache.add_tile(
        "mock://rt",
        0,
        0,
        0,
        0,
        0,
        None,
        PixelFormat::F32,
        bytes::Bytes::from(data)
    ));

    let mut second = vec![0f32; 16 * 16];
    let mut span = ImageSpan::of(&mut second, 1, 16, 16).unwrap();
    assert!(cache.get_pixels("mock://rt", 0, 0, roi, &mut span, None));
    assert_eq!(first, second);
}

#[test]
fn test_add_tile_rejects_bad_geometry() {
    let cache = ImageCache::create(false);
    cache.attribute("autotile", 16);
    let src = TrackingSource::scanline(64, 64, 1, PixelFormat::F32).arc();
    assert!(cache.add_file("mock://badtile", Some(src.creator()), None, false));

    // Not a tile origin.
    assert!(!cache.add_tile(
        "mock://badtile",
        0,
        0,
        3,
        0,
        0,
        None,
        PixelFormat::F32,
        bytes::Bytes::from(vec![0u8; 16 * 16 * 4])
    ));
    assert!(cache.geterror(true).contains("tile origin"));

    // Wrong byte count.
    assert!(!cache.add_tile(
        "mock://badtile",
        0,
        0,
        0,
        0,
        0,
        None,
        PixelFormat::F32,
        bytes::Bytes::from(vec![0u8; 7])
    ));
    assert!(cache.geterror(true).contains("expected"));
}

// =============================================================================
// Metadata
// =============================================================================

#[test]
fn test_spec_and_cache_dimensions() {
    let cache = ImageCache::create(false);
    cache.attribute("autotile", 16);
    cache.attribute("forcefloat", 1);
    let src = TrackingSource::scanline(100, 50, 3, PixelFormat::U8).arc();
    assert!(cache.add_file("mock://spec", Some(src.creator()), None, false));

    let spec = cache.get_imagespec("mock://spec", 0, 0).unwrap();
    assert_eq!((spec.width, spec.height, spec.nchannels), (100, 50, 3));
    assert_eq!(spec.format, PixelFormat::U8);
    assert!(!spec.is_tiled());

    let dims = cache.get_cache_dimensions("mock://spec", 0, 0).unwrap();
    assert_eq!((dims.tile_width, dims.tile_height), (16, 16));
    assert_eq!(dims.format, PixelFormat::F32); // forcefloat

    let handle = cache.get_image_handle("mock://spec", None).unwrap();
    assert!(cache.good(&handle));
    assert_eq!(cache.filename_from_handle(&handle), "mock://spec");
    let shared = cache.imagespec_handle(&handle, 0, 0).unwrap();
    assert_eq!(shared.width, 100);
    assert_eq!(
        cache.tile_dimensions_handle(&handle, 0, 0),
        Some((16, 16, 1))
    );
}

#[test]
fn test_get_image_info_queries() {
    let cache = ImageCache::create(false);
    let src = TrackingSource::scanline(32, 16, 3, PixelFormat::U8).arc();
    assert!(cache.add_file("mock://info", Some(src.creator()), None, false));

    assert_eq!(
        cache.get_image_info("mock://info", 0, 0, "exists"),
        Some(AttrValue::Int(1))
    );
    assert_eq!(
        cache.get_image_info("mock://info", 0, 0, "channels"),
        Some(AttrValue::Int(3))
    );
    assert_eq!(
        cache.get_image_info("mock://info", 0, 0, "resolution"),
        Some(AttrValue::IntVec(vec![32, 16]))
    );
    assert_eq!(
        cache.get_image_info("mock://info", 0, 0, "datawindow"),
        Some(AttrValue::IntVec(vec![0, 0, 32, 16]))
    );
    assert_eq!(
        cache.get_image_info("mock://info", 0, 0, "format"),
        Some(AttrValue::Str("uint8".to_string()))
    );
    assert!(cache.get_image_info("mock://info", 0, 0, "nonsense").is_none());
    assert!(cache.geterror(true).contains("nonsense"));
}

// =============================================================================
// Failure retries
// =============================================================================

#[test]
fn test_transient_failure_without_retries_fails() {
    let cache = ImageCache::create(false);
    let src = TrackingSource::scanline(8, 8, 1, PixelFormat::F32).arc();
    assert!(cache.add_file("mock://flaky0", Some(src.creator()), None, false));
    src.fail_reads.store(1, std::sync::atomic::Ordering::SeqCst);

    let mut pixels = vec![0f32; 64];
    let mut span = ImageSpan::of(&mut pixels, 1, 8, 8).unwrap();
    assert!(!cache.get_pixels(
        "mock://flaky0",
        0,
        0,
        Roi::new_2d(0, 8, 0, 8, 0, 1),
        &mut span,
        None
    ));
    assert!(cache.geterror(true).contains("transient"));
}

#[test]
fn test_transient_failure_retried_after_reopen() {
    let cache = ImageCache::create(false);
    cache.attribute("failure_retries", 1);
    let src = TrackingSource::scanline(8, 8, 1, PixelFormat::F32).arc();
    assert!(cache.add_file("mock://flaky1", Some(src.creator()), None, false));
    let opens_before = src.opens.load(std::sync::atomic::Ordering::SeqCst);
    src.fail_reads.store(1, std::sync::atomic::Ordering::SeqCst);

    let mut pixels = vec![0f32; 64];
    let mut span = ImageSpan::of(&mut pixels, 1, 8, 8).unwrap();
    assert!(cache.get_pixels(
        "mock://flaky1",
        0,
        0,
        Roi::new_2d(0, 8, 0, 8, 0, 1),
        &mut span,
        None
    ));
    assert!(!cache.has_error());
    // The retry closed and reopened the file.
    assert_eq!(
        src.opens.load(std::sync::atomic::Ordering::SeqCst),
        opens_before + 1
    );
    assert_eq!(pixels[9], expected_value(1, 1, 0));
}
