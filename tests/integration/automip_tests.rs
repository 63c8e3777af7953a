//! On-demand MIP synthesis tests.

use std::sync::atomic::Ordering;

use tilecache::{AttrValue, ImageCache, ImageSpan, PixelFormat, Roi};

use super::test_utils::{expected_value, TrackingSource};

fn stat_int(cache: &ImageCache, name: &str) -> i32 {
    match cache.getattribute(name) {
        Some(AttrValue::Int(v)) => v,
        other => panic!("{name} was {other:?}"),
    }
}

/// Direct 4x4 box average of the source at miplevel 2.
fn expected_mip2(x: i32, y: i32, c: usize) -> f32 {
    let mut sum = 0f32;
    for dy in 0..4 {
        for dx in 0..4 {
            sum += expected_value(4 * x + dx, 4 * y + dy, c);
        }
    }
    sum / 16.0
}

#[test]
fn test_synthesized_levels_appear_in_metadata() {
    let cache = ImageCache::create(false);
    cache.attribute("automip", 1);
    let src = TrackingSource::scanline(256, 256, 3, PixelFormat::F32).arc();
    assert!(cache.add_file("mock://mips", Some(src.creator()), None, false));

    assert_eq!(
        cache.get_image_info("mock://mips", 0, 0, "miplevels"),
        Some(AttrValue::Int(9))
    );
    let spec2 = cache.get_imagespec("mock://mips", 0, 2).unwrap();
    assert_eq!((spec2.width, spec2.height), (64, 64));
    let spec8 = cache.get_imagespec("mock://mips", 0, 8).unwrap();
    assert_eq!((spec8.width, spec8.height), (1, 1));
}

#[test]
fn test_mip2_pixels_are_box_averages() {
    let cache = ImageCache::create(false);
    cache.attribute("automip", 1);
    let src = TrackingSource::scanline(256, 256, 3, PixelFormat::F32).arc();
    assert!(cache.add_file("mock://avg", Some(src.creator()), None, false));

    let mut pixels = vec![0f32; 64 * 64 * 3];
    let mut span = ImageSpan::of(&mut pixels, 3, 64, 64).unwrap();
    assert!(cache.get_pixels(
        "mock://avg",
        0,
        2,
        Roi::new_2d(0, 64, 0, 64, 0, 3),
        &mut span,
        None
    ));

    for y in 0..64 {
        for x in 0..64 {
            for c in 0..3 {
                let got = pixels[(y * 64 + x) * 3 + c];
                let want = expected_mip2(x as i32, y as i32, c);
                assert!(
                    (got - want).abs() < 1e-5,
                    "at ({x},{y},{c}): got {got}, want {want}"
                );
            }
        }
    }

    // Only the file's real level was decoded; the synthesized levels came
    // from downsampling, and each intermediate is memoized as a tile.
    assert!(src.tile_reads.load(Ordering::SeqCst) == 0);
    assert!(src.scanline_reads.load(Ordering::SeqCst) >= 1);
    // Levels 0, 1, 2 as whole-image tiles.
    assert_eq!(stat_int(&cache, "stat:tiles_created"), 3);

    // A second read is served entirely from cache.
    let reads = src.scanline_reads.load(Ordering::SeqCst);
    let mut pixels2 = vec![0f32; 64 * 64 * 3];
    let mut span2 = ImageSpan::of(&mut pixels2, 3, 64, 64).unwrap();
    assert!(cache.get_pixels(
        "mock://avg",
        0,
        2,
        Roi::new_2d(0, 64, 0, 64, 0, 3),
        &mut span2,
        None
    ));
    assert_eq!(src.scanline_reads.load(Ordering::SeqCst), reads);
    assert_eq!(stat_int(&cache, "stat:tiles_created"), 3);
}

#[test]
fn test_smallest_level_averages_everything() {
    let cache = ImageCache::create(false);
    cache.attribute("automip", 1);
    let src = TrackingSource::scanline(16, 16, 1, PixelFormat::F32).arc();
    assert!(cache.add_file("mock://onepix", Some(src.creator()), None, false));

    let mut pixel = vec![0f32; 1];
    let mut span = ImageSpan::of(&mut pixel, 1, 1, 1).unwrap();
    assert!(cache.get_pixels(
        "mock://onepix",
        0,
        4,
        Roi::new_2d(0, 1, 0, 1, 0, 1),
        &mut span,
        None
    ));
    let mut want = 0f32;
    for y in 0..16 {
        for x in 0..16 {
            want += expected_value(x, y, 0);
        }
    }
    want /= 256.0;
    assert!((pixel[0] - want).abs() < 1e-4, "got {}, want {want}", pixel[0]);
}

#[test]
fn test_missing_miplevel_without_automip_is_error() {
    let cache = ImageCache::create(false);
    let src = TrackingSource::scanline(64, 64, 3, PixelFormat::F32).arc();
    assert!(cache.add_file("mock://nomip", Some(src.creator()), None, false));

    let mut pixels = vec![0f32; 32 * 32 * 3];
    let mut span = ImageSpan::of(&mut pixels, 3, 32, 32).unwrap();
    assert!(!cache.get_pixels(
        "mock://nomip",
        0,
        1,
        Roi::new_2d(0, 32, 0, 32, 0, 3),
        &mut span,
        None
    ));
    assert!(cache.geterror(true).contains("miplevel 1"));
}

#[test]
fn test_automip_with_autotile_grid() {
    let cache = ImageCache::create(false);
    cache.attribute("automip", 1);
    cache.attribute("autotile", 32);
    let src = TrackingSource::scanline(128, 128, 1, PixelFormat::F32).arc();
    assert!(cache.add_file("mock://mt", Some(src.creator()), None, false));

    // Mip 1 is 64x64 on a 32-pixel grid: four tiles.
    let mut pixels = vec![0f32; 64 * 64];
    let mut span = ImageSpan::of(&mut pixels, 1, 64, 64).unwrap();
    assert!(cache.get_pixels(
        "mock://mt",
        0,
        1,
        Roi::new_2d(0, 64, 0, 64, 0, 1),
        &mut span,
        None
    ));
    for y in 0..64 {
        for x in 0..64 {
            let want = (expected_value(2 * x, 2 * y, 0)
                + expected_value(2 * x + 1, 2 * y, 0)
                + expected_value(2 * x, 2 * y + 1, 0)
                + expected_value(2 * x + 1, 2 * y + 1, 0))
                / 4.0;
            let got = pixels[(y * 64 + x) as usize];
            assert!((got - want).abs() < 1e-6, "at ({x},{y})");
        }
    }
}
