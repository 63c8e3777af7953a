//! Invalidation tests: modification-time gating, forced drops, and the
//! distinction between closing and invalidating.

use tilecache::{AttrValue, ImageCache, ImageSpan, Roi};

use super::test_utils::{remove_file, write_png};

fn stat_int(cache: &ImageCache, name: &str) -> i32 {
    match cache.getattribute(name) {
        Some(AttrValue::Int(v)) => v,
        other => panic!("{name} was {other:?}"),
    }
}

fn read_pixel(cache: &ImageCache, name: &str, x: i32, y: i32) -> Option<[u8; 3]> {
    let mut pixels = vec![0u8; 3];
    let mut span = ImageSpan::of(&mut pixels, 3, 1, 1).unwrap();
    let roi = Roi::new_2d(x, x + 1, y, y + 1, 0, 3);
    if cache.get_pixels(name, 0, 0, roi, &mut span, None) {
        Some([pixels[0], pixels[1], pixels[2]])
    } else {
        None
    }
}

#[test]
fn test_unforced_invalidate_skips_unchanged_file() {
    let path = write_png("unchanged.png", 8, 8, 10);
    let name = path.to_string_lossy().to_string();
    let cache = ImageCache::create(false);

    assert_eq!(read_pixel(&cache, &name, 2, 3), Some([2, 3, 10]));
    assert_eq!(stat_int(&cache, "stat:tiles_created"), 1);

    cache.invalidate(&name, false);
    // Nothing changed on disk, so the cached tile survived.
    assert_eq!(stat_int(&cache, "stat:tiles_current"), 1);
    assert_eq!(read_pixel(&cache, &name, 2, 3), Some([2, 3, 10]));
    assert_eq!(stat_int(&cache, "stat:tiles_created"), 1);
    remove_file(&path);
}

#[test]
fn test_forced_invalidate_drops_tiles() {
    let path = write_png("forced.png", 8, 8, 20);
    let name = path.to_string_lossy().to_string();
    let cache = ImageCache::create(false);

    assert!(read_pixel(&cache, &name, 0, 0).is_some());
    assert_eq!(stat_int(&cache, "stat:tiles_current"), 1);

    cache.invalidate(&name, true);
    assert_eq!(stat_int(&cache, "stat:tiles_current"), 0);

    // A new read decodes again.
    assert!(read_pixel(&cache, &name, 0, 0).is_some());
    assert_eq!(stat_int(&cache, "stat:tiles_created"), 2);
    remove_file(&path);
}

#[test]
fn test_modified_file_picked_up_by_unforced_invalidate_all() {
    let path = write_png("modified.png", 8, 8, 30);
    let name = path.to_string_lossy().to_string();
    let cache = ImageCache::create(false);

    assert_eq!(read_pixel(&cache, &name, 1, 1), Some([1, 1, 30]));
    let spec = cache.get_imagespec(&name, 0, 0).unwrap();
    assert_eq!((spec.width, spec.height), (8, 8));

    // Rewrite the file with different content and geometry; make sure the
    // timestamp moves past filesystem granularity.
    std::thread::sleep(std::time::Duration::from_millis(25));
    remove_file(&path);
    let path2 = write_png("modified.png", 12, 6, 99);
    assert_eq!(path2, path);

    cache.invalidate_all(false);
    let spec = cache.get_imagespec(&name, 0, 0).unwrap();
    assert_eq!((spec.width, spec.height), (12, 6));
    assert_eq!(read_pixel(&cache, &name, 1, 1), Some([1, 1, 99]));
    remove_file(&path);
}

#[test]
fn test_invalidate_all_forced_empties_cache() {
    let cache = ImageCache::create(false);
    let a = write_png("all-a.png", 8, 8, 1);
    let b = write_png("all-b.png", 8, 8, 2);
    let an = a.to_string_lossy().to_string();
    let bn = b.to_string_lossy().to_string();
    assert!(read_pixel(&cache, &an, 0, 0).is_some());
    assert!(read_pixel(&cache, &bn, 0, 0).is_some());
    assert_eq!(stat_int(&cache, "stat:tiles_current"), 2);
    assert_eq!(stat_int(&cache, "stat:open_files_current"), 2);

    cache.invalidate_all(true);
    assert_eq!(stat_int(&cache, "stat:tiles_current"), 0);
    assert_eq!(stat_int(&cache, "stat:open_files_current"), 0);
    assert_eq!(
        cache.getattribute("stat:cache_memory_used"),
        Some(AttrValue::Int64(0))
    );
    // Records persist; reads work again.
    assert!(read_pixel(&cache, &an, 0, 0).is_some());
    remove_file(&a);
    remove_file(&b);
}

#[test]
fn test_outstanding_ref_survives_invalidation() {
    let cache = ImageCache::create(false);
    let path = write_png("held.png", 8, 8, 40);
    let name = path.to_string_lossy().to_string();

    let tile = cache.get_tile(&name, 0, 0, 0, 0, 0, None).unwrap();
    cache.invalidate(&name, true);
    // The pinned tile is flagged but its pixels stay readable until the
    // final release.
    assert!(!tile.is_valid());
    assert_eq!(tile.pixels().len(), 8 * 8 * 3);
    cache.release_tile(tile);
    assert_eq!(stat_int(&cache, "stat:tiles_current"), 0);
    remove_file(&path);
}

#[test]
fn test_exists_query_after_deletion() {
    let path = write_png("gone.png", 8, 8, 50);
    let name = path.to_string_lossy().to_string();
    let cache = ImageCache::create(false);
    assert_eq!(
        cache.get_image_info(&name, 0, 0, "exists"),
        Some(AttrValue::Int(1))
    );

    remove_file(&path);
    cache.invalidate(&name, true);
    assert_eq!(
        cache.get_image_info(&name, 0, 0, "exists"),
        Some(AttrValue::Int(0))
    );
    assert!(!cache.has_error());
}
