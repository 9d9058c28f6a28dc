//! Integration tests for the cache facade and the raster composer, with
//! mock fetchers standing in for the network.

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use doq_tiles::{
    FetchError, PixelGrid, RasterComposer, RecordingSleeper, RetryPolicy, StoreOptions, TileCache,
    TileError, TileFetch, TileKey, TileProvider, TileStore, UtmPoint, AIR_1M,
};
use image::{ImageFormat, Rgb, RgbImage};
use tempfile::{tempdir, TempDir};

fn encode(edge: u32, format: ImageFormat) -> Vec<u8> {
    let img = RgbImage::from_fn(edge, edge, |x, y| Rgb([x as u8, y as u8, 90]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, format).unwrap();
    out.into_inner()
}

fn response(content_type: &str, body: &[u8], declared: usize) -> Vec<u8> {
    let mut raw = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
        content_type, declared
    )
    .into_bytes();
    raw.extend_from_slice(body);
    raw
}

/// Serves the same canned response for every key and counts calls.
struct CountingFetcher {
    response: Option<Vec<u8>>,
    calls: Arc<AtomicUsize>,
}

impl TileFetch for CountingFetcher {
    fn fetch(&mut self, _key: &TileKey) -> Result<Vec<u8>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.response.clone().ok_or(FetchError::ClosedBeforeHeaders)
    }
}

struct Fixture {
    _dir: TempDir,
    cache: TileCache<CountingFetcher>,
    calls: Arc<AtomicUsize>,
    sleeper: RecordingSleeper,
}

fn fixture(response: Option<Vec<u8>>, max_attempts: u32) -> Fixture {
    let dir = tempdir().unwrap();
    let store = TileStore::open(dir.path(), StoreOptions::default()).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let sleeper = RecordingSleeper::new();
    let fetcher = CountingFetcher {
        response,
        calls: calls.clone(),
    };
    let policy = RetryPolicy {
        max_attempts,
        delay: Duration::from_secs(10),
    };
    let cache = TileCache::new(store, fetcher, policy).with_sleeper(sleeper.clone());
    Fixture {
        _dir: dir,
        cache,
        calls,
        sleeper,
    }
}

fn jpeg_tile() -> Vec<u8> {
    let body = encode(200, ImageFormat::Jpeg);
    response("image/jpeg", &body, body.len())
}

const KEY: TileKey = TileKey::new(10, 20, AIR_1M, 12);

#[test]
fn test_gif_response_decodes_to_tile_edge() {
    let body = encode(200, ImageFormat::Gif);
    let mut fx = fixture(Some(response("image/gif", &body, body.len())), 3);
    let grid = fx.cache.get_or_fetch(&KEY).unwrap();
    assert_eq!(grid.dimensions(), (200, 200));
    assert_eq!(fx.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_gif_length_mismatch_rejected() {
    let body = encode(200, ImageFormat::Gif);
    let mut fx = fixture(Some(response("image/gif", &body, body.len() - 1)), 3);
    match fx.cache.get_or_fetch(&KEY) {
        Err(TileError::RetriesExhausted { attempts, last, .. }) => {
            assert_eq!(attempts, 3);
            assert!(matches!(*last, TileError::Decode(_)));
        }
        other => panic!("expected rejection, got {:?}", other.map(|g| g.dimensions())),
    }
    assert!(!fx.cache.store().contains(&KEY).unwrap());
}

#[test]
fn test_invalidate_triggers_exactly_one_fetch() {
    let mut fx = fixture(Some(jpeg_tile()), 3);
    fx.cache.get_or_fetch(&KEY).unwrap();
    fx.cache.get_or_fetch(&KEY).unwrap();
    assert_eq!(fx.calls.load(Ordering::SeqCst), 1);

    fx.cache.invalidate(&KEY).unwrap();
    fx.cache.invalidate(&KEY).unwrap();
    fx.cache.get_or_fetch(&KEY).unwrap();
    fx.cache.get_or_fetch(&KEY).unwrap();
    assert_eq!(fx.calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_stored_bytes_are_the_downloaded_response() {
    let raw = jpeg_tile();
    let mut fx = fixture(Some(raw.clone()), 3);
    fx.cache.get_or_fetch(&KEY).unwrap();
    assert_eq!(fx.cache.store_mut().read(&KEY).unwrap(), Some(raw));
}

/// Counts provider calls on top of a cache.
struct Counting<'a> {
    inner: &'a mut TileCache<CountingFetcher>,
    lookups: usize,
}

impl TileProvider for Counting<'_> {
    fn tile(&mut self, key: &TileKey) -> doq_tiles::Result<PixelGrid> {
        self.lookups += 1;
        self.inner.tile(key)
    }

    fn invalidate_tiles(&mut self, keys: &[TileKey]) -> doq_tiles::Result<()> {
        self.inner.invalidate_tiles(keys)
    }
}

#[test]
fn test_second_fill_is_free() {
    let mut fx = fixture(Some(jpeg_tile()), 3);
    let mut composer = RasterComposer::new(200);
    let center = UtmPoint::new(500_100.0, 3_600_100.0, 12);

    let mut provider = Counting {
        inner: &mut fx.cache,
        lookups: 0,
    };
    composer.fill(&mut provider, &center).unwrap();
    let span = composer.window().unwrap().span() as usize;
    assert_eq!(provider.lookups, span * span);
    assert_eq!(fx.calls.load(Ordering::SeqCst), span * span);

    composer.fill(&mut provider, &center).unwrap();
    assert_eq!(provider.lookups, span * span);
    assert_eq!(fx.calls.load(Ordering::SeqCst), span * span);
}

#[test]
fn test_fill_fails_when_every_fetch_fails() {
    let mut fx = fixture(None, 3);
    let mut composer = RasterComposer::new(200);
    let center = UtmPoint::new(500_100.0, 3_600_100.0, 12);

    let err = composer.fill(&mut fx.cache, &center).unwrap_err();
    assert!(matches!(err, TileError::RetriesExhausted { attempts: 3, .. }));
    assert!(!composer.is_ready());
    assert!(matches!(composer.read(0.0, 0.0), Err(TileError::NotFilled)));
    assert!(matches!(composer.as_gray_image(), Err(TileError::NotFilled)));

    // The first tile used the whole budget, nothing further was tried
    assert_eq!(fx.calls.load(Ordering::SeqCst), 3);
    assert_eq!(fx.sleeper.naps(), vec![Duration::from_secs(10); 2]);
}

#[test]
fn test_refill_downloads_window_again() {
    let mut fx = fixture(Some(jpeg_tile()), 3);
    let mut composer = RasterComposer::new(200);
    let center = UtmPoint::new(500_100.0, 3_600_100.0, 12);

    composer.fill(&mut fx.cache, &center).unwrap();
    let first = fx.calls.load(Ordering::SeqCst);
    composer.refill(&mut fx.cache, &center).unwrap();
    assert_eq!(fx.calls.load(Ordering::SeqCst), 2 * first);

    let stats = fx.cache.store().stats().unwrap();
    assert_eq!(stats.tombstones, first);
    assert_eq!(stats.live, first);
}
