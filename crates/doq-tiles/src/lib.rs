//! # doq-tiles
//!
//! Disk-backed cache of georeferenced imagery tiles, and a composer that
//! stitches them into digital orthoquads around a UTM position.
//!
//! ## Overview
//!
//! Tiles are 200x200 pixel squares keyed by grid column, grid row, tileset
//! and UTM zone. They come from two HTTP backends:
//! - the primary tile server (aerial, topographic and urban imagery at
//!   0.25 to 64 meters per pixel)
//! - an alternate WMS server (Landsat mosaic at 15, 30 and 60 meters per
//!   pixel, served with a two pixel margin)
//!
//! Downloaded tiles are appended to shard files (`Maps0.dat`, `Maps1.dat`,
//! ...) in a cache directory, indexed by `MapIndex.dat`. A cached tile that
//! no longer decodes is invalidated and downloaded again.
//!
//! ## Examples
//!
//! ### Fetching single tiles
//!
//! ```no_run
//! use doq_tiles::{CacheConfig, TileKey, TileManager, AIR_1M};
//!
//! let config = CacheConfig {
//!     cache_dir: Some("tile_cache".into()),
//!     ..CacheConfig::default()
//! };
//! let manager = TileManager::open(&config)?;
//!
//! // Downloads on the first call, reads from disk afterwards
//! let key = TileKey::new(2500, 18000, AIR_1M, 12);
//! let grid = manager.lock().get_or_fetch(&key)?;
//! assert_eq!(grid.dimensions(), (200, 200));
//! # Ok::<(), doq_tiles::TileError>(())
//! ```
//!
//! ### Composing an orthoquad
//!
//! ```no_run
//! use doq_tiles::{CacheConfig, RasterComposer, TileManager, UtmPoint, TOPO_2M};
//!
//! let mut manager = TileManager::open(&CacheConfig::default())?;
//! let mut composer = RasterComposer::new(1000);
//! composer.select_theme(TOPO_2M)?;
//!
//! let center = UtmPoint::new(511_000.0, 3_566_000.0, 12);
//! composer.fill(&mut manager, &center)?;
//! println!("gray level at center: {}", composer.read_abs_point(&center)?);
//! # Ok::<(), doq_tiles::TileError>(())
//! ```

mod cache;
mod composer;
mod config;
mod decode;
mod error;
mod fetcher;
mod geo;
pub mod http;
mod index;
mod key;
mod manager;
mod retry;
mod store;
pub mod theme;

pub use cache::{TileCache, TileProvider};
pub use composer::{aerial_image, gray_level, topographic_detail, RasterComposer, Window};
pub use config::{BackendConfig, CacheConfig, NetworkConfig, ProxyConfig, RetryConfig, TransportKind};
pub use decode::{decode_gif, decode_jpeg, decode_tile, PixelGrid};
pub use error::{DecodeError, FetchError, StoreError, TileError};
pub use fetcher::{ClientTransport, NetworkFetcher, SocketTransport, Target, TileFetch, Transport};
pub use geo::{utm_to_lat_long, UtmPoint};
pub use index::{IndexEntry, TileIndex, INDEX_MAGIC, INITIAL_CAPACITY, RECORD_LEN};
pub use key::TileKey;
pub use manager::{run_exit_cleanup, TileManager};
pub use retry::{RecordingSleeper, RetryPolicy, Sleeper, ThreadSleeper};
pub use store::{
    shard_file_name, tile_header, ShardStats, StoreFormat, StoreOptions, StoreStats, TileStore,
    DEFAULT_SHARD_LIMIT, INDEX_FILE,
};
pub use theme::{
    Backend, Theme, AIR_16M, AIR_1M, AIR_2M, AIR_32M, AIR_4M, AIR_64M, AIR_8M, DEFAULT_THEME,
    LANDSAT_15M, LANDSAT_30M, LANDSAT_60M, TILE_EDGE_PX, TOPO_16M, TOPO_2M, TOPO_32M, TOPO_4M,
    TOPO_64M, TOPO_8M, URBAN_025M, URBAN_05M, URBAN_1M,
};

/// Result type for tile cache operations.
pub type Result<T> = std::result::Result<T, TileError>;
