//! Tilesets ("themes"): imagery source, resolution and tile geometry.
//!
//! The primary backend serves 200x200 pixel tiles addressed by a scale code
//! (`S`) and theme code (`T`). The alternate WMS backend renders 204x204
//! pixel tiles whose outer two pixels overlap the neighbouring tiles; the
//! composer crops that margin.

use serde::Serialize;

/// Edge length, in pixels, of every tile once margins are cropped.
pub const TILE_EDGE_PX: u32 = 200;

/// Which remote server provides a theme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Tile server addressed by tile coordinates, keep-alive connections.
    Primary,
    /// WMS server addressed by a lat/long bounding box, one request per
    /// connection.
    Alternate,
}

impl Backend {
    /// Lowercase name, used in log fields and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Primary => "primary",
            Backend::Alternate => "alternate",
        }
    }
}

/// One tileset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Theme {
    /// Tileset id, as stored in the index.
    pub id: u8,
    /// Short name.
    pub name: &'static str,
    /// Server that provides this tileset.
    pub backend: Backend,
    /// Primary-backend scale code (`S=`).
    pub scale: u8,
    /// Primary-backend theme code (`T=`).
    pub theme_code: u8,
    /// Ground resolution.
    pub meters_per_pixel: f64,
    /// Edge of a downloaded tile, margin included.
    pub edge_px: u32,
    /// Overlap on each side of a downloaded tile.
    pub margin_px: u32,
    /// Ground footprint of one (cropped) tile edge.
    pub tile_meters: u32,
}

macro_rules! theme {
    ($id:expr, $name:expr, primary, $s:expr, $t:expr, $mpp:expr, $tm:expr) => {
        Theme {
            id: $id,
            name: $name,
            backend: Backend::Primary,
            scale: $s,
            theme_code: $t,
            meters_per_pixel: $mpp,
            edge_px: TILE_EDGE_PX,
            margin_px: 0,
            tile_meters: $tm,
        }
    };
    ($id:expr, $name:expr, alternate, $mpp:expr, $tm:expr) => {
        Theme {
            id: $id,
            name: $name,
            backend: Backend::Alternate,
            scale: 0,
            theme_code: 0,
            meters_per_pixel: $mpp,
            edge_px: TILE_EDGE_PX + 4,
            margin_px: 2,
            tile_meters: $tm,
        }
    };
}

pub const AIR_1M: u8 = 0;
pub const AIR_2M: u8 = 1;
pub const AIR_4M: u8 = 2;
pub const AIR_8M: u8 = 3;
pub const AIR_16M: u8 = 4;
pub const AIR_32M: u8 = 5;
pub const AIR_64M: u8 = 6;
pub const TOPO_2M: u8 = 7;
pub const TOPO_4M: u8 = 8;
pub const TOPO_8M: u8 = 9;
pub const TOPO_16M: u8 = 10;
pub const TOPO_32M: u8 = 11;
pub const TOPO_64M: u8 = 12;
pub const URBAN_025M: u8 = 13;
pub const URBAN_05M: u8 = 14;
pub const URBAN_1M: u8 = 15;
pub const LANDSAT_15M: u8 = 16;
pub const LANDSAT_30M: u8 = 17;
pub const LANDSAT_60M: u8 = 18;

/// Every known tileset, indexed by id.
pub static THEMES: [Theme; 19] = [
    theme!(AIR_1M, "air-1m", primary, 10, 1, 1.0, 200),
    theme!(AIR_2M, "air-2m", primary, 11, 1, 2.0, 400),
    theme!(AIR_4M, "air-4m", primary, 12, 1, 4.0, 800),
    theme!(AIR_8M, "air-8m", primary, 13, 1, 8.0, 1600),
    theme!(AIR_16M, "air-16m", primary, 14, 1, 16.0, 3200),
    theme!(AIR_32M, "air-32m", primary, 15, 1, 32.0, 6400),
    theme!(AIR_64M, "air-64m", primary, 16, 1, 64.0, 12800),
    theme!(TOPO_2M, "topo-2m", primary, 11, 2, 2.0, 400),
    theme!(TOPO_4M, "topo-4m", primary, 12, 2, 4.0, 800),
    theme!(TOPO_8M, "topo-8m", primary, 13, 2, 8.0, 1600),
    theme!(TOPO_16M, "topo-16m", primary, 14, 2, 16.0, 3200),
    theme!(TOPO_32M, "topo-32m", primary, 15, 2, 32.0, 6400),
    theme!(TOPO_64M, "topo-64m", primary, 16, 2, 64.0, 12800),
    theme!(URBAN_025M, "urban-0.25m", primary, 8, 4, 0.25, 50),
    theme!(URBAN_05M, "urban-0.5m", primary, 9, 4, 0.5, 100),
    theme!(URBAN_1M, "urban-1m", primary, 10, 4, 1.0, 200),
    theme!(LANDSAT_15M, "landsat-15m", alternate, 15.0, 3000),
    theme!(LANDSAT_30M, "landsat-30m", alternate, 30.0, 6000),
    theme!(LANDSAT_60M, "landsat-60m", alternate, 60.0, 12000),
];

/// Tileset used by a fresh composer.
pub const DEFAULT_THEME: u8 = AIR_1M;

impl Theme {
    /// Look up a theme by tileset id.
    pub fn from_id(id: u8) -> Option<&'static Theme> {
        THEMES.get(usize::from(id))
    }

    /// Look up a theme by its short name.
    pub fn from_name(name: &str) -> Option<&'static Theme> {
        THEMES.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }

    /// All themes.
    pub fn all() -> &'static [Theme] {
        &THEMES
    }
}
