//! Tile identity.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::theme::Theme;
use crate::{Result, TileError};

/// Identity of one square tile: grid column, grid row, tileset and UTM zone.
///
/// `x` and `y` are in units of the tileset's tile footprint, so tile `(x, y)`
/// has its southwest corner at easting `x * tile_meters`, northing
/// `y * tile_meters`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileKey {
    /// Grid column (easting / tile size).
    pub x: i32,
    /// Grid row (northing / tile size).
    pub y: i32,
    /// Tileset (theme) id.
    pub tileset: u8,
    /// UTM zone.
    pub zone: i8,
}

impl TileKey {
    /// Create a new tile key.
    pub const fn new(x: i32, y: i32, tileset: u8, zone: i8) -> Self {
        Self { x, y, tileset, zone }
    }

    /// The key with `x`, `y` and `zone` negated, as written over an
    /// invalidated index record.
    pub const fn tombstone(&self) -> Self {
        Self {
            x: self.x.wrapping_neg(),
            y: self.y.wrapping_neg(),
            tileset: self.tileset,
            zone: self.zone.wrapping_neg(),
        }
    }

    /// Theme of this key's tileset.
    pub fn theme(&self) -> Result<&'static Theme> {
        Theme::from_id(self.tileset).ok_or(TileError::UnknownTileset(self.tileset))
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(x={}, y={}, s={}, z={})",
            self.x, self.y, self.tileset, self.zone
        )
    }
}
