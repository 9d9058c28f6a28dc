//! Mosaic of tiles around a UTM center.
//!
//! The raster is a square RGB buffer three tiles wider than the requested
//! edge. Filling it computes a window of tile indices around the center and
//! blits every tile of the window, row by row from north to south, into the
//! raster. Row 0, column 0 of the raster is the northwest corner.

use image::{imageops, GrayImage, Luma, Rgb, RgbImage};
use tracing::{debug, info};

use doq_metrics::metric_defs;

use crate::cache::TileProvider;
use crate::geo::UtmPoint;
use crate::key::TileKey;
use crate::theme::{Theme, AIR_1M, DEFAULT_THEME, TILE_EDGE_PX, TOPO_2M};
use crate::{Result, TileError};

/// Tile-index position of a filled raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    /// Tile column of the western edge.
    pub left: i64,
    /// Tile row of the northern edge.
    pub top: i64,
    pub zone: i8,
    /// Tiles from the center tile to each edge.
    pub radius: i64,
}

impl Window {
    /// Window of `radius` tiles around the tile containing `center`.
    pub fn around(center: &UtmPoint, tile_meters: u32, radius: i64) -> Self {
        let tm = f64::from(tile_meters);
        Self {
            left: (center.easting / tm) as i64 - radius,
            top: (center.northing / tm) as i64 + radius,
            zone: center.zone,
            radius,
        }
    }

    /// Tiles per side.
    pub fn span(&self) -> i64 {
        2 * self.radius + 1
    }

    /// Grid positions in fill order: north to south, west to east.
    pub fn positions(&self) -> impl Iterator<Item = (i64, i64)> + '_ {
        let span = self.span();
        (0..span).flat_map(move |row| (0..span).map(move |col| (self.left + col, self.top - row)))
    }

    /// Keys for every tile of the window.
    pub fn keys(&self, tileset: u8) -> Result<Vec<TileKey>> {
        self.positions()
            .map(|(x, y)| tile_key(x, y, tileset, self.zone))
            .collect()
    }
}

fn tile_key(x: i64, y: i64, tileset: u8, zone: i8) -> Result<TileKey> {
    match (i32::try_from(x), i32::try_from(y)) {
        (Ok(x), Ok(y)) => Ok(TileKey::new(x, y, tileset, zone)),
        _ => Err(TileError::OutOfBounds {
            easting: x,
            northing: y,
        }),
    }
}

/// Grayscale level of a color pixel: the rounded mean of its channels.
pub fn gray_level(px: &Rgb<u8>) -> u8 {
    let [r, g, b] = px.0;
    let sum = f64::from(r) + f64::from(g) + f64::from(b);
    (0.5 + sum / 3.0) as u8
}

/// Square raster assembled from tiles of one theme.
#[derive(Debug)]
pub struct RasterComposer {
    theme: &'static Theme,
    raster: RgbImage,
    window: Option<Window>,
}

impl RasterComposer {
    /// Composer able to show at least `edge_px` pixels around any center.
    pub fn new(edge_px: u32) -> Self {
        let side = edge_px.saturating_add(3 * TILE_EDGE_PX);
        Self {
            theme: &crate::theme::THEMES[usize::from(DEFAULT_THEME)],
            raster: RgbImage::new(side, side),
            window: None,
        }
    }

    pub fn theme(&self) -> &'static Theme {
        self.theme
    }

    /// Switch to tileset `id`, returning the previous one.
    ///
    /// A change of tileset leaves the raster unfilled.
    pub fn select_theme(&mut self, id: u8) -> Result<u8> {
        let theme = Theme::from_id(id).ok_or(TileError::UnknownTileset(id))?;
        let old = self.theme.id;
        if theme.id != old {
            debug!(from = old, to = theme.id, "switching theme");
            self.theme = theme;
            self.window = None;
        }
        Ok(old)
    }

    pub fn meters_per_pixel(&self) -> f64 {
        self.theme.meters_per_pixel
    }

    /// Ground width of the raster.
    pub fn width(&self) -> f64 {
        f64::from(self.raster.width()) * self.meters_per_pixel()
    }

    /// Ground height of the raster.
    pub fn height(&self) -> f64 {
        f64::from(self.raster.height()) * self.meters_per_pixel()
    }

    /// Tiles of the current theme needed to span `meters`.
    pub fn num_tiles_to_cover(&self, meters: u64) -> u64 {
        meters.div_ceil(u64::from(self.theme.tile_meters))
    }

    /// Tiles from the center tile to each edge of the window.
    pub fn radius(&self) -> i64 {
        let width = self.num_tiles_to_cover(self.width() as u64);
        let height = self.num_tiles_to_cover(self.height() as u64);
        (width.max(height) / 2) as i64
    }

    /// Window a fill around `center` would cover.
    pub fn window_for(&self, center: &UtmPoint) -> Window {
        Window::around(center, self.theme.tile_meters, self.radius())
    }

    pub fn window(&self) -> Option<&Window> {
        self.window.as_ref()
    }

    pub fn is_ready(&self) -> bool {
        self.window.is_some()
    }

    /// Load the window around `center` into the raster.
    ///
    /// Refilling the window already shown does nothing. On failure the
    /// raster is left unfilled.
    pub fn fill<P: TileProvider + ?Sized>(&mut self, provider: &mut P, center: &UtmPoint) -> Result<()> {
        let target = self.window_for(center);
        if self.window == Some(target) {
            metrics::counter!(metric_defs::COMPOSER_MEMO_HITS.name).increment(1);
            debug!(left = target.left, top = target.top, "window already filled");
            return Ok(());
        }

        self.window = None;
        let theme = self.theme;
        let margin = theme.margin_px;
        for (row, col, key) in self.window_tiles(&target)? {
            let tile = provider.tile(&key)?;
            let tile = if margin > 0 {
                imageops::crop_imm(&tile, margin, margin, TILE_EDGE_PX, TILE_EDGE_PX).to_image()
            } else {
                tile
            };
            let px = col * i64::from(TILE_EDGE_PX);
            let py = row * i64::from(TILE_EDGE_PX);
            imageops::replace(&mut self.raster, &tile, px, py);
        }

        info!(
            easting = center.easting,
            northing = center.northing,
            zone = center.zone,
            theme = theme.name,
            tiles = target.span() * target.span(),
            "filled raster"
        );
        metrics::counter!(metric_defs::COMPOSER_FILLS.name).increment(1);
        self.window = Some(target);
        Ok(())
    }

    /// Invalidate every tile of the window around `center`, then fill it.
    pub fn refill<P: TileProvider + ?Sized>(&mut self, provider: &mut P, center: &UtmPoint) -> Result<()> {
        let target = self.window_for(center);
        let keys = target.keys(self.theme.id)?;
        provider.invalidate_tiles(&keys)?;
        self.window = None;
        self.fill(provider, center)
    }

    fn window_tiles(&self, window: &Window) -> Result<Vec<(i64, i64, TileKey)>> {
        window
            .positions()
            .map(|(x, y)| {
                let key = tile_key(x, y, self.theme.id, window.zone)?;
                Ok((window.top - y, x - window.left, key))
            })
            .collect()
    }

    fn filled(&self) -> Result<&Window> {
        self.window.as_ref().ok_or(TileError::NotFilled)
    }

    /// Easting of the western edge, in meters.
    pub fn left(&self) -> Result<i64> {
        Ok(self.filled()?.left * i64::from(self.theme.tile_meters))
    }

    /// Northing of the northern edge, in meters.
    pub fn top(&self) -> Result<i64> {
        Ok(self.filled()?.top * i64::from(self.theme.tile_meters))
    }

    pub fn zone(&self) -> Result<i8> {
        Ok(self.filled()?.zone)
    }

    /// Ground position of the middle of the raster.
    pub fn center(&self) -> Result<UtmPoint> {
        let zone = self.zone()?;
        Ok(UtmPoint::new(
            self.left()? as f64 + self.width() / 2.0,
            self.top()? as f64 - self.height() / 2.0,
            zone,
        ))
    }

    /// Color at `(x_m, y_m)` meters east and south of the northwest corner.
    pub fn read_color(&self, x_m: f64, y_m: f64) -> Result<Rgb<u8>> {
        self.filled()?;
        let ppm = 1.0 / self.meters_per_pixel();
        let col = (x_m * ppm).floor();
        let row = (y_m * ppm).floor();
        let inside = col >= 0.0
            && row >= 0.0
            && col < f64::from(self.raster.width())
            && row < f64::from(self.raster.height());
        if !inside {
            return Err(TileError::OutOfBounds {
                easting: x_m as i64,
                northing: y_m as i64,
            });
        }
        Ok(*self.raster.get_pixel(col as u32, row as u32))
    }

    /// Grayscale level at `(x_m, y_m)` meters from the northwest corner.
    pub fn read(&self, x_m: f64, y_m: f64) -> Result<u8> {
        self.read_color(x_m, y_m).map(|px| gray_level(&px))
    }

    /// Color at an absolute easting and northing in the filled zone.
    pub fn read_abs_color(&self, easting: i64, northing: i64) -> Result<Rgb<u8>> {
        let (left, top) = (self.left()?, self.top()?);
        if easting < left || top < northing {
            return Err(TileError::OutOfBounds { easting, northing });
        }
        self.read_color((easting - left) as f64, (top - northing) as f64)
            .map_err(|_| TileError::OutOfBounds { easting, northing })
    }

    /// Grayscale level at an absolute easting and northing in the filled zone.
    pub fn read_abs(&self, easting: i64, northing: i64) -> Result<u8> {
        self.read_abs_color(easting, northing).map(|px| gray_level(&px))
    }

    /// Grayscale level at `point`, rounded to the nearest meter.
    pub fn read_abs_point(&self, point: &UtmPoint) -> Result<u8> {
        let zone = self.zone()?;
        if point.zone != zone {
            return Err(TileError::ZoneMismatch {
                expected: zone,
                actual: point.zone,
            });
        }
        self.read_abs(
            (point.easting + 0.5).floor() as i64,
            (point.northing + 0.5).floor() as i64,
        )
    }

    /// The raster as grayscale levels.
    pub fn as_gray_image(&self) -> Result<GrayImage> {
        self.filled()?;
        Ok(GrayImage::from_fn(self.raster.width(), self.raster.height(), |x, y| {
            Luma([gray_level(self.raster.get_pixel(x, y))])
        }))
    }

    /// The color raster, regardless of fill state.
    pub fn raster(&self) -> &RgbImage {
        &self.raster
    }
}

/// Grayscale aerial image, one meter per pixel, with its northwest corner
/// at `nw`. Row 0 is north.
pub fn aerial_image<P: TileProvider + ?Sized>(
    provider: &mut P,
    nw: &UtmPoint,
    width: u32,
    height: u32,
) -> Result<GrayImage> {
    let mut composer = RasterComposer::new(width.max(height));
    composer.select_theme(AIR_1M)?;
    let center = nw.offset(f64::from(width / 2), -f64::from(height / 2));
    composer.fill(provider, &center)?;

    let mut out = GrayImage::new(width, height);
    for (c, r, px) in out.enumerate_pixels_mut() {
        let at = nw.offset(f64::from(c), -f64::from(r));
        *px = Luma([composer.read_abs(at.easting as i64, at.northing as i64)?]);
    }
    Ok(out)
}

/// Color topographic map detail, two meters per pixel, with its northwest
/// corner at `nw`.
pub fn topographic_detail<P: TileProvider + ?Sized>(
    provider: &mut P,
    nw: &UtmPoint,
    width_px: u32,
    height_px: u32,
) -> Result<RgbImage> {
    let mut composer = RasterComposer::new(width_px.max(height_px));
    composer.select_theme(TOPO_2M)?;
    let mpp = composer.meters_per_pixel();
    let center = nw.offset(0.5 * mpp * f64::from(width_px), -0.5 * mpp * f64::from(height_px));
    composer.fill(provider, &center)?;

    let mut out = RgbImage::new(width_px, height_px);
    for (c, r, px) in out.enumerate_pixels_mut() {
        let easting = nw.easting as i64 + (mpp * f64::from(c)) as i64;
        let northing = nw.northing as i64 - (mpp * f64::from(r)) as i64;
        *px = composer.read_abs_color(easting, northing)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::theme::LANDSAT_15M;

    /// Serves tiles colored by grid position and counts every call.
    #[derive(Default)]
    struct Painter {
        calls: Vec<TileKey>,
        invalidated: Vec<TileKey>,
        fail: bool,
    }

    const MARGIN: Rgb<u8> = Rgb([255, 255, 255]);

    fn color_of(key: &TileKey) -> Rgb<u8> {
        Rgb([(key.x % 256) as u8, (key.y % 256) as u8, key.tileset])
    }

    impl TileProvider for Painter {
        fn tile(&mut self, key: &TileKey) -> Result<RgbImage> {
            self.calls.push(*key);
            if self.fail {
                return Err(TileError::NotFilled);
            }
            let theme = key.theme()?;
            let (edge, m) = (theme.edge_px, theme.margin_px);
            let inner = m..edge - m;
            Ok(RgbImage::from_fn(edge, edge, |x, y| {
                if inner.contains(&x) && inner.contains(&y) {
                    color_of(key)
                } else {
                    MARGIN
                }
            }))
        }

        fn invalidate_tiles(&mut self, keys: &[TileKey]) -> Result<()> {
            self.invalidated.extend_from_slice(keys);
            Ok(())
        }
    }

    const CENTER: UtmPoint = UtmPoint::new(500_100.0, 3_600_100.0, 12);

    #[test]
    fn test_window_geometry() {
        let composer = RasterComposer::new(200);
        assert_eq!(composer.width(), 800.0);
        assert_eq!(composer.num_tiles_to_cover(800), 4);
        assert_eq!(composer.num_tiles_to_cover(801), 5);
        assert_eq!(composer.radius(), 2);

        let w = composer.window_for(&CENTER);
        assert_eq!(w.left, 2500 - 2);
        assert_eq!(w.top, 18000 + 2);
        assert_eq!(w.span(), 5);
    }

    #[test]
    fn test_fill_is_row_major_and_memoized() {
        let mut composer = RasterComposer::new(200);
        let mut painter = Painter::default();
        composer.fill(&mut painter, &CENTER).unwrap();
        assert_eq!(painter.calls.len(), 25);
        assert_eq!((painter.calls[0].x, painter.calls[0].y), (2498, 18002));
        assert_eq!((painter.calls[1].x, painter.calls[1].y), (2499, 18002));
        assert_eq!((painter.calls[5].x, painter.calls[5].y), (2498, 18001));

        composer.fill(&mut painter, &CENTER).unwrap();
        assert_eq!(painter.calls.len(), 25);
        assert!(composer.is_ready());
    }

    #[test]
    fn test_reads_hit_the_right_tile() {
        let mut composer = RasterComposer::new(200);
        composer.fill(&mut Painter::default(), &CENTER).unwrap();
        assert_eq!(composer.left().unwrap(), 2498 * 200);
        assert_eq!(composer.top().unwrap(), 18002 * 200);

        let expected = color_of(&TileKey::new(2498, 18002, AIR_1M, 12));
        assert_eq!(composer.read_color(0.0, 0.0).unwrap(), expected);

        // second row, third column
        let px = composer.read_abs_color(2500 * 200 + 5, 18001 * 200 - 5).unwrap();
        assert_eq!(px, color_of(&TileKey::new(2500, 18001, AIR_1M, 12)));

        assert!(matches!(
            composer.read_abs(2498 * 200 - 1, 18002 * 200),
            Err(TileError::OutOfBounds { .. })
        ));
        assert!(matches!(
            composer.read_abs_point(&UtmPoint::new(CENTER.easting, CENTER.northing, 13)),
            Err(TileError::ZoneMismatch { expected: 12, actual: 13 })
        ));
        assert!(composer.read_abs_point(&CENTER).is_ok());
    }

    #[test]
    fn test_failed_fill_leaves_raster_unfilled() {
        let mut composer = RasterComposer::new(200);
        let mut painter = Painter {
            fail: true,
            ..Painter::default()
        };
        assert!(composer.fill(&mut painter, &CENTER).is_err());
        assert!(!composer.is_ready());
        assert!(matches!(composer.read(0.0, 0.0), Err(TileError::NotFilled)));
        assert!(matches!(composer.center(), Err(TileError::NotFilled)));
    }

    #[test]
    fn test_select_theme_resets_window() {
        let mut composer = RasterComposer::new(200);
        composer.fill(&mut Painter::default(), &CENTER).unwrap();
        assert_eq!(composer.select_theme(AIR_1M).unwrap(), AIR_1M);
        assert!(composer.is_ready());
        assert_eq!(composer.select_theme(TOPO_2M).unwrap(), AIR_1M);
        assert!(!composer.is_ready());
        assert!(composer.select_theme(200).is_err());
    }

    #[test]
    fn test_refill_invalidates_window() {
        let mut composer = RasterComposer::new(200);
        let mut painter = Painter::default();
        composer.fill(&mut painter, &CENTER).unwrap();
        composer.refill(&mut painter, &CENTER).unwrap();
        assert_eq!(painter.invalidated.len(), 25);
        assert_eq!(painter.calls.len(), 50);
    }

    #[test]
    fn test_margin_is_cropped() {
        let mut composer = RasterComposer::new(200);
        composer.select_theme(LANDSAT_15M).unwrap();
        let center = UtmPoint::new(450_000.0, 3_600_000.0, 12);
        composer.fill(&mut Painter::default(), &center).unwrap();

        assert!(composer.raster().pixels().all(|p| *p != MARGIN));
        assert_eq!(composer.read_color(0.0, 0.0).unwrap(), composer.read_color(2985.0, 2985.0).unwrap());
        assert_ne!(composer.read_color(0.0, 0.0).unwrap(), composer.read_color(3000.0, 0.0).unwrap());
    }

    #[test]
    fn test_gray_level_rounds() {
        assert_eq!(gray_level(&Rgb([1, 1, 2])), 1);
        assert_eq!(gray_level(&Rgb([1, 2, 2])), 2);
        assert_eq!(gray_level(&Rgb([255, 255, 255])), 255);
    }

    #[test]
    fn test_aerial_image_orientation() {
        let mut painter = Painter::default();
        let nw = UtmPoint::new(500_000.0, 3_600_000.0, 12);
        let img = aerial_image(&mut painter, &nw, 50, 30).unwrap();
        assert_eq!(img.dimensions(), (50, 30));
        // pixel (0,0) is at (500000, 3600000): tile x=2500, y=18000
        let expected = gray_level(&color_of(&TileKey::new(2500, 18000, AIR_1M, 12)));
        assert_eq!(img.get_pixel(0, 0).0[0], expected);
    }

    #[test]
    fn test_topographic_detail_uses_topo_theme() {
        let mut painter = Painter::default();
        let nw = UtmPoint::new(500_000.0, 3_600_000.0, 12);
        let img = topographic_detail(&mut painter, &nw, 20, 20).unwrap();
        assert_eq!(img.dimensions(), (20, 20));
        assert!(painter.calls.iter().all(|k| k.tileset == TOPO_2M));
    }
}
