//! Conversion between geographical positions and the "world bitmap", the whole map rendered at
//! a single zoom level.
//! <https://en.wikipedia.org/wiki/Equirectangular_projection>
//! <https://en.wikipedia.org/wiki/Mercator_projection>

use crate::position::{Pixels, Position, lon_lat};
use std::f64::consts::PI;

/// `sin(lat)` is clamped to this value, so the poles do not project into infinity.
const MAX_SIN_LATITUDE: f64 = 0.9999;

/// Dimensions of the world bitmap at a given zoom level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
pub struct WorldGrid {
    pub zoom: u8,

    /// Size of a single (square) tile in pixels.
    pub tile_size: u32,

    /// Number of tile columns.
    pub tiles_wide: u32,

    /// Number of tile rows.
    pub tiles_tall: u32,
}

impl WorldGrid {
    /// Grid of a typical slippy map, which is `2^zoom` tiles in each direction.
    pub fn square(zoom: u8, tile_size: u32) -> Self {
        let tiles = 2u32.pow(u32::from(zoom));
        Self {
            zoom,
            tile_size,
            tiles_wide: tiles,
            tiles_tall: tiles,
        }
    }

    pub fn width_px(&self) -> f64 {
        f64::from(self.tile_size) * f64::from(self.tiles_wide)
    }

    pub fn height_px(&self) -> f64 {
        f64::from(self.tile_size) * f64::from(self.tiles_tall)
    }

    /// Center of the world bitmap.
    pub fn center(&self) -> Pixels {
        Pixels::new(self.width_px() / 2., self.height_px() / 2.)
    }
}

/// Mapping between geographical positions and world pixels.
pub trait Projection: Send + Sync {
    /// Identifier which becomes part of the tile and overlay keys.
    fn id(&self) -> &'static str;

    /// Project the position onto the world bitmap.
    fn geo_to_pixel(&self, position: Position, grid: &WorldGrid) -> Pixels;

    /// Inverse of [`Projection::geo_to_pixel`].
    fn pixel_to_geo(&self, pixels: Pixels, grid: &WorldGrid) -> Position;

    /// Horizontal distance, in pixels, between two positions.
    fn horizontal_distance(&self, a: Position, b: Position, grid: &WorldGrid) -> f64 {
        (self.geo_to_pixel(a, grid).x() - self.geo_to_pixel(b, grid).x()).abs()
    }

    /// Vertical distance, in pixels, between two positions.
    fn vertical_distance(&self, a: Position, b: Position, grid: &WorldGrid) -> f64 {
        (self.geo_to_pixel(a, grid).y() - self.geo_to_pixel(b, grid).y()).abs()
    }
}

/// Plate carrée, where every degree takes the same number of pixels on both axes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Equirectangular;

impl Equirectangular {
    fn pixels_per_degree(grid: &WorldGrid) -> f64 {
        grid.width_px() / 360.
    }
}

impl Projection for Equirectangular {
    fn id(&self) -> &'static str {
        ProjectionKind::Equirectangular.id()
    }

    fn geo_to_pixel(&self, position: Position, grid: &WorldGrid) -> Pixels {
        let center = grid.center();
        let ppd = Self::pixels_per_degree(grid);
        Pixels::new(
            position.x() * ppd + center.x(),
            -position.y() * ppd + center.y(),
        )
    }

    fn pixel_to_geo(&self, pixels: Pixels, grid: &WorldGrid) -> Position {
        let center = grid.center();
        let ppd = Self::pixels_per_degree(grid);
        lon_lat(
            (pixels.x() - center.x()) / ppd,
            (center.y() - pixels.y()) / ppd,
        )
    }
}

/// Mercator, as used by the OSM-like tile servers.
#[derive(Debug, Clone, Copy, Default)]
pub struct Mercator;

impl Mercator {
    fn degree_width(grid: &WorldGrid) -> f64 {
        grid.width_px() / 360.
    }

    fn radian_width(grid: &WorldGrid) -> f64 {
        grid.width_px() / (2. * PI)
    }
}

impl Projection for Mercator {
    fn id(&self) -> &'static str {
        ProjectionKind::Mercator.id()
    }

    fn geo_to_pixel(&self, position: Position, grid: &WorldGrid) -> Pixels {
        let center = grid.center();
        let x = center.x() + position.x() * Self::degree_width(grid);

        let sin = position
            .y()
            .to_radians()
            .sin()
            .clamp(-MAX_SIN_LATITUDE, MAX_SIN_LATITUDE);
        let y = center.y() - 0.5 * ((1. + sin) / (1. - sin)).ln() * Self::radian_width(grid);

        Pixels::new(x, y)
    }

    fn pixel_to_geo(&self, pixels: Pixels, grid: &WorldGrid) -> Position {
        let center = grid.center();
        let lon = (pixels.x() - center.x()) / Self::degree_width(grid);

        let e = (center.y() - pixels.y()) / Self::radian_width(grid);
        let lat = (2. * e.exp().atan() - PI / 2.).to_degrees();

        lon_lat(lon, lat)
    }
}

/// Supported projections. Tiles and overlay keys refer to them through [`ProjectionKind::id`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
pub enum ProjectionKind {
    Equirectangular,
    #[default]
    Mercator,
}

impl ProjectionKind {
    pub fn id(self) -> &'static str {
        match self {
            ProjectionKind::Equirectangular => "cylindrical",
            ProjectionKind::Mercator => "mercator",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        [ProjectionKind::Equirectangular, ProjectionKind::Mercator]
            .into_iter()
            .find(|kind| kind.id() == id)
    }

    pub fn projection(self) -> &'static dyn Projection {
        match self {
            ProjectionKind::Equirectangular => &Equirectangular,
            ProjectionKind::Mercator => &Mercator,
        }
    }
}
