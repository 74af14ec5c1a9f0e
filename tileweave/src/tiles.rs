//! Addressing of the map tiles.

use crate::{
    position::{Pixels, Position},
    projection::{ProjectionKind, WorldGrid},
};
use std::fmt;

/// Identifies a single tile of a single map provider. Used as the key of every tile cache.
#[derive(Debug, PartialEq, Eq, Hash, Clone)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
pub struct TileAddress {
    /// Identifier of the map provider.
    pub provider: String,

    /// Zoom level, where 0 means no zoom.
    /// See: <https://wiki.openstreetmap.org/wiki/Zoom_levels>
    pub zoom: u8,

    /// X number of the tile. Can be negative, or past the last column, when the map is
    /// wrapped around.
    pub column: i32,

    /// Y number of the tile.
    pub row: i32,

    pub projection: ProjectionKind,

    /// Identifier of the component which creates the tile, when it is not the provider itself.
    pub creator: Option<String>,

    /// Free-form suffix, e.g. a layer or dim level.
    pub custom: Option<String>,
}

impl TileAddress {
    pub fn new(provider: impl Into<String>, zoom: u8, column: i32, row: i32) -> Self {
        Self {
            provider: provider.into(),
            zoom,
            column,
            row,
            projection: ProjectionKind::default(),
            creator: None,
            custom: None,
        }
    }

    pub fn with_projection(mut self, projection: ProjectionKind) -> Self {
        self.projection = projection;
        self
    }

    pub fn with_creator(mut self, creator: impl Into<String>) -> Self {
        self.creator = Some(creator.into());
        self
    }

    pub fn with_custom(mut self, custom: impl Into<String>) -> Self {
        self.custom = Some(custom.into());
        self
    }

    /// String form of the address: `provider-zoom-x-y[-creator][-custom]-projection`.
    pub fn key(&self) -> String {
        self.to_string()
    }

    /// Address of the tile `dx` columns and `dy` rows away. The custom suffix is not carried over.
    pub fn offset(&self, dx: i32, dy: i32) -> TileAddress {
        TileAddress {
            column: self.column + dx,
            row: self.row + dy,
            custom: None,
            ..self.clone()
        }
    }

    /// Key of the tile `dx` columns and `dy` rows away.
    pub fn key_with_offset(&self, dx: i32, dy: i32) -> String {
        self.offset(dx, dy).key()
    }

    /// Four tiles covering the same area at the next zoom level.
    pub fn children(&self) -> Option<[TileAddress; 4]> {
        let zoom = self.zoom.checked_add(1)?;
        let child = |dx, dy| TileAddress {
            zoom,
            column: self.column * 2 + dx,
            row: self.row * 2 + dy,
            ..self.clone()
        };
        Some([child(0, 0), child(1, 0), child(0, 1), child(1, 1)])
    }

    /// Tile covering this one at the previous zoom level.
    pub fn parent(&self) -> Option<TileAddress> {
        Some(TileAddress {
            zoom: self.zoom.checked_sub(1)?,
            column: self.column.div_euclid(2),
            row: self.row.div_euclid(2),
            ..self.clone()
        })
    }

    /// Tile position (in pixels) on the "World bitmap".
    pub fn project(&self, tile_size: u32) -> Pixels {
        let tile_size = f64::from(tile_size);
        Pixels::new(
            f64::from(self.column) * tile_size,
            f64::from(self.row) * tile_size,
        )
    }

    /// Whether the tile exists on the map, without any wrapping or slack.
    pub fn is_within(&self, grid: &WorldGrid) -> bool {
        u32::try_from(self.column).is_ok_and(|column| column < grid.tiles_wide)
            && u32::try_from(self.row).is_ok_and(|row| row < grid.tiles_tall)
    }

    /// Geographical area covered by this tile.
    pub fn bounding_box(&self, grid: &WorldGrid) -> BoundingBox {
        let projection = self.projection.projection();
        let top_left = self.project(grid.tile_size);
        let size = f64::from(grid.tile_size);
        let bottom_right = Pixels::new(top_left.x() + size, top_left.y() + size);

        let north_west = projection.pixel_to_geo(top_left, grid);
        let south_east = projection.pixel_to_geo(bottom_right, grid);

        BoundingBox {
            north: north_west.y(),
            south: south_east.y(),
            west: north_west.x(),
            east: south_east.x(),
        }
    }
}

impl fmt::Display for TileAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}",
            self.provider, self.zoom, self.column, self.row
        )?;

        if let Some(creator) = &self.creator {
            write!(f, "-{creator}")?;
        }

        if let Some(custom) = &self.custom {
            write!(f, "-{custom}")?;
        }

        write!(f, "-{}", self.projection.id())
    }
}

/// Geographical bounds, in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
pub struct BoundingBox {
    pub north: f64,
    pub south: f64,
    pub west: f64,
    pub east: f64,
}

impl BoundingBox {
    pub fn contains(&self, position: Position) -> bool {
        (self.south..=self.north).contains(&position.y())
            && (self.west..=self.east).contains(&position.x())
    }
}
