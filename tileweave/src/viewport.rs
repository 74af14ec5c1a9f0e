//! Which tiles are visible, and where.

use crate::{
    position::{PixelRect, Pixels},
    projection::WorldGrid,
};

/// Empirically tuned constants of the [`ViewportCalculator`]. Defaults are what the maps
/// always looked like, change them only if you know why.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
pub struct ViewportOptions {
    /// Zoom level from which [`ViewportOptions::column_slack`] applies.
    pub high_zoom_slack_from: u8,

    /// Number of additional tile columns considered to be on the map on each side. Masks seams
    /// at high zoom levels.
    pub column_slack: u32,

    /// How far, in pixels, the center might go past the edge of the world bitmap.
    pub center_clamp_slack: f64,
}

impl Default for ViewportOptions {
    fn default() -> Self {
        Self {
            high_zoom_slack_from: 5,
            column_slack: 1,
            center_clamp_slack: 1.,
        }
    }
}

/// Size of the device (e.g. widget) the map is shown on, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
pub struct DeviceSize {
    pub width: u32,
    pub height: u32,
}

impl DeviceSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Inclusive range of tile columns and rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRange {
    pub min_column: i32,
    pub max_column: i32,
    pub min_row: i32,
    pub max_row: i32,
}

impl TileRange {
    pub fn contains(&self, column: i32, row: i32) -> bool {
        (self.min_column..=self.max_column).contains(&column)
            && (self.min_row..=self.max_row).contains(&row)
    }

    /// All `(column, row)` pairs, row by row.
    pub fn iter(&self) -> impl Iterator<Item = (i32, i32)> + use<> {
        let TileRange {
            min_column,
            max_column,
            min_row,
            max_row,
        } = *self;
        (min_row..=max_row).flat_map(move |row| (min_column..=max_column).map(move |col| (col, row)))
    }
}

/// A tile cell of the [`Viewport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewportCell {
    pub column: i32,
    pub row: i32,

    /// Off-map cells are painted as background and never loaded.
    pub on_map: bool,

    /// Top-left corner of the cell relative to the device.
    pub device_x: i64,
    pub device_y: i64,
}

/// Result of the [`ViewportCalculator`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    /// Part of the world bitmap which is visible on the device.
    pub world_rect: PixelRect,

    pub tiles: TileRange,
    pub grid: WorldGrid,

    options: ViewportOptions,
}

impl Viewport {
    pub fn is_tile_on_map(&self, column: i32, row: i32) -> bool {
        is_tile_on_map(&self.options, &self.grid, column, row)
    }

    /// Device coordinates of a world pixel.
    pub fn to_device(&self, pixels: Pixels) -> Pixels {
        Pixels::new(
            pixels.x() - self.world_rect.x as f64,
            pixels.y() - self.world_rect.y as f64,
        )
    }

    /// World coordinates of a device pixel.
    pub fn to_world(&self, device: Pixels) -> Pixels {
        Pixels::new(
            device.x() + self.world_rect.x as f64,
            device.y() + self.world_rect.y as f64,
        )
    }

    pub fn cells(&self) -> impl Iterator<Item = ViewportCell> + '_ {
        let tile_size = i64::from(self.grid.tile_size);
        self.tiles.iter().map(move |(column, row)| ViewportCell {
            column,
            row,
            on_map: self.is_tile_on_map(column, row),
            device_x: i64::from(column) * tile_size - self.world_rect.x,
            device_y: i64::from(row) * tile_size - self.world_rect.y,
        })
    }
}

fn is_tile_on_map(options: &ViewportOptions, grid: &WorldGrid, column: i32, row: i32) -> bool {
    let row_ok = u32::try_from(row).is_ok_and(|row| row < grid.tiles_tall);

    let slack = if grid.zoom >= options.high_zoom_slack_from {
        i64::from(options.column_slack)
    } else {
        0
    };
    let column = i64::from(column);
    let column_ok = column >= -slack && column < i64::from(grid.tiles_wide) + slack;

    row_ok && column_ok
}

/// Derives the visible tiles from the world pixel center and the device size.
#[derive(Debug, Clone, Copy, Default)]
pub struct ViewportCalculator {
    options: ViewportOptions,
}

impl ViewportCalculator {
    pub fn new(options: ViewportOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ViewportOptions {
        &self.options
    }

    pub fn compute(&self, center: Pixels, grid: &WorldGrid, size: DeviceSize) -> Viewport {
        // Truncated, not rounded.
        let left = (center.x() - f64::from(size.width) / 2.) as i64;
        let top = (center.y() - f64::from(size.height) / 2.) as i64;

        let tile_size = i64::from(grid.tile_size);
        let min_column = left.div_euclid(tile_size);
        let min_row = top.div_euclid(tile_size);
        let max_column = min_column + i64::from(size.width.div_ceil(grid.tile_size));
        let max_row = min_row + i64::from(size.height.div_ceil(grid.tile_size));

        Viewport {
            world_rect: PixelRect::new(left, top, size.width, size.height),
            tiles: TileRange {
                min_column: saturate(min_column),
                max_column: saturate(max_column),
                min_row: saturate(min_row),
                max_row: saturate(max_row),
            },
            grid: *grid,
            options: self.options,
        }
    }

    pub fn is_tile_on_map(&self, grid: &WorldGrid, column: i32, row: i32) -> bool {
        is_tile_on_map(&self.options, grid, column, row)
    }

    /// Keep the center within the world bitmap, give or take the slack.
    pub fn clamp_center(&self, center: Pixels, grid: &WorldGrid) -> Pixels {
        let slack = self.options.center_clamp_slack;
        Pixels::new(
            center.x().clamp(-slack, grid.width_px() + slack),
            center.y().clamp(-slack, grid.height_px() + slack),
        )
    }
}

fn saturate(value: i64) -> i32 {
    i32::try_from(value).unwrap_or(if value < 0 { i32::MIN } else { i32::MAX })
}
