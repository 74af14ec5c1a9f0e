use crate::{
    position::{PixelRect, Pixels, Position},
    projection::WorldGrid,
    tile::{HoverRect, Tile},
};
use image::{Pixel, Rgba, RgbaImage};

#[derive(thiserror::Error, Debug)]
pub enum PaintError {
    #[error("painter failed: {0}")]
    Failed(String),

    #[error("canvas is {actual:?} pixels, expected {expected:?}")]
    CanvasSize {
        expected: (u32, u32),
        actual: (u32, u32),
    },
}

/// Something drawn on top of the tiles, such as a track.
pub trait OverlayPainter: Send + Sync {
    /// Cheap check whether there is anything to paint around the tile. Tiles for which no
    /// painter needs painting end up without an overlay image.
    fn is_painting_needed(&self, _tile: &Tile, _grid: &WorldGrid) -> bool {
        true
    }

    /// Paint onto the canvas. Returns whether anything was painted.
    fn paint(&self, canvas: &mut PaintCanvas<'_>) -> Result<bool, PaintError>;
}

/// Image the painters draw into. It is `parts` tiles wide and tall, with the target tile in
/// the middle.
pub struct PaintCanvas<'a> {
    image: &'a mut RgbaImage,
    tile: &'a Tile,
    grid: WorldGrid,
    parts: u32,

    /// World pixel of the canvas' top-left corner.
    origin: (i64, i64),

    markers: Vec<PixelRect>,
    hovers: Vec<HoverRect>,
}

impl<'a> PaintCanvas<'a> {
    pub(crate) fn new(
        image: &'a mut RgbaImage,
        tile: &'a Tile,
        grid: WorldGrid,
        parts: u32,
    ) -> Result<Self, PaintError> {
        let side = grid.tile_size * parts;
        if image.dimensions() != (side, side) {
            return Err(PaintError::CanvasSize {
                expected: (side, side),
                actual: image.dimensions(),
            });
        }

        let tile_size = i64::from(grid.tile_size);
        let margin = i64::from(parts / 2);
        let address = tile.address();

        Ok(Self {
            image,
            tile,
            grid,
            parts,
            origin: (
                (i64::from(address.column) - margin) * tile_size,
                (i64::from(address.row) - margin) * tile_size,
            ),
            markers: Vec::new(),
            hovers: Vec::new(),
        })
    }

    /// Tile in the middle of the canvas.
    pub fn tile(&self) -> &Tile {
        self.tile
    }

    pub fn grid(&self) -> &WorldGrid {
        &self.grid
    }

    /// How many tiles the canvas is wide, e.g. 3 when the neighbors are painted too.
    pub fn parts(&self) -> u32 {
        self.parts
    }

    /// Area of the world bitmap covered by the canvas.
    pub fn world_rect(&self) -> PixelRect {
        let side = self.grid.tile_size * self.parts;
        PixelRect::new(self.origin.0, self.origin.1, side, side)
    }

    /// Canvas coordinates of a world pixel.
    pub fn to_canvas(&self, world: Pixels) -> Pixels {
        Pixels::new(
            world.x() - self.origin.0 as f64,
            world.y() - self.origin.1 as f64,
        )
    }

    /// Canvas coordinates of a geographical position, using the tile's projection.
    pub fn project(&self, position: Position) -> Pixels {
        let projection = self.tile.address().projection.projection();
        self.to_canvas(projection.geo_to_pixel(position, &self.grid))
    }

    pub fn image_mut(&mut self) -> &mut RgbaImage {
        &mut *self.image
    }

    /// Alpha-blend the color onto the canvas pixel. Returns `false` if the pixel is outside.
    pub fn blend_pixel(&mut self, x: i64, y: i64, color: Rgba<u8>) -> bool {
        let (Ok(x), Ok(y)) = (u32::try_from(x), u32::try_from(y)) else {
            return false;
        };

        match self.image.get_pixel_mut_checked(x, y) {
            Some(pixel) => {
                pixel.blend(&color);
                true
            }
            None => false,
        }
    }

    /// Register the area of a marker, in world pixels, for hit-testing. Every tile the area
    /// overlaps gets it.
    pub fn add_marker_bounds(&mut self, bounds: PixelRect) {
        self.markers.push(bounds);
    }

    /// Register an area, in world pixels, painted for the external object.
    pub fn add_hover(&mut self, bounds: PixelRect, external_id: u64, index: usize) {
        self.hovers.push(HoverRect {
            bounds,
            external_id,
            index,
        });
    }

    pub(crate) fn into_registrations(self) -> (Vec<PixelRect>, Vec<HoverRect>) {
        (self.markers, self.hovers)
    }
}

/// Paints a polyline, optionally with a dot at every point.
#[derive(Debug, Clone)]
pub struct TrackPainter {
    points: Vec<Position>,
    color: Rgba<u8>,
    width: f64,
    marker: Option<(u32, Rgba<u8>)>,
    external_id: u64,
}

impl TrackPainter {
    pub fn new(points: Vec<Position>, color: Rgba<u8>, width: f64) -> Self {
        Self {
            points,
            color,
            width,
            marker: None,
            external_id: 0,
        }
    }

    /// Paint a dot of the given radius at every point, and register it for hit-testing.
    pub fn with_markers(mut self, radius: u32, color: Rgba<u8>) -> Self {
        self.marker = Some((radius, color));
        self
    }

    /// Identifier reported in the hover rectangles.
    pub fn with_external_id(mut self, external_id: u64) -> Self {
        self.external_id = external_id;
        self
    }

    fn reach(&self) -> f64 {
        let marker = self.marker.map_or(0., |(radius, _)| f64::from(radius));
        (self.width / 2.).max(marker) + 1.
    }

    fn world_bounds(&self, tile: &Tile, grid: &WorldGrid) -> Option<PixelRect> {
        let projection = tile.address().projection.projection();
        let pixels: Vec<_> = self
            .points
            .iter()
            .map(|position| projection.geo_to_pixel(*position, grid))
            .collect();

        let reach = self.reach();
        let min_x = pixels.iter().map(|p| p.x()).reduce(f64::min)? - reach;
        let min_y = pixels.iter().map(|p| p.y()).reduce(f64::min)? - reach;
        let max_x = pixels.iter().map(|p| p.x()).reduce(f64::max)? + reach;
        let max_y = pixels.iter().map(|p| p.y()).reduce(f64::max)? + reach;

        Some(PixelRect::new(
            min_x.floor() as i64,
            min_y.floor() as i64,
            (max_x - min_x).ceil() as u32 + 1,
            (max_y - min_y).ceil() as u32 + 1,
        ))
    }
}

impl OverlayPainter for TrackPainter {
    fn is_painting_needed(&self, tile: &Tile, grid: &WorldGrid) -> bool {
        let Some(bounds) = self.world_bounds(tile, grid) else {
            return false;
        };

        // Target tile along with all of its neighbors.
        let tile_size = i64::from(grid.tile_size);
        let address = tile.address();
        let around = PixelRect::new(
            (i64::from(address.column) - 1) * tile_size,
            (i64::from(address.row) - 1) * tile_size,
            grid.tile_size * 3,
            grid.tile_size * 3,
        );

        bounds.intersects(&around)
    }

    fn paint(&self, canvas: &mut PaintCanvas<'_>) -> Result<bool, PaintError> {
        let points: Vec<_> = self.points.iter().map(|p| canvas.project(*p)).collect();
        let half_width = self.width / 2.;
        let mut painted = false;

        match points.as_slice() {
            [] => {}
            [single] => painted |= paint_segment(canvas, *single, *single, half_width, self.color),
            _ => {
                for segment in points.windows(2) {
                    painted |= paint_segment(canvas, segment[0], segment[1], half_width, self.color);
                }
            }
        }

        if let Some((radius, color)) = self.marker {
            let world = canvas.world_rect();
            for (index, point) in points.iter().enumerate() {
                let radius_f = f64::from(radius);
                if !paint_segment(canvas, *point, *point, radius_f, color) {
                    continue;
                }
                painted = true;

                let bounds = PixelRect::new(
                    (point.x() - radius_f).floor() as i64 + world.x,
                    (point.y() - radius_f).floor() as i64 + world.y,
                    radius * 2 + 1,
                    radius * 2 + 1,
                );
                canvas.add_marker_bounds(bounds);
                canvas.add_hover(bounds, self.external_id, index);
            }
        }

        Ok(painted)
    }
}

/// Paint pixels whose centers are not further than `half_width` from the segment.
fn paint_segment(
    canvas: &mut PaintCanvas<'_>,
    a: Pixels,
    b: Pixels,
    half_width: f64,
    color: Rgba<u8>,
) -> bool {
    let (width, height) = canvas.image_mut().dimensions();
    let min_x = (a.x().min(b.x()) - half_width).floor().max(0.) as i64;
    let min_y = (a.y().min(b.y()) - half_width).floor().max(0.) as i64;
    let max_x = (a.x().max(b.x()) + half_width).ceil().min(f64::from(width)) as i64;
    let max_y = (a.y().max(b.y()) + half_width).ceil().min(f64::from(height)) as i64;

    let mut painted = false;
    for y in min_y..max_y {
        for x in min_x..max_x {
            let center = Pixels::new(x as f64 + 0.5, y as f64 + 0.5);
            if distance_to_segment(center, a, b) <= half_width {
                painted |= canvas.blend_pixel(x, y, color);
            }
        }
    }
    painted
}

fn distance_to_segment(p: Pixels, a: Pixels, b: Pixels) -> f64 {
    let ab = b - a;
    let length_squared = ab.x() * ab.x() + ab.y() * ab.y();
    let t = if length_squared == 0. {
        0.
    } else {
        (((p - a).x() * ab.x() + (p - a).y() * ab.y()) / length_squared).clamp(0., 1.)
    };
    let closest = Pixels::new(a.x() + ab.x() * t, a.y() + ab.y() * t);
    let d = p - closest;
    d.x().hypot(d.y())
}
