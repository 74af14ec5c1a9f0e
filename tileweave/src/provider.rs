use crate::{
    projection::{ProjectionKind, WorldGrid},
    tile::Tile,
    tiles::TileAddress,
    zoom::ZoomRange,
};
use image::{RgbaImage, imageops};
use std::{future::Future, sync::Arc};

/// Source of the map tiles, along with the geometry of the map they make up.
pub trait MapProvider: Send + Sync + 'static {
    type Error: std::error::Error + Sync + Send;

    /// Identifier which becomes part of the tile addresses.
    fn id(&self) -> &str;

    /// Size of each tile, should be a multiple of 256.
    fn tile_size(&self) -> u32 {
        256
    }

    /// Number of tile columns and rows at the given zoom.
    fn map_tile_count(&self, zoom: u8) -> (u32, u32) {
        let tiles = 2u32.pow(u32::from(zoom));
        (tiles, tiles)
    }

    fn min_zoom(&self) -> u8 {
        0
    }

    fn max_zoom(&self) -> u8 {
        19
    }

    fn projection(&self) -> ProjectionKind {
        ProjectionKind::Mercator
    }

    /// Maximum number of tiles being fetched at once.
    fn max_concurrency(&self) -> usize {
        6
    }

    /// Download, or otherwise produce, the tile image.
    fn fetch_tile_image(
        &self,
        address: &TileAddress,
    ) -> impl Future<Output = Result<RgbaImage, Self::Error>> + Send;

    /// Where the tile image comes from, if that means anything for this provider.
    fn tile_url(&self, _address: &TileAddress) -> Option<String> {
        None
    }

    /// Tiles of the next zoom level which the tile should be composed of, instead of being
    /// fetched directly. `None` means that the tile is fetched as usual.
    fn child_tiles(&self, _address: &TileAddress) -> Option<Vec<TileAddress>> {
        None
    }

    /// Compose the image of the parent once all of its children are either loaded or failed.
    /// Returning `None` marks the parent as failed.
    fn compose_parent_image(&self, parent: &Tile, children: &[Arc<Tile>]) -> Option<RgbaImage> {
        compose_quadrants(parent.address(), children, self.tile_size())
    }

    fn zoom_range(&self) -> ZoomRange {
        ZoomRange {
            min: self.min_zoom(),
            max: self.max_zoom(),
        }
    }

    /// World bitmap geometry at the given zoom.
    fn grid(&self, zoom: u8) -> WorldGrid {
        let (tiles_wide, tiles_tall) = self.map_tile_count(zoom);
        WorldGrid {
            zoom,
            tile_size: self.tile_size(),
            tiles_wide,
            tiles_tall,
        }
    }
}

/// Downscale the children's images into the quadrants of the parent. Children without an
/// image leave their quadrant transparent. Returns `None` if no child has an image.
pub fn compose_quadrants(
    parent: &TileAddress,
    children: &[Arc<Tile>],
    tile_size: u32,
) -> Option<RgbaImage> {
    let half = tile_size / 2;
    let mut composed = RgbaImage::new(tile_size, tile_size);
    let mut any = false;

    for child in children {
        let dx = child.address().column - parent.column * 2;
        let dy = child.address().row - parent.row * 2;
        if !(0..=1).contains(&dx) || !(0..=1).contains(&dy) {
            log::warn!("{} is not a child of {parent}.", child.address());
            continue;
        }

        let Some(pixels) = child.image().and_then(|image| image.to_rgba()) else {
            continue;
        };

        let scaled = imageops::resize(&pixels, half, half, imageops::FilterType::Triangle);
        imageops::overlay(
            &mut composed,
            &scaled,
            i64::from(dx) * i64::from(half),
            i64::from(dy) * i64::from(half),
        );
        any = true;
    }

    any.then_some(composed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn loaded_child(address: TileAddress, color: Rgba<u8>) -> Arc<Tile> {
        let tile = Arc::new(Tile::new(address, &WorldGrid::square(1, 4)));
        tile.begin_loading();
        tile.finish_loading(Ok(RgbaImage::from_pixel(4, 4, color)));
        tile
    }

    #[test]
    fn children_land_in_their_quadrants() {
        let parent = TileAddress::new("test", 0, 0, 0);
        let [nw, _, _, se] = parent.children().unwrap();
        let red = Rgba([255, 0, 0, 255]);
        let green = Rgba([0, 255, 0, 255]);

        let composed = compose_quadrants(
            &parent,
            &[loaded_child(nw, red), loaded_child(se, green)],
            4,
        )
        .unwrap();

        assert_eq!(*composed.get_pixel(0, 0), red);
        assert_eq!(*composed.get_pixel(3, 3), green);
        assert_eq!(*composed.get_pixel(3, 0), Rgba([0, 0, 0, 0]));
    }

    #[test]
    fn nothing_to_compose() {
        let parent = TileAddress::new("test", 0, 0, 0);
        let [nw, ..] = parent.children().unwrap();
        let failed = Arc::new(Tile::new(nw, &WorldGrid::square(1, 4)));

        assert_eq!(compose_quadrants(&parent, &[failed], 4), None);
    }
}
