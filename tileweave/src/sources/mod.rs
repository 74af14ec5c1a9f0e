//! Ready-made map providers. Make sure you follow terms of usage of the particular tile server.

mod http;
mod local;

pub use http::{HeaderValue, HttpOptions, HttpProvider, MaxParallelDownloads};
pub use local::LocalTiles;

use crate::tiles::TileAddress;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("could not decode the tile image: {0}")]
    Decode(#[from] image::ImageError),

    #[error("{0} is not served by this provider")]
    Unsupported(TileAddress),
}

/// Whether the provider has a tile at the address. Columns wrap around, rows do not.
fn is_served(address: &TileAddress, tiles_tall: u32, max_zoom: u8) -> bool {
    address.zoom <= max_zoom && address.row >= 0 && i64::from(address.row) < i64::from(tiles_tall)
}

/// Column of the actual tile, for columns past either edge of the map.
fn wrapped_column(address: &TileAddress, tiles_wide: u32) -> i64 {
    i64::from(address.column).rem_euclid(i64::from(tiles_wide.max(1)))
}
