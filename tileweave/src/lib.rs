#![doc = include_str!("../README.md")]
#![deny(clippy::unwrap_used, rustdoc::broken_intra_doc_links)]

mod cache;
mod handle;
mod io;
mod memory;
pub mod overlay;
mod position;
mod projection;
mod provider;
pub mod sources;
mod tile;
mod tiles;
mod viewport;
mod zoom;

pub use cache::{CacheOptions, RequestRefused, TileCache};
pub use handle::{Image, ImageError, ImageHandle};
pub use io::{Stats, TileUpdated};
pub use memory::{MapMemory, ZoomAnchor};
pub use position::{PixelRect, Pixels, Position, lat_lon, lon_lat};
pub use projection::{Equirectangular, Mercator, Projection, ProjectionKind, WorldGrid};
pub use provider::{MapProvider, compose_quadrants};
pub use tile::{
    HoverRect, LoadState, LoadTiming, OverlayCheckState, OverlayImageState, TRANSPARENT_MARKER,
    Tile,
};
pub use tiles::{BoundingBox, TileAddress};
pub use viewport::{
    DeviceSize, TileRange, Viewport, ViewportCalculator, ViewportCell, ViewportOptions,
};
pub use zoom::{InvalidZoom, ZoomRange};
