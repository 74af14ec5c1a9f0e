//! Background machinery which loads the tiles.

pub(crate) mod loader;
pub(crate) mod runtime;

pub use loader::{Stats, TileUpdated};
