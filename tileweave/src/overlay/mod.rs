//! Overlays, such as tracks, drawn on top of the tiles. To keep the strokes from being clipped
//! at the tile edges, each tile is painted along with its neighbors, and the result is split
//! between them.

mod compositor;
mod image_cache;
mod painter;
mod worker;

pub use compositor::{OverlayCompositor, PassCompleted};
pub use image_cache::{OverlayImageCache, overlay_key};
pub use painter::{OverlayPainter, PaintCanvas, PaintError, TrackPainter};
pub use worker::OverlayWorker;

use std::time::Duration;

/// How the overlay is painted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
pub enum PaintMethod {
    /// Each tile on its own. Strokes are clipped at the tile edges.
    Basic,

    /// On a canvas of 3x3 tiles, which is then split between the tile and its neighbors.
    #[default]
    Enhanced,
}

impl PaintMethod {
    /// Width of the canvas, in tiles.
    pub fn parts(self) -> u32 {
        match self {
            PaintMethod::Basic => 1,
            PaintMethod::Enhanced => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayOptions {
    /// Number of overlay images kept in memory.
    pub image_cache_capacity: usize,

    /// How often the background worker looks into the queue.
    pub poll_interval: Duration,

    /// Time since the last repaint request, before the worker starts a pass. Keeps the
    /// foreground responsive while the map is being dragged.
    pub repaint_quiet_period: Duration,

    /// Time after which a pass yields, so the foreground can repaint.
    pub pass_time_budget: Duration,

    pub paint_method: PaintMethod,

    /// Prefix of the overlay image keys. Should change whenever the overlay content does.
    pub base_key: String,
}

impl Default for OverlayOptions {
    fn default() -> Self {
        Self {
            image_cache_capacity: 200,
            poll_interval: Duration::from_millis(20),
            repaint_quiet_period: Duration::from_millis(50),
            pass_time_budget: Duration::from_millis(500),
            paint_method: PaintMethod::default(),
            base_key: "overlay".to_owned(),
        }
    }
}
