//! The tile entity: loading state, images and overlay bookkeeping.

use crate::{
    handle::{Image, ImageHandle, dispose_quietly},
    position::PixelRect,
    projection::WorldGrid,
    tiles::{BoundingBox, TileAddress},
};
use futures::channel::oneshot;
use image::{Rgba, RgbaImage, imageops};
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Instant,
};

/// Color which the overlay canvas is cleared with. Anything else means that a painter touched
/// the pixel.
pub const TRANSPARENT_MARKER: Rgba<u8> = Rgba([0xfe, 0xfe, 0xfe, 0]);

/// Lock the mutex, recovering the data if another thread panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LoadState {
    #[default]
    NotLoading,
    Loading,
    Loaded,
    LoadError(String),
}

impl LoadState {
    /// Loaded or failed, either way nothing more is going to happen.
    pub fn is_done(&self) -> bool {
        matches!(self, LoadState::Loaded | LoadState::LoadError(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverlayCheckState {
    #[default]
    NotChecked,
    Queued,
    Checked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverlayImageState {
    #[default]
    NotSet,
    NoImage,
    ImageIsCreated,
    TileHasContent,
    TileHasPartContent,
}

/// Area painted for some external object, used for hit-testing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HoverRect {
    /// Relative to the tile's top-left corner.
    pub bounds: PixelRect,
    pub external_id: u64,
    pub index: usize,
}

/// Instants of the most recent load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadTiming {
    pub queued: Option<Instant>,
    pub started: Option<Instant>,
    pub finished: Option<Instant>,
}

#[derive(Debug, Default)]
struct Load {
    state: LoadState,
    timing: LoadTiming,
    waiters: Vec<oneshot::Sender<LoadState>>,
}

#[derive(Debug, Default)]
struct Overlay {
    check: OverlayCheckState,
    image_state: OverlayImageState,
    image: Option<ImageHandle>,

    /// Part painted while this tile was the target.
    own: Option<RgbaImage>,

    /// Parts spilled over from the neighbors.
    spill: Option<RgbaImage>,

    markers: Vec<PixelRect>,
    part_markers: Vec<PixelRect>,
    hovers: Vec<HoverRect>,
}

#[derive(Debug, Default)]
struct Family {
    children: Option<Vec<Arc<Tile>>>,
    children_with_errors: HashMap<TileAddress, String>,
}

#[derive(Debug, Default)]
struct Offline {
    path: Option<PathBuf>,
    url: Option<String>,
}

/// A single square piece of the map.
#[derive(Debug)]
pub struct Tile {
    address: TileAddress,
    bounding_box: BoundingBox,
    tile_size: u32,

    load: Mutex<Load>,
    image: Mutex<Option<ImageHandle>>,

    offline_available: AtomicBool,
    offline_error: AtomicBool,
    offline: Mutex<Offline>,

    overlay: Mutex<Overlay>,

    /// Number of compositing passes which put something into this tile.
    overlay_content: AtomicUsize,

    family: Mutex<Family>,

    /// Never owning, and can be cleared while the parent is still alive.
    parent: Mutex<Weak<Tile>>,
}

impl Tile {
    pub fn new(address: TileAddress, grid: &WorldGrid) -> Self {
        Self {
            bounding_box: address.bounding_box(grid),
            address,
            tile_size: grid.tile_size,
            load: Default::default(),
            image: Default::default(),
            offline_available: Default::default(),
            offline_error: Default::default(),
            offline: Default::default(),
            overlay: Default::default(),
            overlay_content: Default::default(),
            family: Default::default(),
            parent: Default::default(),
        }
    }

    pub fn address(&self) -> &TileAddress {
        &self.address
    }

    pub fn bounding_box(&self) -> BoundingBox {
        self.bounding_box
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    pub fn load_state(&self) -> LoadState {
        lock(&self.load).state.clone()
    }

    pub fn is_loading(&self) -> bool {
        lock(&self.load).state == LoadState::Loading
    }

    pub fn load_timing(&self) -> LoadTiming {
        lock(&self.load).timing
    }

    /// Base image, unless the tile is not loaded or the image got disposed.
    pub fn image(&self) -> Option<ImageHandle> {
        lock(&self.image)
            .as_ref()
            .filter(|image| !image.is_disposed())
            .cloned()
    }

    /// Switch to [`LoadState::Loading`]. Returns `false` if the tile is already loading.
    pub(crate) fn begin_loading(&self) -> bool {
        let mut load = lock(&self.load);
        if load.state == LoadState::Loading {
            return false;
        }

        load.state = LoadState::Loading;
        load.timing = LoadTiming {
            queued: Some(Instant::now()),
            ..Default::default()
        };
        true
    }

    pub(crate) fn mark_load_started(&self) {
        lock(&self.load).timing.started = Some(Instant::now());
    }

    /// Undo [`Tile::begin_loading`] for a load which is not going to happen.
    pub(crate) fn cancel_loading(&self) {
        let mut load = lock(&self.load);
        if load.state == LoadState::Loading {
            load.state = LoadState::NotLoading;
            // Dropping the senders tells the waiters that the load was cancelled.
            load.waiters.clear();
        }
    }

    /// Store the result of the load. Results arriving when the tile is not loading are stale and
    /// get ignored.
    pub(crate) fn finish_loading(&self, result: Result<RgbaImage, String>) -> bool {
        let (state, waiters) = {
            let mut load = lock(&self.load);
            if load.state != LoadState::Loading {
                log::trace!("Ignoring stale load result of {}.", self.address);
                return false;
            }

            let stale = lock(&self.image).take();
            if let Some(stale) = stale {
                dispose_quietly(&stale);
            }

            load.state = match result {
                Ok(pixels) => {
                    *lock(&self.image) = Some(Image::new(pixels));
                    LoadState::Loaded
                }
                Err(message) => LoadState::LoadError(message),
            };
            load.timing.finished = Some(Instant::now());
            (load.state.clone(), std::mem::take(&mut load.waiters))
        };

        if let LoadState::LoadError(message) = &state
            && let Some(parent) = self.parent()
        {
            parent.record_child_error(self.address.clone(), message.clone());
        }

        for waiter in waiters {
            // Receiver might not be interested anymore.
            let _ = waiter.send(state.clone());
        }

        true
    }

    /// Future-friendly way of waiting for the current load to finish. Resolves immediately if the
    /// tile is not loading, and with `Canceled` if the load gets cancelled.
    pub fn subscribe_load(&self) -> oneshot::Receiver<LoadState> {
        let (tx, rx) = oneshot::channel();
        let mut load = lock(&self.load);
        if load.state == LoadState::Loading {
            load.waiters.push(tx);
        } else {
            let _ = tx.send(load.state.clone());
        }
        rx
    }

    pub fn is_offline_available(&self) -> bool {
        self.offline_available.load(Ordering::Relaxed)
    }

    pub fn set_offline_available(&self, value: bool) {
        self.offline_available.store(value, Ordering::Relaxed);
    }

    pub fn has_offline_error(&self) -> bool {
        self.offline_error.load(Ordering::Relaxed)
    }

    pub fn set_offline_error(&self, value: bool) {
        self.offline_error.store(value, Ordering::Relaxed);
    }

    pub fn offline_path(&self) -> Option<PathBuf> {
        lock(&self.offline).path.clone()
    }

    pub fn set_offline_path(&self, path: Option<PathBuf>) {
        lock(&self.offline).path = path;
    }

    /// Where the tile was loaded from.
    pub fn url(&self) -> Option<String> {
        lock(&self.offline).url.clone()
    }

    pub fn set_url(&self, url: Option<String>) {
        lock(&self.offline).url = url;
    }

    pub fn overlay_check_state(&self) -> OverlayCheckState {
        lock(&self.overlay).check
    }

    pub fn set_overlay_check_state(&self, state: OverlayCheckState) {
        lock(&self.overlay).check = state;
    }

    pub fn overlay_image_state(&self) -> OverlayImageState {
        lock(&self.overlay).image_state
    }

    pub fn set_overlay_image_state(&self, state: OverlayImageState) {
        lock(&self.overlay).image_state = state;
    }

    /// Set both overlay states at once, so nobody observes a half-updated tile.
    pub(crate) fn set_overlay_states(&self, check: OverlayCheckState, image: OverlayImageState) {
        let mut overlay = lock(&self.overlay);
        overlay.check = check;
        overlay.image_state = image;
    }

    /// Tile got some overlay content from a neighbor. Full content is never downgraded.
    pub(crate) fn mark_part_content(&self) {
        let mut overlay = lock(&self.overlay);
        if overlay.image_state != OverlayImageState::TileHasContent {
            overlay.image_state = OverlayImageState::TileHasPartContent;
        }
    }

    pub fn overlay_content(&self) -> usize {
        self.overlay_content.load(Ordering::Acquire)
    }

    pub(crate) fn increment_overlay_content(&self) -> usize {
        self.overlay_content.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Overlay image, unless there is none or it got disposed.
    pub fn overlay_image(&self) -> Option<ImageHandle> {
        lock(&self.overlay)
            .image
            .as_ref()
            .filter(|image| !image.is_disposed())
            .cloned()
    }

    /// Replace the part of the overlay painted with this tile as the target.
    pub(crate) fn draw_own_part(&self, part: &RgbaImage) {
        lock(&self.overlay).own = Some(without_marker(part));
    }

    /// Add a part spilled over from a neighbor.
    pub(crate) fn draw_spill_part(&self, part: &RgbaImage) {
        let part = without_marker(part);
        let mut overlay = lock(&self.overlay);
        match &mut overlay.spill {
            Some(spill) => imageops::overlay(spill, &part, 0, 0),
            spill @ None => *spill = Some(part),
        }
    }

    /// Compose the overlay image out of the spilled parts with the own part on top of them.
    /// Previous overlay image gets disposed.
    pub(crate) fn create_overlay_image(&self) -> Option<ImageHandle> {
        let mut overlay = lock(&self.overlay);
        if overlay.own.is_none() && overlay.spill.is_none() {
            return None;
        }

        let mut composed = RgbaImage::new(self.tile_size, self.tile_size);
        for layer in [&overlay.spill, &overlay.own].into_iter().flatten() {
            imageops::overlay(&mut composed, layer, 0, 0);
        }

        let image = Image::new(composed);
        if let Some(previous) = overlay.image.replace(Arc::clone(&image)) {
            dispose_quietly(&previous);
        }
        Some(image)
    }

    /// Forget everything about the overlay, so it can be painted again from scratch.
    pub fn reset_overlay(&self) {
        let mut overlay = lock(&self.overlay);
        if let Some(image) = overlay.image.take() {
            dispose_quietly(&image);
        }
        *overlay = Overlay::default();
        self.overlay_content.store(0, Ordering::Release);
    }

    /// Bounds of the markers painted into this tile, relative to its top-left corner.
    pub fn marker_bounds(&self) -> Vec<PixelRect> {
        lock(&self.overlay).markers.clone()
    }

    /// Bounds of the markers partially painted into this tile.
    pub fn part_marker_bounds(&self) -> Vec<PixelRect> {
        lock(&self.overlay).part_markers.clone()
    }

    pub(crate) fn add_marker_bounds(&self, bounds: PixelRect, whole: bool) {
        let mut overlay = lock(&self.overlay);
        if whole {
            overlay.markers.push(bounds);
        } else {
            overlay.part_markers.push(bounds);
        }
    }

    pub fn hovers(&self) -> Vec<HoverRect> {
        lock(&self.overlay).hovers.clone()
    }

    pub(crate) fn add_hover(&self, hover: HoverRect) {
        lock(&self.overlay).hovers.push(hover);
    }

    pub(crate) fn clear_hovers(&self) {
        lock(&self.overlay).hovers.clear();
    }

    pub fn parent(&self) -> Option<Arc<Tile>> {
        lock(&self.parent).upgrade()
    }

    pub fn clear_parent(&self) {
        *lock(&self.parent) = Weak::new();
    }

    pub fn children(&self) -> Vec<Arc<Tile>> {
        lock(&self.family).children.clone().unwrap_or_default()
    }

    /// Take ownership of the tiles this one is going to be composed of.
    pub(crate) fn adopt_children(self: &Arc<Self>, children: Vec<Arc<Tile>>) {
        for child in &children {
            *lock(&child.parent) = Arc::downgrade(self);
        }

        let mut family = lock(&self.family);
        family.children = Some(children);
        family.children_with_errors.clear();
    }

    /// Give up the children, breaking their links back to this tile.
    pub(crate) fn release_children(&self) -> Vec<Arc<Tile>> {
        let children = lock(&self.family).children.take().unwrap_or_default();
        for child in &children {
            child.clear_parent();
        }
        children
    }

    /// Whether every child has either loaded or failed.
    pub fn all_children_done(&self) -> bool {
        lock(&self.family)
            .children
            .as_ref()
            .is_some_and(|children| children.iter().all(|child| child.load_state().is_done()))
    }

    pub fn children_with_errors(&self) -> HashMap<TileAddress, String> {
        lock(&self.family).children_with_errors.clone()
    }

    fn record_child_error(&self, child: TileAddress, message: String) {
        lock(&self.family)
            .children_with_errors
            .insert(child, message);
    }
}

impl Drop for Tile {
    fn drop(&mut self) {
        let image = self.image.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(image) = image.take() {
            dispose_quietly(&image);
        }

        let overlay = self.overlay.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(image) = overlay.image.take() {
            dispose_quietly(&image);
        }
    }
}

/// Copy of the part with the marker pixels turned fully transparent.
fn without_marker(part: &RgbaImage) -> RgbaImage {
    let mut part = part.clone();
    for pixel in part.pixels_mut() {
        if is_marker(pixel) {
            *pixel = Rgba([0, 0, 0, 0]);
        }
    }
    part
}

/// Whether the pixel still has the color of the cleared canvas. Alpha is not taken into account.
pub(crate) fn is_marker(pixel: &Rgba<u8>) -> bool {
    pixel.0[..3] == TRANSPARENT_MARKER.0[..3]
}
