use super::{
    OverlayOptions, PaintMethod,
    image_cache::{OverlayImageCache, overlay_key},
    painter::{OverlayPainter, PaintCanvas, PaintError},
};
use crate::{
    cache::TileCache,
    handle::ImageHandle,
    position::PixelRect,
    projection::WorldGrid,
    provider::MapProvider,
    tile::{
        HoverRect, OverlayCheckState, OverlayImageState, TRANSPARENT_MARKER, Tile, is_marker, lock,
    },
};
use image::{RgbaImage, imageops};
use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
    time::{Duration, Instant},
};

/// Called, from the worker thread, when a compositing pass put something new into the tiles.
pub type PassCompleted = Arc<dyn Fn() + Send + Sync>;

/// Result of running the painters.
struct Painted {
    image: RgbaImage,

    /// World pixels.
    markers: Vec<PixelRect>,

    /// World pixels.
    hovers: Vec<HoverRect>,
}

/// Paints the overlays of queued tiles and distributes the result between the tiles and their
/// neighbors.
pub struct OverlayCompositor<P: MapProvider> {
    cache: Arc<TileCache<P>>,
    images: OverlayImageCache,
    painters: Mutex<Vec<Arc<dyn OverlayPainter>>>,
    queue: Mutex<VecDeque<Arc<Tile>>>,

    base_key: Mutex<String>,
    active_zoom: AtomicU8,
    paint_method: Mutex<PaintMethod>,

    /// Set to abandon the current pass. Reset when the next one starts.
    cancelled: AtomicBool,
    running: AtomicBool,

    last_repaint_request: Mutex<Option<Instant>>,
    on_pass_completed: Mutex<Option<PassCompleted>>,

    poll_interval: Duration,
    repaint_quiet_period: Duration,
    pass_time_budget: Duration,
}

impl<P: MapProvider> OverlayCompositor<P> {
    pub fn new(cache: Arc<TileCache<P>>, options: OverlayOptions) -> Self {
        Self {
            cache,
            images: OverlayImageCache::new(options.image_cache_capacity),
            painters: Default::default(),
            queue: Default::default(),
            base_key: Mutex::new(options.base_key),
            active_zoom: AtomicU8::new(0),
            paint_method: Mutex::new(options.paint_method),
            cancelled: AtomicBool::new(false),
            running: AtomicBool::new(false),
            last_repaint_request: Default::default(),
            on_pass_completed: Default::default(),
            poll_interval: options.poll_interval,
            repaint_quiet_period: options.repaint_quiet_period,
            pass_time_budget: options.pass_time_budget,
        }
    }

    pub fn cache(&self) -> &Arc<TileCache<P>> {
        &self.cache
    }

    pub fn image_cache(&self) -> &OverlayImageCache {
        &self.images
    }

    pub(crate) fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn add_painter(&self, painter: impl OverlayPainter + 'static) {
        lock(&self.painters).push(Arc::new(painter));
    }

    pub fn clear_painters(&self) {
        lock(&self.painters).clear();
    }

    pub fn base_key(&self) -> String {
        lock(&self.base_key).clone()
    }

    /// Change the prefix of the overlay image keys, typically along with the painters.
    pub fn set_base_key(&self, key: impl Into<String>) {
        *lock(&self.base_key) = key.into();
    }

    pub fn active_zoom(&self) -> u8 {
        self.active_zoom.load(Ordering::Acquire)
    }

    /// Zoom of the map. Tiles of any other zoom are not painted, and the images painted for
    /// the previous zoom are thrown away.
    pub fn set_active_zoom(&self, zoom: u8) {
        if self.active_zoom.swap(zoom, Ordering::AcqRel) == zoom {
            return;
        }

        self.cancel();
        for tile in lock(&self.queue).drain(..) {
            tile.set_overlay_check_state(OverlayCheckState::NotChecked);
        }
        self.images.dispose_all();
    }

    pub fn paint_method(&self) -> PaintMethod {
        *lock(&self.paint_method)
    }

    /// Switch the paint method. Everything painted so far is reset.
    pub fn set_paint_method(&self, method: PaintMethod) {
        let previous = std::mem::replace(&mut *lock(&self.paint_method), method);
        if previous != method {
            self.reset();
        }
    }

    pub fn set_pass_completed_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        *lock(&self.on_pass_completed) = Some(Arc::new(callback));
    }

    /// Queue the tile for painting.
    pub fn enqueue(&self, tile: &Arc<Tile>) {
        tile.set_overlay_states(OverlayCheckState::Queued, OverlayImageState::NotSet);
        lock(&self.queue).push_back(Arc::clone(tile));
    }

    pub fn queue_len(&self) -> usize {
        lock(&self.queue).len()
    }

    /// Foreground is repainting, so the worker should hold off for a while.
    pub fn repaint_requested(&self) {
        *lock(&self.last_repaint_request) = Some(Instant::now());
    }

    /// Abandon the pass which is running right now, if any.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Forget everything painted so far: the queue, the images and the overlay state of every
    /// cached tile.
    pub fn reset(&self) {
        self.cancel();
        for tile in lock(&self.queue).drain(..) {
            tile.reset_overlay();
        }
        self.images.dispose_all();
        self.cache.reset_overlays();
        log::debug!("Overlays reset.");
    }

    /// Whether the worker should start a pass now.
    pub fn should_run_pass(&self) -> bool {
        let quiet = lock(&self.last_repaint_request)
            .is_none_or(|requested| requested.elapsed() >= self.repaint_quiet_period);

        quiet && !self.running.load(Ordering::Acquire) && !lock(&self.queue).is_empty()
    }

    /// Paint queued tiles until the queue is empty, the time budget is exceeded or the pass is
    /// cancelled. Returns the number of tiles processed.
    pub fn run_pass(&self) -> usize {
        if self.running.swap(true, Ordering::AcqRel) {
            return 0;
        }
        self.cancelled.store(false, Ordering::Release);

        let started = Instant::now();
        let mut processed = 0;
        while started.elapsed() < self.pass_time_budget && !self.cancelled.load(Ordering::Acquire)
        {
            let Some(tile) = lock(&self.queue).pop_front() else {
                break;
            };
            self.paint_tile(&tile);
            processed += 1;
        }

        self.running.store(false, Ordering::Release);

        if processed > 0 {
            log::trace!("Overlay pass processed {processed} tiles in {:?}.", started.elapsed());
            let callback = lock(&self.on_pass_completed).clone();
            if let Some(callback) = callback {
                callback();
            }
        }

        processed
    }

    /// Overlay image to be drawn over the tile right now, if any. Tiles which were not painted
    /// yet, or lost their image, are queued.
    pub fn overlay_for_paint(&self, tile: &Arc<Tile>) -> Option<ImageHandle> {
        let state = tile.overlay_image_state();
        let content = tile.overlay_content();

        if state == OverlayImageState::ImageIsCreated
            || (state == OverlayImageState::NoImage && content == 0)
        {
            return None;
        }

        let mut part_image = None;
        let mut tile_image = None;
        if content > 0 {
            part_image = self
                .images
                .get(&overlay_key(&self.base_key(), tile.address(), 0, 0));
            if part_image.is_none() {
                tile_image = tile.overlay_image();
            }
        }
        let has_image = tile_image.is_some() || tile.overlay_image().is_some();
        let drawing = part_image.or(tile_image);

        match tile.overlay_check_state() {
            OverlayCheckState::NotChecked => self.enqueue(tile),
            OverlayCheckState::Queued => {}
            OverlayCheckState::Checked => {
                if content == 0 {
                    if !has_image || state == OverlayImageState::NotSet {
                        tile.set_overlay_image_state(OverlayImageState::NoImage);
                    }
                } else if !has_image && state == OverlayImageState::TileHasContent {
                    // Image got evicted, paint it again.
                    self.enqueue(tile);
                } else if has_image && state == OverlayImageState::NotSet {
                    self.enqueue(tile);
                }
                // Spilled content without an image comes back once a neighbor is painted.
            }
        }

        drawing
    }

    pub(crate) fn paint_tile(&self, tile: &Arc<Tile>) {
        let address = tile.address();
        if address.zoom != self.active_zoom() {
            tile.set_overlay_check_state(OverlayCheckState::NotChecked);
            return;
        }

        tile.set_overlay_check_state(OverlayCheckState::Checked);
        tile.clear_hovers();

        let grid = self.cache.grid(address.zoom);
        let painters = lock(&self.painters).clone();
        if !painters
            .iter()
            .any(|painter| painter.is_painting_needed(tile, &grid))
        {
            tile.set_overlay_image_state(OverlayImageState::NoImage);
            return;
        }

        let method = self.paint_method();
        match paint(tile, &grid, &painters, method.parts()) {
            Ok(Some(painted)) => match method {
                PaintMethod::Basic => self.apply_basic(tile, &grid, painted),
                PaintMethod::Enhanced => self.split(tile, &grid, painted),
            },
            Ok(None) => self.nothing_landed(tile),
            Err(err) => {
                log::warn!("Painting the overlay of {address} failed: {err}");
                self.nothing_landed(tile);
            }
        }
    }

    /// Nothing of the tile's own painting landed in it. It might still have some content
    /// spilled over from the neighbors.
    fn nothing_landed(&self, tile: &Tile) {
        if tile.overlay_content() == 0 {
            tile.set_overlay_image_state(OverlayImageState::NoImage);
            return;
        }

        tile.mark_part_content();
        if let Some(image) = tile.create_overlay_image() {
            self.images
                .put(overlay_key(&self.base_key(), tile.address(), 0, 0), image);
        }
    }

    fn apply_basic(&self, tile: &Arc<Tile>, grid: &WorldGrid, painted: Painted) {
        let Painted {
            image,
            markers,
            hovers,
        } = painted;

        let cell = tile_rect(tile, grid);
        distribute_markers(tile, &cell, &markers);
        attach_hovers(tile, &cell, hovers);

        if !is_part_modified(&image, 0, 0, grid.tile_size, grid.tile_size) {
            self.nothing_landed(tile);
            return;
        }

        tile.draw_own_part(&image);
        let overlay = tile.create_overlay_image();
        tile.increment_overlay_content();
        tile.set_overlay_image_state(OverlayImageState::TileHasContent);

        if let Some(overlay) = overlay {
            self.images
                .put(overlay_key(&self.base_key(), tile.address(), 0, 0), overlay);
        }
    }

    /// Distribute the 3x3 canvas between the tile, in the middle, and its neighbors.
    fn split(&self, tile: &Arc<Tile>, grid: &WorldGrid, painted: Painted) {
        let Painted {
            image,
            markers,
            hovers,
        } = painted;

        tile.set_overlay_image_state(OverlayImageState::ImageIsCreated);

        let address = tile.address();
        let base_key = self.base_key();
        let tile_size = grid.tile_size;
        let last_column = i64::from(grid.tiles_wide) + 1;
        let last_row = i64::from(grid.tiles_tall) + 1;

        for dy in -1..=1i32 {
            for dx in -1..=1i32 {
                if self.cancelled.load(Ordering::Acquire) {
                    log::debug!("Overlay split of {address} cancelled.");
                    tile.set_overlay_states(OverlayCheckState::NotChecked, OverlayImageState::NotSet);
                    return;
                }

                let column = i64::from(address.column) + i64::from(dx);
                let row = i64::from(address.row) + i64::from(dy);
                if column < -1 || row < -1 || column > last_column || row > last_row {
                    continue;
                }

                let size = i64::from(tile_size);
                let cell = PixelRect::new(column * size, row * size, tile_size, tile_size);
                let cell_markers: Vec<_> = markers
                    .iter()
                    .filter(|marker| marker.intersects(&cell))
                    .copied()
                    .collect();

                let (x0, y0) = ((dx + 1) as u32 * tile_size, (dy + 1) as u32 * tile_size);
                let modified = is_part_modified(&image, x0, y0, tile_size, tile_size);
                if !modified && cell_markers.is_empty() {
                    continue;
                }

                let center = dx == 0 && dy == 0;
                let (cell_tile, created) = if center {
                    (Arc::clone(tile), false)
                } else {
                    self.cache.get_or_create_reporting(&address.offset(dx, dy))
                };

                distribute_markers(&cell_tile, &cell, &cell_markers);

                if !modified {
                    continue;
                }

                let part = imageops::crop_imm(&image, x0, y0, tile_size, tile_size).to_image();
                let overlay = if center {
                    tile.draw_own_part(&part);
                    let overlay = tile.create_overlay_image();
                    tile.increment_overlay_content();
                    tile.set_overlay_image_state(OverlayImageState::TileHasContent);
                    overlay
                } else {
                    cell_tile.draw_spill_part(&part);
                    // A brand new tile gets its image once it is painted itself.
                    let overlay = if created {
                        None
                    } else {
                        cell_tile.create_overlay_image()
                    };
                    cell_tile.increment_overlay_content();
                    cell_tile.mark_part_content();
                    overlay
                };

                if let Some(overlay) = overlay {
                    self.images
                        .put(overlay_key(&base_key, address, dx, dy), overlay);
                }
            }
        }

        attach_hovers(tile, &tile_rect(tile, grid), hovers);

        if tile.overlay_image_state() == OverlayImageState::ImageIsCreated {
            self.nothing_landed(tile);
        }
    }
}

/// Run the painters on a fresh canvas. Returns `None` if nothing was painted.
fn paint(
    tile: &Tile,
    grid: &WorldGrid,
    painters: &[Arc<dyn OverlayPainter>],
    parts: u32,
) -> Result<Option<Painted>, PaintError> {
    let side = grid.tile_size * parts;
    let mut image = RgbaImage::from_pixel(side, side, TRANSPARENT_MARKER);

    let mut canvas = PaintCanvas::new(&mut image, tile, *grid, parts)?;
    let mut painted = false;
    for painter in painters {
        painted |= painter.paint(&mut canvas)?;
    }
    let (markers, hovers) = canvas.into_registrations();

    Ok(painted.then_some(Painted {
        image,
        markers,
        hovers,
    }))
}

/// World pixels covered by the tile.
fn tile_rect(tile: &Tile, grid: &WorldGrid) -> PixelRect {
    let size = i64::from(grid.tile_size);
    let address = tile.address();
    PixelRect::new(
        i64::from(address.column) * size,
        i64::from(address.row) * size,
        grid.tile_size,
        grid.tile_size,
    )
}

fn distribute_markers(tile: &Tile, cell: &PixelRect, markers: &[PixelRect]) {
    for marker in markers.iter().filter(|marker| marker.intersects(cell)) {
        tile.add_marker_bounds(
            marker.translated(-cell.x, -cell.y),
            cell.contains_rect(marker),
        );
    }
}

fn attach_hovers(tile: &Tile, cell: &PixelRect, hovers: Vec<HoverRect>) {
    for hover in hovers {
        tile.add_hover(HoverRect {
            bounds: hover.bounds.translated(-cell.x, -cell.y),
            ..hover
        });
    }
}

/// Whether anything was painted in the given part of the canvas.
pub(crate) fn is_part_modified(image: &RgbaImage, x0: u32, y0: u32, width: u32, height: u32) -> bool {
    if width == 0 || height == 0 {
        return false;
    }

    let (x1, y1) = (x0 + width - 1, y0 + height - 1);
    let modified = |x, y| !is_marker(image.get_pixel(x, y));

    // Borders first.
    (x0..=x1).any(|x| modified(x, y0) || modified(x, y1))
        || (y0..=y1).any(|y| modified(x0, y) || modified(x1, y))
        || (y0 + 1..y1).any(|y| (x0 + 1..x1).any(|x| modified(x, y)))
}
