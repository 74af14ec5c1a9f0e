use crate::{
    io::{
        loader::{LoadRequest, Shared, Stats, load_continuously},
        runtime::Runtime,
    },
    projection::WorldGrid,
    provider::MapProvider,
    tile::{LoadState, Tile, lock},
    tiles::TileAddress,
};
use futures::channel::{
    mpsc::{Sender, channel},
    oneshot,
};
use lru::LruCache;
use std::{
    num::NonZeroUsize,
    sync::{Arc, Mutex, atomic::Ordering},
};

/// Controls the size of the [`TileCache`] and how it loads the tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheOptions {
    /// Maximum number of tiles kept in memory.
    pub capacity: NonZeroUsize,

    /// Size of the request queue. Requests which do not fit are refused with
    /// [`RequestRefused::QueueFull`] and need to be repeated, which ensures that newer requests
    /// are prioritized.
    pub request_queue_size: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        // Just arbitrary value which seemed right.
        #[allow(clippy::unwrap_used)]
        let capacity = NonZeroUsize::new(256).unwrap();

        Self {
            capacity,
            request_queue_size: 6,
        }
    }
}

/// Reason of [`TileCache::request_load`] not starting a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RequestRefused {
    /// The tile, or one of the tiles it is composed of, is already being loaded.
    #[error("tile is already loading")]
    AlreadyLoading,

    /// Too many tiles were requested at once.
    #[error("tile request queue is full")]
    QueueFull,

    #[error("tile loading thread is not running")]
    LoaderStopped,
}

/// Bounded cache of the tiles of a single [`MapProvider`], which loads them asynchronously
/// in a background thread.
pub struct TileCache<P: MapProvider> {
    provider: Arc<P>,
    tiles: Mutex<LruCache<TileAddress, Arc<Tile>>>,

    /// Tiles to be loaded by the IO thread.
    request_tx: Mutex<Sender<LoadRequest>>,

    shared: Arc<Shared>,

    #[allow(dead_code)] // Significant Drop
    runtime: Runtime,
}

impl<P: MapProvider> TileCache<P> {
    pub fn new(provider: P) -> std::io::Result<Self> {
        Self::with_options(provider, CacheOptions::default())
    }

    pub fn with_options(provider: P, options: CacheOptions) -> std::io::Result<Self> {
        let provider = Arc::new(provider);
        let shared = Arc::new(Shared::default());
        let (request_tx, request_rx) = channel(options.request_queue_size);

        // This will run concurrently in a loop, handling loads and talking with us via channels.
        let runtime = Runtime::new(
            "tileweave-io",
            load_continuously(Arc::clone(&provider), Arc::clone(&shared), request_rx),
        )?;

        Ok(Self {
            provider,
            tiles: Mutex::new(LruCache::new(options.capacity)),
            request_tx: Mutex::new(request_tx),
            shared,
            runtime,
        })
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Geometry of the provider's map at the given zoom.
    pub fn grid(&self, zoom: u8) -> WorldGrid {
        self.provider.grid(zoom)
    }

    /// Address of the provider's tile.
    pub fn address(&self, zoom: u8, column: i32, row: i32) -> TileAddress {
        TileAddress::new(self.provider.id(), zoom, column, row)
            .with_projection(self.provider.projection())
    }

    /// Cached tile, if there is one.
    pub fn get(&self, address: &TileAddress) -> Option<Arc<Tile>> {
        lock(&self.tiles).get(address).cloned()
    }

    /// Cached tile, or a new one which is not loading yet.
    pub fn get_or_create(&self, address: &TileAddress) -> Arc<Tile> {
        self.get_or_create_reporting(address).0
    }

    /// Same as [`TileCache::get_or_create`], but also tells whether the tile was just created.
    pub fn get_or_create_reporting(&self, address: &TileAddress) -> (Arc<Tile>, bool) {
        let mut tiles = lock(&self.tiles);
        if let Some(tile) = tiles.get(address) {
            return (Arc::clone(tile), false);
        }

        let tile = Arc::new(Tile::new(address.clone(), &self.grid(address.zoom)));
        if let Some((evicted, _)) = tiles.push(address.clone(), Arc::clone(&tile)) {
            log::trace!("Evicted {evicted}.");
        }
        (tile, true)
    }

    /// Load the tile in the background. The returned receiver resolves once the load is done,
    /// or gets cancelled if it is abandoned.
    ///
    /// Refused requests leave the tile not loading, so it can be requested again later, e.g. on
    /// the next frame after [`RequestRefused::QueueFull`].
    pub fn request_load(
        &self,
        tile: &Arc<Tile>,
    ) -> Result<oneshot::Receiver<LoadState>, RequestRefused> {
        let address = tile.address().clone();
        let mut in_flight = lock(&self.shared.in_flight);

        if in_flight.contains(&address) {
            log::trace!("{address} is already loading.");
            return Err(RequestRefused::AlreadyLoading);
        }

        // Children are loaded as tiles of their own, so they share the limit of one load per
        // address with the rest of the cache.
        let children = self.provider.child_tiles(&address);
        if let Some(busy) = children.iter().flatten().find(|child| in_flight.contains(*child)) {
            log::trace!("{address} has to wait for {busy}, which is already loading.");
            return Err(RequestRefused::AlreadyLoading);
        }

        if !tile.begin_loading() {
            log::trace!("{address} is already loading.");
            return Err(RequestRefused::AlreadyLoading);
        }

        tile.set_url(self.provider.tile_url(&address));

        let requests = match children {
            Some(children) => {
                let grid = self.grid(address.zoom.saturating_add(1));
                let children: Vec<_> = children
                    .into_iter()
                    .map(|child| Arc::new(Tile::new(child, &grid)))
                    .collect();
                tile.adopt_children(children.clone());
                children
            }
            None => vec![Arc::clone(tile)],
        };

        let generation = self.shared.current_generation();
        let mut request_tx = lock(&self.request_tx);
        for request in requests {
            let child = !Arc::ptr_eq(&request, tile);
            if child && !request.begin_loading() {
                continue;
            }

            let request_address = request.address().clone();
            if let Err(err) = request_tx.try_send(LoadRequest {
                tile: request,
                generation,
            }) {
                let refused = if err.is_full() {
                    // Trying to load too many tiles at once.
                    log::trace!("Request queue is full, {address} has to be requested again.");
                    RequestRefused::QueueFull
                } else {
                    log::error!("IO thread is dead.");
                    RequestRefused::LoaderStopped
                };

                // Children which were already sent end up orphaned and their results are
                // dropped.
                for child in tile.release_children() {
                    child.cancel_loading();
                }
                tile.cancel_loading();
                return Err(refused);
            }

            in_flight.insert(request_address);
        }

        in_flight.insert(address);
        log::trace!("Requested {}.", tile.address());
        Ok(tile.subscribe_load())
    }

    /// Drop the cached tiles, typically because the zoom, the provider or the overlay settings
    /// changed. Loads in progress are cancelled and their results will be thrown away. Tiles
    /// which failed to load are kept if `keep_errored` is set, with their overlays reset.
    pub fn invalidate_all(&self, keep_errored: bool) {
        self.shared.generation.fetch_add(1, Ordering::AcqRel);

        let mut tiles = lock(&self.tiles);

        // Least recently used first, so they can be put back in the same order.
        let all: Vec<_> = tiles
            .iter()
            .rev()
            .map(|(address, tile)| (address.clone(), Arc::clone(tile)))
            .collect();
        tiles.clear();

        let mut kept = 0;
        for (address, tile) in all {
            if keep_errored && matches!(tile.load_state(), LoadState::LoadError(_)) {
                tile.reset_overlay();
                tiles.put(address, tile);
                kept += 1;
            } else {
                tile.cancel_loading();
            }
        }

        log::debug!("Tile cache invalidated, {kept} errored tiles kept.");
    }

    /// Reset overlays of all cached tiles.
    pub fn reset_overlays(&self) {
        for (_, tile) in lock(&self.tiles).iter() {
            tile.reset_overlay();
        }
    }

    /// Register a callback which is called, from the IO thread, whenever a tile finished loading.
    /// It must not block.
    pub fn set_tile_updated_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        *lock(&self.shared.on_tile_updated) = Some(Arc::new(callback));
    }

    pub fn stats(&self) -> Stats {
        *lock(&self.shared.stats)
    }

    pub fn len(&self) -> usize {
        lock(&self.tiles).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.tiles).is_empty()
    }

    pub fn capacity(&self) -> usize {
        lock(&self.tiles).cap().get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        sources::{HttpOptions, HttpProvider},
        tile::OverlayCheckState,
    };
    use image::{Rgba, RgbaImage};
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    #[derive(Debug, thiserror::Error)]
    #[error("no such tile")]
    struct NoSuchTile;

    /// Provider which counts the fetches and fails the tiles in the row 13. Tiles at
    /// `composite_zoom` are composed out of their children.
    #[derive(Default)]
    struct Counting {
        fetches: Arc<AtomicUsize>,
        delay: Duration,
        composite_zoom: Option<u8>,
    }

    impl MapProvider for Counting {
        type Error = NoSuchTile;

        fn id(&self) -> &str {
            "counting"
        }

        fn tile_size(&self) -> u32 {
            4
        }

        async fn fetch_tile_image(&self, address: &TileAddress) -> Result<RgbaImage, NoSuchTile> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if address.row == 13 {
                Err(NoSuchTile)
            } else {
                Ok(RgbaImage::from_pixel(4, 4, Rgba([10, 20, 30, 255])))
            }
        }

        fn child_tiles(&self, address: &TileAddress) -> Option<Vec<TileAddress>> {
            if self.composite_zoom == Some(address.zoom) {
                address.children().map(Vec::from)
            } else {
                None
            }
        }
    }

    async fn wait_for(tile: &Tile) -> LoadState {
        tile.subscribe_load().await.unwrap()
    }

    #[test]
    fn equal_addresses_give_the_same_tile() {
        let _ = env_logger::try_init();

        let cache = TileCache::new(Counting::default()).unwrap();
        let address = cache.address(3, 1, 2);

        let (a, created) = cache.get_or_create_reporting(&address);
        assert!(created);
        let (b, created) = cache.get_or_create_reporting(&address);
        assert!(!created);

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.load_state(), LoadState::NotLoading);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn cache_is_bounded() {
        let _ = env_logger::try_init();

        let options = CacheOptions {
            capacity: NonZeroUsize::new(2).unwrap(),
            ..Default::default()
        };
        let cache = TileCache::with_options(Counting::default(), options).unwrap();

        for column in 0..5 {
            cache.get_or_create(&cache.address(3, column, 0));
        }

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&cache.address(3, 0, 0)).is_none());
        assert!(cache.get(&cache.address(3, 4, 0)).is_some());
    }

    #[tokio::test]
    async fn only_one_load_at_a_time() {
        let _ = env_logger::try_init();

        let provider = Counting {
            delay: Duration::from_millis(50),
            ..Default::default()
        };
        let fetches = Arc::clone(&provider.fetches);
        let cache = TileCache::new(provider).unwrap();
        let tile = cache.get_or_create(&cache.address(3, 1, 2));

        let rx = cache.request_load(&tile).unwrap();
        assert_eq!(
            cache.request_load(&tile).unwrap_err(),
            RequestRefused::AlreadyLoading
        );
        assert_eq!(tile.load_state(), LoadState::Loading);

        assert_eq!(rx.await.unwrap(), LoadState::Loaded);
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert!(tile.image().is_some());
        assert!(tile.load_timing().started.is_some());
    }

    #[tokio::test]
    async fn load_error_is_stored_in_the_tile() {
        let _ = env_logger::try_init();

        let cache = TileCache::new(Counting::default()).unwrap();
        let tile = cache.get_or_create(&cache.address(4, 1, 13));
        cache.request_load(&tile).unwrap();

        assert_eq!(
            wait_for(&tile).await,
            LoadState::LoadError("no such tile".to_string())
        );
        assert!(tile.image().is_none());
    }

    #[tokio::test]
    async fn tile_updated_callback_is_called() {
        let _ = env_logger::try_init();

        let cache = TileCache::new(Counting::default()).unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        cache.set_tile_updated_callback(move || {
            let _ = tx.send(());
        });

        let tile = cache.get_or_create(&cache.address(3, 1, 2));
        cache.request_load(&tile).unwrap();

        rx.recv().await.unwrap();
        assert_eq!(tile.load_state(), LoadState::Loaded);
    }

    #[tokio::test]
    async fn invalidating_keeps_only_errored_tiles() {
        let _ = env_logger::try_init();

        let cache = TileCache::new(Counting::default()).unwrap();
        let errored = cache.get_or_create(&cache.address(4, 0, 13));
        let loaded = cache.get_or_create(&cache.address(4, 0, 1));
        cache.request_load(&errored).unwrap();
        cache.request_load(&loaded).unwrap();
        wait_for(&errored).await;
        wait_for(&loaded).await;

        errored.set_overlay_check_state(OverlayCheckState::Checked);
        cache.invalidate_all(true);

        assert_eq!(cache.len(), 1);
        let kept = cache.get(errored.address()).unwrap();
        assert!(Arc::ptr_eq(&kept, &errored));
        assert_eq!(kept.overlay_check_state(), OverlayCheckState::NotChecked);

        cache.invalidate_all(false);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn invalidating_discards_loads_in_progress() {
        let _ = env_logger::try_init();

        let provider = Counting {
            delay: Duration::from_millis(100),
            ..Default::default()
        };
        let cache = TileCache::new(provider).unwrap();
        let address = cache.address(3, 1, 2);
        let tile = cache.get_or_create(&address);
        let rx = cache.request_load(&tile).unwrap();

        cache.invalidate_all(false);
        assert_eq!(tile.load_state(), LoadState::NotLoading);
        assert!(rx.await.is_err());

        // Old load is still in flight, so another one for the same address must wait.
        let fresh = cache.get_or_create(&address);
        assert!(!Arc::ptr_eq(&fresh, &tile));
        assert_eq!(
            cache.request_load(&fresh).unwrap_err(),
            RequestRefused::AlreadyLoading
        );

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(tile.load_state(), LoadState::NotLoading);
        assert!(tile.image().is_none());

        let rx = cache.request_load(&fresh).unwrap();
        assert_eq!(rx.await.unwrap(), LoadState::Loaded);
    }

    #[tokio::test]
    async fn parent_is_composed_out_of_children() {
        let _ = env_logger::try_init();

        let provider = Counting {
            composite_zoom: Some(3),
            ..Default::default()
        };
        let fetches = Arc::clone(&provider.fetches);
        let cache = TileCache::new(provider).unwrap();

        // Row 6 at zoom 3 has children in rows 12 and 13, the latter fail.
        let parent = cache.get_or_create(&cache.address(3, 2, 6));
        let rx = cache.request_load(&parent).unwrap();

        assert_eq!(rx.await.unwrap(), LoadState::Loaded);
        assert_eq!(fetches.load(Ordering::SeqCst), 4);

        let pixels = parent.image().unwrap().to_rgba().unwrap();
        assert_eq!(pixels.dimensions(), (4, 4));
        assert_eq!(*pixels.get_pixel(0, 0), Rgba([10, 20, 30, 255]));
        assert_eq!(*pixels.get_pixel(0, 3), Rgba([0, 0, 0, 0]));

        // Children were released once the parent got composed.
        assert!(parent.children().is_empty());
        assert_eq!(parent.children_with_errors().len(), 2);
    }

    #[tokio::test]
    async fn children_already_loading_are_not_fetched_again() {
        let _ = env_logger::try_init();

        let provider = Counting {
            delay: Duration::from_millis(100),
            composite_zoom: Some(3),
            ..Default::default()
        };
        let fetches = Arc::clone(&provider.fetches);
        let cache = TileCache::new(provider).unwrap();

        // One of the children of 3-2-6, loading on its own.
        let child = cache.get_or_create(&cache.address(4, 4, 12));
        let rx = cache.request_load(&child).unwrap();

        let parent = cache.get_or_create(&cache.address(3, 2, 6));
        assert_eq!(
            cache.request_load(&parent).unwrap_err(),
            RequestRefused::AlreadyLoading
        );
        assert_eq!(parent.load_state(), LoadState::NotLoading);
        assert!(parent.children().is_empty());

        assert_eq!(rx.await.unwrap(), LoadState::Loaded);
        assert_eq!(fetches.load(Ordering::SeqCst), 1);

        let rx = cache.request_load(&parent).unwrap();
        assert_eq!(rx.await.unwrap(), LoadState::Loaded);
        assert_eq!(fetches.load(Ordering::SeqCst), 5);

        // Children in flight block a standalone load of the same address too.
        let parent = cache.get_or_create(&cache.address(3, 3, 6));
        cache.request_load(&parent).unwrap();
        let child = cache.get_or_create(&cache.address(4, 6, 12));
        assert_eq!(
            cache.request_load(&child).unwrap_err(),
            RequestRefused::AlreadyLoading
        );
        assert_eq!(wait_for(&parent).await, LoadState::Loaded);
        assert_eq!(fetches.load(Ordering::SeqCst), 9);
    }

    #[tokio::test]
    async fn tiles_refused_by_a_full_queue_can_be_requested_again() {
        let _ = env_logger::try_init();

        let provider = Counting {
            delay: Duration::from_millis(50),
            ..Default::default()
        };
        let fetches = Arc::clone(&provider.fetches);
        let cache = TileCache::new(provider).unwrap();
        let tiles: Vec<_> = (0..20)
            .map(|column| cache.get_or_create(&cache.address(5, column, 0)))
            .collect();

        let mut refused = Vec::new();
        for tile in &tiles {
            match cache.request_load(tile) {
                Ok(_) => {}
                Err(RequestRefused::QueueFull) => {
                    assert_eq!(tile.load_state(), LoadState::NotLoading);
                    refused.push(Arc::clone(tile));
                }
                Err(other) => panic!("unexpected refusal: {other}"),
            }
        }

        // Queue holds only a handful of requests, and loading takes a while.
        assert!(!refused.is_empty());

        // Asking again, as done on every frame, eventually gets everything loaded.
        tokio::time::timeout(Duration::from_secs(10), async {
            while !refused.is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
                refused.retain(|tile| {
                    matches!(
                        cache.request_load(tile),
                        Err(RequestRefused::QueueFull)
                    )
                });
            }
            for tile in &tiles {
                assert_eq!(wait_for(tile).await, LoadState::Loaded);
            }
        })
        .await
        .unwrap();

        assert_eq!(fetches.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn garbage_source_leads_to_load_error() {
        let _ = env_logger::try_init();

        let provider = HttpProvider::new(
            "garbage",
            "totally invalid url/{z}/{x}/{y}",
            HttpOptions::default(),
        )
        .unwrap();
        let cache = TileCache::new(provider).unwrap();
        let tile = cache.get_or_create(&cache.address(1, 0, 0));
        cache.request_load(&tile).unwrap();

        assert!(matches!(wait_for(&tile).await, LoadState::LoadError(_)));
        assert!(tile.url().is_some());
    }
}
