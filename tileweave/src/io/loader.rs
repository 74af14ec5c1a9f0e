//! Asynchronous loading loop.

use crate::{
    provider::MapProvider,
    tile::{Tile, lock},
    tiles::TileAddress,
};
use futures::{
    StreamExt,
    channel::mpsc::Receiver,
    future::{Either, select, select_all},
};
use image::RgbaImage;
use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

/// Called whenever a tile changed and a redraw may be productive.
pub type TileUpdated = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Number of tiles that are currently being loaded.
    pub in_progress: usize,
}

/// Tile to be loaded, along with the cache generation it was requested in.
pub(crate) struct LoadRequest {
    pub tile: Arc<Tile>,
    pub generation: u64,
}

/// State shared between the cache and the loading loop.
#[derive(Default)]
pub(crate) struct Shared {
    /// Bumped on every invalidation. Results of older requests are thrown away.
    pub generation: AtomicU64,

    /// Addresses which are being loaded right now. There is never more than one load per address.
    pub in_flight: Mutex<HashSet<TileAddress>>,

    pub stats: Mutex<Stats>,
    pub on_tile_updated: Mutex<Option<TileUpdated>>,
}

impl Shared {
    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn notify(&self) {
        let callback = lock(&self.on_tile_updated).clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Tile request channel from the main thread was broken.")]
    RequestChannelBroken,
}

async fn load<P: MapProvider>(
    provider: &P,
    request: LoadRequest,
) -> (LoadRequest, Result<RgbaImage, String>) {
    request.tile.mark_load_started();
    let result = provider
        .fetch_tile_image(request.tile.address())
        .await
        .map_err(|e| e.to_string());
    (request, result)
}

fn load_complete<P: MapProvider>(
    provider: &P,
    shared: &Shared,
    request: LoadRequest,
    result: Result<RgbaImage, String>,
) {
    let LoadRequest { tile, generation } = request;
    lock(&shared.in_flight).remove(tile.address());

    if generation != shared.current_generation() {
        log::debug!("Discarding load of {} from an older generation.", tile.address());
        tile.cancel_loading();
        if let Some(parent) = tile.parent() {
            parent.cancel_loading();
            parent.release_children();
            lock(&shared.in_flight).remove(parent.address());
        }
        shared.notify();
        return;
    }

    if let Err(message) = &result {
        log::warn!("Could not load {}: {message}", tile.address());
    } else {
        log::trace!("Loaded {}.", tile.address());
    }

    tile.finish_loading(result);

    if let Some(parent) = tile.parent()
        && parent.all_children_done()
    {
        compose_parent(provider, shared, &parent);
    }

    shared.notify();
}

fn compose_parent<P: MapProvider>(provider: &P, shared: &Shared, parent: &Tile) {
    let children = parent.children();
    let errors = parent.children_with_errors();

    let result = provider
        .compose_parent_image(parent, &children)
        .ok_or_else(|| format!("none of {} children could be loaded", children.len()));

    log::debug!(
        "Composed {} out of {} children, {} failed.",
        parent.address(),
        children.len(),
        errors.len()
    );

    parent.finish_loading(result);
    parent.release_children();
    lock(&shared.in_flight).remove(parent.address());
}

fn update_stats(shared: &Shared, in_progress: usize) {
    lock(&shared.stats).in_progress = in_progress;
}

async fn load_continuously_impl<P: MapProvider>(
    provider: Arc<P>,
    shared: Arc<Shared>,
    mut request_rx: Receiver<LoadRequest>,
) -> Result<(), Error> {
    let provider = provider.as_ref();
    let mut outstanding = Vec::new();

    loop {
        if outstanding.is_empty() {
            // Only new loads might be requested.
            let request = request_rx.next().await.ok_or(Error::RequestChannelBroken)?;
            outstanding.push(Box::pin(load(provider, request)));
        } else if outstanding.len() < provider.max_concurrency() {
            // New loads might be requested or ongoing loads might be completed.
            match select(request_rx.next(), select_all(outstanding.drain(..))).await {
                // New load was requested.
                Either::Left((request, remaining)) => {
                    let request = request.ok_or(Error::RequestChannelBroken)?;
                    outstanding = remaining.into_inner();
                    outstanding.push(Box::pin(load(provider, request)));
                }
                // Ongoing load was completed.
                Either::Right((((request, result), _, remaining), _)) => {
                    outstanding = remaining;
                    load_complete(provider, &shared, request, result);
                }
            }
        } else {
            // Only ongoing loads might be completed.
            let ((request, result), _, remaining) = select_all(outstanding.drain(..)).await;
            outstanding = remaining;
            load_complete(provider, &shared, request, result);
        }

        update_stats(&shared, outstanding.len());
    }
}

/// Continuously load tiles requested via request channel.
pub(crate) async fn load_continuously<P: MapProvider>(
    provider: Arc<P>,
    shared: Arc<Shared>,
    request_rx: Receiver<LoadRequest>,
) {
    match load_continuously_impl(provider, shared, request_rx).await {
        Ok(()) | Err(Error::RequestChannelBroken) => {
            log::debug!("Tile load loop finished.");
        }
    }
}
