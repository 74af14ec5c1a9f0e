use crate::{
    handle::{ImageHandle, dispose_quietly},
    tile::lock,
    tiles::TileAddress,
};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

/// Key under which the overlay image of the tile `dx` columns and `dy` rows away from the
/// address is cached.
pub fn overlay_key(base: &str, address: &TileAddress, dx: i32, dy: i32) -> String {
    format!("{base}-{}", address.key_with_offset(dx, dy))
}

#[derive(Default)]
struct Inner {
    images: HashMap<String, ImageHandle>,

    /// Insertion order, oldest first.
    order: VecDeque<String>,
}

/// Bounded FIFO of overlay images. Evicted and replaced images get disposed.
pub struct OverlayImageCache {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl OverlayImageCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Default::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Cache the image. The oldest entries are evicted to make room for a new key. Putting
    /// a different image under an existing key replaces it in place, putting the same one does
    /// nothing.
    pub fn put(&self, key: String, image: ImageHandle) {
        let mut inner = lock(&self.inner);

        if let Some(existing) = inner.images.get_mut(&key) {
            if !Arc::ptr_eq(existing, &image) {
                let previous = std::mem::replace(existing, image);
                dispose_quietly(&previous);
            }
            return;
        }

        while inner.order.len() >= self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            if let Some(evicted) = inner.images.remove(&oldest) {
                log::trace!("Evicting overlay image {oldest}.");
                dispose_quietly(&evicted);
            }
        }

        inner.order.push_back(key.clone());
        inner.images.insert(key, image);
    }

    /// Cached image, unless it is missing or already disposed.
    pub fn get(&self, key: &str) -> Option<ImageHandle> {
        lock(&self.inner)
            .images
            .get(key)
            .filter(|image| !image.is_disposed())
            .cloned()
    }

    /// Dispose every image and forget about them.
    pub fn dispose_all(&self) {
        let mut inner = lock(&self.inner);
        let Inner { images, order } = &mut *inner;
        for key in order.drain(..) {
            if let Some(image) = images.remove(&key) {
                dispose_quietly(&image);
            }
        }
        images.clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).images.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner).images.is_empty()
    }
}
