//! Disposable, shared image handles.

use image::RgbaImage;
use std::sync::{
    Arc, PoisonError, RwLock,
    atomic::{AtomicU64, Ordering},
};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ImageError {
    #[error("image {0} is already disposed")]
    Disposed(u64),
}

/// Shared handle to an [`Image`]. Two handles point to the same image when they are
/// [`Arc::ptr_eq`].
pub type ImageHandle = Arc<Image>;

/// Raster image which can be explicitly released while handles to it are still around.
/// Disposed images behave as if they were never there.
#[derive(Debug)]
pub struct Image {
    id: u64,
    pixels: RwLock<Option<RgbaImage>>,
}

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

impl Image {
    pub fn new(pixels: RgbaImage) -> ImageHandle {
        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            pixels: RwLock::new(Some(pixels)),
        })
    }

    /// Unique identifier of this image, mainly for logs.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Release the pixel data. Fails if already disposed.
    pub fn dispose(&self) -> Result<(), ImageError> {
        let mut pixels = self.pixels.write().unwrap_or_else(PoisonError::into_inner);
        match pixels.take() {
            Some(_) => Ok(()),
            None => Err(ImageError::Disposed(self.id)),
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.pixels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Run `f` on the pixels, unless the image is disposed.
    pub fn with_pixels<R>(&self, f: impl FnOnce(&RgbaImage) -> R) -> Option<R> {
        self.pixels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(f)
    }

    /// Copy of the pixels, unless the image is disposed.
    pub fn to_rgba(&self) -> Option<RgbaImage> {
        self.with_pixels(Clone::clone)
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.with_pixels(RgbaImage::dimensions)
    }
}

/// Dispose the image, ignoring the fact it might have been disposed already. Concurrent
/// evictions make double disposal a normal thing.
pub(crate) fn dispose_quietly(image: &Image) {
    if let Err(err) = image.dispose() {
        log::trace!("{err}");
    }
}
