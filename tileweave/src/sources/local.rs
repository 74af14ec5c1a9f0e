use super::{FetchError, is_served, wrapped_column};
use crate::{provider::MapProvider, tiles::TileAddress};
use image::RgbaImage;
use std::path::{Path, PathBuf};

/// Reads the tiles from a directory laid out as `{root}/{z}/{x}/{y}.png`.
pub struct LocalTiles {
    id: String,
    root: PathBuf,
    max_zoom: u8,
}

impl LocalTiles {
    pub fn new(id: impl Into<String>, root: impl AsRef<Path>) -> Self {
        Self {
            id: id.into(),
            root: root.as_ref().into(),
            max_zoom: 19,
        }
    }

    pub fn with_max_zoom(mut self, max_zoom: u8) -> Self {
        self.max_zoom = max_zoom;
        self
    }

    /// Where the tile is expected to be. Columns past either edge of the map wrap around.
    pub fn tile_path(&self, address: &TileAddress) -> PathBuf {
        let (tiles_wide, _) = self.map_tile_count(address.zoom);
        let column = wrapped_column(address, tiles_wide);

        PathBuf::from_iter([
            self.root.clone(),
            address.zoom.to_string().into(),
            column.to_string().into(),
            format!("{}.png", address.row).into(),
        ])
    }
}

impl MapProvider for LocalTiles {
    type Error = FetchError;

    fn id(&self) -> &str {
        &self.id
    }

    fn max_zoom(&self) -> u8 {
        self.max_zoom
    }

    async fn fetch_tile_image(&self, address: &TileAddress) -> Result<RgbaImage, FetchError> {
        let (_, tiles_tall) = self.map_tile_count(address.zoom);
        if !is_served(address, tiles_tall, self.max_zoom) {
            return Err(FetchError::Unsupported(address.clone()));
        }

        let path = self.tile_path(address);
        log::trace!("Reading {address} from {}.", path.display());

        let bytes = tokio::fs::read(&path).await?;
        Ok(image::load_from_memory(&bytes)?.to_rgba8())
    }

    fn tile_url(&self, address: &TileAddress) -> Option<String> {
        Some(self.tile_path(address).display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cache::TileCache, tile::LoadState};
    use image::Rgba;

    /// Fresh directory with a single red tile at 1/1/0.
    fn tiles_dir(name: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!("tileweave-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&root);
        std::fs::create_dir_all(root.join("1").join("1")).unwrap();

        RgbaImage::from_pixel(256, 256, Rgba([255, 0, 0, 255]))
            .save(root.join("1").join("1").join("0.png"))
            .unwrap();
        root
    }

    #[tokio::test]
    async fn reads_tiles_from_the_directory() {
        let _ = env_logger::try_init();
        let root = tiles_dir("read");
        let provider = LocalTiles::new("local", &root);

        let image = provider
            .fetch_tile_image(&TileAddress::new("local", 1, 1, 0))
            .await
            .unwrap();
        assert_eq!(image.dimensions(), (256, 256));
        assert_eq!(*image.get_pixel(10, 10), Rgba([255, 0, 0, 255]));

        let missing = provider
            .fetch_tile_image(&TileAddress::new("local", 1, 0, 0))
            .await;
        assert!(matches!(missing, Err(FetchError::Io(_))));

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn columns_wrap_around_the_world() {
        let _ = env_logger::try_init();
        let root = tiles_dir("wrap");
        let provider = LocalTiles::new("local", &root);

        for column in [-1, 3] {
            let address = TileAddress::new("local", 1, column, 0);
            assert_eq!(
                provider.tile_path(&address),
                root.join("1").join("1").join("0.png")
            );
            assert!(provider.fetch_tile_image(&address).await.is_ok());
        }

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn loads_through_the_cache() {
        let _ = env_logger::try_init();
        let root = tiles_dir("cache");

        let cache = TileCache::new(LocalTiles::new("local", &root)).unwrap();
        let tile = cache.get_or_create(&cache.address(1, 1, 0));
        let loaded = cache.request_load(&tile).unwrap();

        assert_eq!(loaded.await.unwrap(), LoadState::Loaded);
        assert!(tile.image().is_some());
        assert_eq!(
            tile.url().unwrap(),
            root.join("1").join("1").join("0.png").display().to_string()
        );

        let _ = std::fs::remove_dir_all(root);
    }
}
