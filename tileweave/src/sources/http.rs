use super::{FetchError, is_served, wrapped_column};
use crate::{provider::MapProvider, tiles::TileAddress};
use image::RgbaImage;
use reqwest::header::{HeaderMap, USER_AGENT};

pub use reqwest::header::HeaderValue;

/// Controls how [`HttpProvider`] uses the HTTP protocol.
#[derive(Debug, Clone)]
pub struct HttpOptions {
    /// User agent to be sent to the tile servers.
    pub user_agent: Option<HeaderValue>,

    /// Maximum number of parallel downloads.
    ///
    /// Many services have rate limits, and exceeding them may result in throttling, bans, or
    /// degraded service. Use the default value when in doubt.
    pub max_parallel_downloads: MaxParallelDownloads,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            user_agent: Some(HeaderValue::from_static(concat!(
                env!("CARGO_PKG_NAME"),
                "/",
                env!("CARGO_PKG_VERSION"),
            ))),
            max_parallel_downloads: MaxParallelDownloads::default(),
        }
    }
}

/// Maximum number of parallel downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxParallelDownloads(pub usize);

impl Default for MaxParallelDownloads {
    /// Same as what browsers do.
    fn default() -> Self {
        Self(6)
    }
}

impl MaxParallelDownloads {
    /// Use custom value. Check the terms of use of the tile server first.
    pub fn value_manually_confirmed_with_provider_limits(value: usize) -> Self {
        Self(value)
    }
}

/// Downloads the tiles from a server, addressing them with an URL template containing `{z}`,
/// `{x}` and `{y}` placeholders.
pub struct HttpProvider {
    id: String,
    url_template: String,
    client: reqwest::Client,
    max_parallel_downloads: MaxParallelDownloads,
    tile_size: u32,
    max_zoom: u8,
}

impl HttpProvider {
    pub fn new(
        id: impl Into<String>,
        url_template: impl Into<String>,
        options: HttpOptions,
    ) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        if let Some(user_agent) = options.user_agent {
            headers.insert(USER_AGENT, user_agent);
        }

        // Keep a single client, so the connections are reused.
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(Self {
            id: id.into(),
            url_template: url_template.into(),
            client,
            max_parallel_downloads: options.max_parallel_downloads,
            tile_size: 256,
            max_zoom: 19,
        })
    }

    /// <https://www.openstreetmap.org/about>
    pub fn openstreetmap(options: HttpOptions) -> Result<Self, FetchError> {
        Self::new(
            "osm",
            "https://tile.openstreetmap.org/{z}/{x}/{y}.png",
            options,
        )
    }

    pub fn with_tile_size(mut self, tile_size: u32) -> Self {
        self.tile_size = tile_size;
        self
    }

    pub fn with_max_zoom(mut self, max_zoom: u8) -> Self {
        self.max_zoom = max_zoom;
        self
    }

    fn url(&self, address: &TileAddress) -> String {
        let (tiles_wide, _) = self.map_tile_count(address.zoom);
        let column = wrapped_column(address, tiles_wide);

        self.url_template
            .replace("{z}", &address.zoom.to_string())
            .replace("{x}", &column.to_string())
            .replace("{y}", &address.row.to_string())
    }
}

impl MapProvider for HttpProvider {
    type Error = FetchError;

    fn id(&self) -> &str {
        &self.id
    }

    fn tile_size(&self) -> u32 {
        self.tile_size
    }

    fn max_zoom(&self) -> u8 {
        self.max_zoom
    }

    fn max_concurrency(&self) -> usize {
        self.max_parallel_downloads.0
    }

    async fn fetch_tile_image(&self, address: &TileAddress) -> Result<RgbaImage, FetchError> {
        let (_, tiles_tall) = self.map_tile_count(address.zoom);
        if !is_served(address, tiles_tall, self.max_zoom) {
            return Err(FetchError::Unsupported(address.clone()));
        }

        let url = self.url(address);
        log::debug!("Getting {address} from {url}.");

        let response = self.client.get(&url).send().await?;
        log::trace!("Downloaded {:?}.", response.status());

        let bytes = response.error_for_status()?.bytes().await?;
        Ok(image::load_from_memory(&bytes)?.to_rgba8())
    }

    fn tile_url(&self, address: &TileAddress) -> Option<String> {
        Some(self.url(address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgba};
    use std::io::Cursor;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        sync::oneshot,
    };

    fn osm() -> HttpProvider {
        HttpProvider::openstreetmap(HttpOptions::default()).unwrap()
    }

    #[test]
    fn url_template_is_filled() {
        let provider = osm();
        assert_eq!(
            provider.tile_url(&TileAddress::new("osm", 5, 17, 10)).unwrap(),
            "https://tile.openstreetmap.org/5/17/10.png"
        );
    }

    #[test]
    fn columns_wrap_around_the_world() {
        let provider = osm();
        assert_eq!(
            provider.tile_url(&TileAddress::new("osm", 2, -1, 0)).unwrap(),
            "https://tile.openstreetmap.org/2/3/0.png"
        );
        assert_eq!(
            provider.tile_url(&TileAddress::new("osm", 2, 5, 0)).unwrap(),
            "https://tile.openstreetmap.org/2/1/0.png"
        );
    }

    #[tokio::test]
    async fn rows_outside_of_the_map_are_not_requested() {
        let _ = env_logger::try_init();

        let provider = osm();
        let result = provider
            .fetch_tile_image(&TileAddress::new("osm", 2, 0, 4))
            .await;
        assert!(matches!(result, Err(FetchError::Unsupported(_))));

        let result = provider
            .fetch_tile_image(&TileAddress::new("osm", 20, 0, 0))
            .await;
        assert!(matches!(result, Err(FetchError::Unsupported(_))));
    }

    /// Answers a single request with the given status and body. Returns the URL template to
    /// reach it, and the received request head.
    async fn serve_once(
        status: &'static str,
        body: Vec<u8>,
    ) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let (request_tx, request_rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            let mut request = Vec::new();
            let mut buffer = [0; 1024];
            while !request.ends_with(b"\r\n\r\n") {
                let read = stream.read(&mut buffer).await.unwrap();
                if read == 0 {
                    break;
                }
                request.extend_from_slice(&buffer[..read]);
            }
            let _ = request_tx.send(String::from_utf8_lossy(&request).into_owned());

            let head = format!(
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            stream.write_all(head.as_bytes()).await.unwrap();
            stream.write_all(&body).await.unwrap();
        });

        (format!("http://{address}/{{z}}/{{x}}/{{y}}.png"), request_rx)
    }

    fn png(color: Rgba<u8>) -> Vec<u8> {
        let mut bytes = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgba8(RgbaImage::from_pixel(256, 256, color))
            .write_to(&mut bytes, ImageFormat::Png)
            .unwrap();
        bytes.into_inner()
    }

    #[tokio::test]
    async fn downloaded_tile_is_decoded() {
        let _ = env_logger::try_init();

        let (template, request) = serve_once("200 OK", png(Rgba([0, 0, 255, 255]))).await;
        let provider = HttpProvider::new("local", template, HttpOptions::default()).unwrap();

        let image = provider
            .fetch_tile_image(&TileAddress::new("local", 1, -1, 0))
            .await
            .unwrap();
        assert_eq!(image.dimensions(), (256, 256));
        assert_eq!(*image.get_pixel(100, 100), Rgba([0, 0, 255, 255]));

        let request = request.await.unwrap();
        assert!(request.starts_with("GET /1/1/0.png HTTP/1.1"));
        assert!(
            request
                .to_lowercase()
                .contains(concat!("user-agent: tileweave/", env!("CARGO_PKG_VERSION")))
        );
    }

    #[tokio::test]
    async fn server_errors_are_reported() {
        let _ = env_logger::try_init();

        let (template, _) = serve_once("404 Not Found", Vec::new()).await;
        let provider = HttpProvider::new("local", template, HttpOptions::default()).unwrap();

        let result = provider
            .fetch_tile_image(&TileAddress::new("local", 1, 0, 0))
            .await;
        assert!(matches!(result, Err(FetchError::Http(_))));
    }

    #[tokio::test]
    async fn garbage_is_not_an_image() {
        let _ = env_logger::try_init();

        let (template, _) = serve_once("200 OK", b"definitely not a png".to_vec()).await;
        let provider = HttpProvider::new("local", template, HttpOptions::default()).unwrap();

        let result = provider
            .fetch_tile_image(&TileAddress::new("local", 1, 0, 0))
            .await;
        assert!(matches!(result, Err(FetchError::Decode(_))));
    }

    #[test]
    fn parallel_downloads_limit_the_concurrency() {
        let provider = HttpProvider::new(
            "custom",
            "http://localhost/{z}/{x}/{y}.png",
            HttpOptions {
                user_agent: None,
                max_parallel_downloads:
                    MaxParallelDownloads::value_manually_confirmed_with_provider_limits(2),
            },
        )
        .unwrap()
        .with_tile_size(512);

        assert_eq!(provider.max_concurrency(), 2);
        assert_eq!(provider.tile_size(), 512);
    }
}
