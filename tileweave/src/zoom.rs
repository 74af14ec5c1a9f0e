#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("invalid zoom level")]
pub struct InvalidZoom;

/// Zoom levels supported by a map provider, both ends inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
pub struct ZoomRange {
    pub min: u8,
    pub max: u8,
}

impl Default for ZoomRange {
    fn default() -> Self {
        // Mapnik supports zooms up to 19.
        // https://wiki.openstreetmap.org/wiki/Slippy_map_tilenames#Zoom_levels
        Self { min: 0, max: 19 }
    }
}

impl ZoomRange {
    pub fn contains(&self, zoom: u8) -> bool {
        (self.min..=self.max).contains(&zoom)
    }

    /// Return the zoom unchanged if supported, `Err(InvalidZoom)` otherwise.
    pub fn check(&self, zoom: u8) -> Result<u8, InvalidZoom> {
        if self.contains(zoom) {
            Ok(zoom)
        } else {
            Err(InvalidZoom)
        }
    }

    pub fn clamp(&self, zoom: u8) -> u8 {
        zoom.clamp(self.min, self.max.max(self.min))
    }
}
