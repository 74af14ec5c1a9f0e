use crate::{
    position::{Pixels, Position},
    provider::MapProvider,
    viewport::{DeviceSize, ViewportCalculator},
    zoom::InvalidZoom,
};

/// What stays in place when zooming.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ZoomAnchor {
    /// Center of the map.
    Center,

    /// Point under the mouse pointer, given in device pixels.
    Pointer { position: Pixels, size: DeviceSize },
}

/// State of the map which must persist between frames: world pixel center and zoom.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
pub struct MapMemory {
    center: Pixels,
    zoom: u8,
}

impl Default for MapMemory {
    fn default() -> Self {
        Self {
            center: Pixels::new(0., 0.),
            zoom: 0,
        }
    }
}

impl MapMemory {
    /// Memory centered at the given position.
    pub fn new<P: MapProvider>(
        provider: &P,
        calculator: &ViewportCalculator,
        position: Position,
        zoom: u8,
    ) -> Self {
        let mut memory = Self {
            zoom: provider.zoom_range().clamp(zoom),
            ..Default::default()
        };
        memory.center_at(provider, calculator, position);
        memory
    }

    /// Center of the map in world pixels.
    pub fn center(&self) -> Pixels {
        self.center
    }

    pub fn zoom(&self) -> u8 {
        self.zoom
    }

    /// Center of the map as a geographical position.
    pub fn geo_center<P: MapProvider>(&self, provider: &P) -> Position {
        provider
            .projection()
            .projection()
            .pixel_to_geo(self.center, &provider.grid(self.zoom))
    }

    /// Center at the given position, clamped to the map.
    pub fn center_at<P: MapProvider>(
        &mut self,
        provider: &P,
        calculator: &ViewportCalculator,
        position: Position,
    ) {
        let grid = provider.grid(self.zoom);
        let center = provider
            .projection()
            .projection()
            .geo_to_pixel(position, &grid);
        self.center = calculator.clamp_center(center, &grid);
    }

    /// Set the world pixel center, clamped to the map.
    pub fn set_center<P: MapProvider>(
        &mut self,
        provider: &P,
        calculator: &ViewportCalculator,
        center: Pixels,
    ) {
        self.center = calculator.clamp_center(center, &provider.grid(self.zoom));
    }

    /// Move the map by the given number of pixels.
    pub fn pan<P: MapProvider>(
        &mut self,
        provider: &P,
        calculator: &ViewportCalculator,
        dx: f64,
        dy: f64,
    ) {
        let center = Pixels::new(self.center.x() + dx, self.center.y() + dy);
        self.set_center(provider, calculator, center);
    }

    /// Change the zoom, clamped to what the provider supports, and scale the center so it points
    /// to the same place as before. Returns whether the zoom actually changed. Nothing happens
    /// otherwise.
    pub fn set_zoom<P: MapProvider>(
        &mut self,
        provider: &P,
        calculator: &ViewportCalculator,
        zoom: u8,
        anchor: ZoomAnchor,
    ) -> bool {
        let zoom = provider.zoom_range().clamp(zoom);
        if zoom == self.zoom {
            return false;
        }

        let old = provider.grid(self.zoom);
        let new = provider.grid(zoom);
        let x_ratio = f64::from(new.tiles_wide) / f64::from(old.tiles_wide);
        let y_ratio = f64::from(new.tiles_tall) / f64::from(old.tiles_tall);

        let center = match anchor {
            ZoomAnchor::Center => {
                Pixels::new(self.center.x() * x_ratio, self.center.y() * y_ratio)
            }
            ZoomAnchor::Pointer { position, size } => {
                // Offset of the pointer from the center, which stays the same on the device.
                let dx = position.x() - f64::from(size.width) / 2.;
                let dy = position.y() - f64::from(size.height) / 2.;

                let anchor_x = (self.center.x() + dx) * x_ratio;
                let anchor_y = (self.center.y() + dy) * y_ratio;
                Pixels::new(anchor_x - dx, anchor_y - dy)
            }
        };

        log::debug!("Zoom changed from {} to {zoom}.", self.zoom);
        self.zoom = zoom;
        self.center = calculator.clamp_center(center, &new);
        true
    }

    /// Try to zoom in, returning `Err(InvalidZoom)` if already at maximum.
    pub fn zoom_in<P: MapProvider>(
        &mut self,
        provider: &P,
        calculator: &ViewportCalculator,
        anchor: ZoomAnchor,
    ) -> Result<(), InvalidZoom> {
        let zoom = self.zoom.checked_add(1).ok_or(InvalidZoom)?;
        let zoom = provider.zoom_range().check(zoom)?;
        self.set_zoom(provider, calculator, zoom, anchor);
        Ok(())
    }

    /// Try to zoom out, returning `Err(InvalidZoom)` if already at minimum.
    pub fn zoom_out<P: MapProvider>(
        &mut self,
        provider: &P,
        calculator: &ViewportCalculator,
        anchor: ZoomAnchor,
    ) -> Result<(), InvalidZoom> {
        let zoom = self.zoom.checked_sub(1).ok_or(InvalidZoom)?;
        let zoom = provider.zoom_range().check(zoom)?;
        self.set_zoom(provider, calculator, zoom, anchor);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{position::lat_lon, tiles::TileAddress, viewport::ViewportOptions};
    use approx::assert_relative_eq;
    use image::RgbaImage;

    #[derive(Debug, thiserror::Error)]
    #[error("never")]
    struct Never;

    /// Twice as wide as tall, like the old equirectangular maps.
    struct Wide;

    impl MapProvider for Wide {
        type Error = Never;

        fn id(&self) -> &str {
            "wide"
        }

        fn map_tile_count(&self, zoom: u8) -> (u32, u32) {
            let tall = 2u32.pow(u32::from(zoom));
            (tall * 2, tall)
        }

        fn max_zoom(&self) -> u8 {
            4
        }

        async fn fetch_tile_image(&self, _: &TileAddress) -> Result<RgbaImage, Never> {
            Err(Never)
        }
    }

    #[test]
    fn zooming_keeps_the_geographical_center() {
        let calculator = ViewportCalculator::default();
        let wroclaw = lat_lon(51.1, 17.03);
        let mut memory = MapMemory::new(&Wide, &calculator, wroclaw, 2);

        assert!(memory.set_zoom(&Wide, &calculator, 3, ZoomAnchor::Center));
        assert_eq!(memory.zoom(), 3);

        let center = memory.geo_center(&Wide);
        assert_relative_eq!(center.x(), wroclaw.x(), epsilon = 1e-9);
        assert_relative_eq!(center.y(), wroclaw.y(), epsilon = 1e-9);
    }

    #[test]
    fn center_scales_by_the_ratio_of_tile_counts() {
        let calculator = ViewportCalculator::default();
        let mut memory = MapMemory::default();
        memory.set_center(&Wide, &calculator, Pixels::new(300., 100.));

        memory.set_zoom(&Wide, &calculator, 2, ZoomAnchor::Center);
        assert_eq!(memory.center(), Pixels::new(1200., 400.));
    }

    #[test]
    fn zooming_to_the_same_level_does_nothing() {
        let calculator = ViewportCalculator::default();
        let mut memory = MapMemory::new(&Wide, &calculator, lat_lon(10., 10.), 2);
        let before = memory.clone();

        let pointer = ZoomAnchor::Pointer {
            position: Pixels::new(0., 0.),
            size: DeviceSize::new(100, 100),
        };
        assert!(!memory.set_zoom(&Wide, &calculator, 2, pointer));
        assert_eq!(memory, before);

        // Clamped to the same level as well.
        assert!(memory.set_zoom(&Wide, &calculator, 4, ZoomAnchor::Center));
        let before = memory.clone();
        assert!(!memory.set_zoom(&Wide, &calculator, 200, pointer));
        assert_eq!(memory, before);
    }

    #[test]
    fn zooming_around_pointer_keeps_it_in_place() {
        let calculator = ViewportCalculator::default();
        let mut memory = MapMemory::default();
        memory.set_zoom(&Wide, &calculator, 2, ZoomAnchor::Center);
        memory.set_center(&Wide, &calculator, Pixels::new(1000., 500.));

        let size = DeviceSize::new(200, 100);
        let pointer = Pixels::new(150., 20.);
        // World pixel under the pointer.
        let before = Pixels::new(1000. - 100. + 150., 500. - 50. + 20.);

        memory.set_zoom(
            &Wide,
            &calculator,
            3,
            ZoomAnchor::Pointer {
                position: pointer,
                size,
            },
        );

        let center = memory.center();
        let after = Pixels::new(center.x() - 100. + 150., center.y() - 50. + 20.);
        assert_relative_eq!(after.x(), before.x() * 2.);
        assert_relative_eq!(after.y(), before.y() * 2.);
    }

    #[test]
    fn zoom_limits() {
        let calculator = ViewportCalculator::default();
        let mut memory = MapMemory::default();
        assert_eq!(
            memory.zoom_out(&Wide, &calculator, ZoomAnchor::Center),
            Err(InvalidZoom)
        );

        for _ in 0..4 {
            memory
                .zoom_in(&Wide, &calculator, ZoomAnchor::Center)
                .unwrap();
        }
        assert_eq!(memory.zoom(), 4);
        assert_eq!(
            memory.zoom_in(&Wide, &calculator, ZoomAnchor::Center),
            Err(InvalidZoom)
        );
    }

    #[test]
    fn centering_is_clamped_with_the_calculators_slack() {
        let past_the_edge = lat_lon(0., 200.);

        let strict = ViewportCalculator::new(ViewportOptions {
            center_clamp_slack: 0.,
            ..Default::default()
        });
        let mut memory = MapMemory::new(&Wide, &strict, past_the_edge, 0);
        assert_eq!(memory.center(), Pixels::new(512., 128.));

        memory.center_at(&Wide, &ViewportCalculator::default(), past_the_edge);
        assert_eq!(memory.center(), Pixels::new(513., 128.));
    }

    #[test]
    fn panning_is_clamped() {
        let calculator = ViewportCalculator::default();
        let mut memory = MapMemory::default();

        // Zoom 0 of the wide map is 512x256 pixels.
        memory.pan(&Wide, &calculator, 1000., -1000.);
        assert_eq!(memory.center(), Pixels::new(513., -1.));
    }
}
