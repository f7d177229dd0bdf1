use crate::imaging::{Image, Region};
use tracing::trace;

/// Peak-based brightness measurement used by the exposure controller.
///
/// The level is `min(1, max / 2^depth)` where `max` is the largest sample in
/// the region of interest (or the whole frame when the region is absent or
/// degenerate) and `depth` is the image's effective data depth.
#[derive(Debug, Clone, Default)]
pub struct SignalLevelEstimator {
    region: Option<Region>,
}

impl SignalLevelEstimator {
    pub fn new(region: Option<Region>) -> Self {
        Self { region }
    }

    pub fn region(&self) -> Option<Region> {
        self.region
    }

    pub fn set_region(&mut self, region: Option<Region>) {
        self.region = region;
    }

    /// Measure `image`, caching extrema and level on it
    pub fn compute_level(&self, image: &mut Image) -> f64 {
        let extrema = image.plane().region_extrema(self.region.as_ref());
        let full_scale = 2f64.powi(image.data_depth() as i32);
        let level = (extrema.max / full_scale).clamp(0.0, 1.0);

        trace!(
            "Signal level {:.4} (max {} at {:?}, depth {})",
            level,
            extrema.max,
            extrema.max_point,
            image.data_depth()
        );

        image.set_extrema(extrema);
        image.set_signal_level(level);
        level
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameBuffer, PixelFormat};

    fn mono12_image(width: u32, height: u32, values: &[u16]) -> Image {
        let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let frame = FrameBuffer::from_bytes(width, height, PixelFormat::Mono12, bytes).unwrap();
        Image::from_frame(&frame, false).unwrap()
    }

    #[test]
    fn test_whole_frame_level() {
        let mut image = mono12_image(2, 2, &[0, 1024, 2048, 512]);
        let level = SignalLevelEstimator::default().compute_level(&mut image);

        assert_eq!(level, 0.5);
        assert_eq!(image.signal_level(), Some(0.5));
        let extrema = image.extrema().unwrap();
        assert_eq!(extrema.max, 2048.0);
        assert_eq!(extrema.max_point, (0, 1));
        assert_eq!(extrema.min, 0.0);
    }

    #[test]
    fn test_region_restricts_measurement() {
        // bright pixel sits outside the region
        let mut image = mono12_image(3, 1, &[4000, 1024, 512]);
        let estimator = SignalLevelEstimator::new(Some(Region::new(1, 0, 2, 1)));

        let level = estimator.compute_level(&mut image);
        assert_eq!(level, 0.25);
        assert_eq!(image.extrema().unwrap().max_point, (1, 0));
    }

    #[test]
    fn test_degenerate_region_falls_back_to_whole_frame() {
        for region in [
            Region::new(-1, 0, 2, 1),
            Region::new(0, 0, 0, 1),
            Region::new(0, 0, 2, -3),
            Region::new(10, 10, 2, 2),
        ] {
            let mut image = mono12_image(3, 1, &[4000, 1024, 512]);
            let level = SignalLevelEstimator::new(Some(region)).compute_level(&mut image);
            assert_eq!(level, 4000.0 / 4096.0, "region {:?}", region);
        }
    }

    #[test]
    fn test_level_is_capped_at_one() {
        // virtual gain can push samples beyond the nominal depth
        let mut image = mono12_image(1, 1, &[8000]);
        let level = SignalLevelEstimator::default().compute_level(&mut image);
        assert_eq!(level, 1.0);
    }
}
