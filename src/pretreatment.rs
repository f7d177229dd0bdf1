use crate::error::PretreatmentError;
use crate::imaging::{Gray16Image, Image, PixelPlane};
use image::{ImageBuffer, Luma};
use imageproc::filter::median_filter;
use std::sync::Arc;
use tracing::trace;

/// Processing step run on every captured frame before it is measured
pub trait Pretreatment: Send + Sync {
    fn name(&self) -> &str;

    fn process(&self, image: &mut Image) -> Result<(), PretreatmentError>;
}

/// Ordered chain of pretreatment steps. Stops at the first failure.
#[derive(Clone, Default)]
pub struct PretreatmentGroup {
    steps: Vec<Arc<dyn Pretreatment>>,
}

impl PretreatmentGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_step(mut self, step: Arc<dyn Pretreatment>) -> Self {
        self.steps.push(step);
        self
    }

    pub fn push(&mut self, step: Arc<dyn Pretreatment>) {
        self.steps.push(step);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl Pretreatment for PretreatmentGroup {
    fn name(&self) -> &str {
        "group"
    }

    fn process(&self, image: &mut Image) -> Result<(), PretreatmentError> {
        for step in &self.steps {
            trace!("Running pretreatment '{}'", step.name());
            step.process(image)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for PretreatmentGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.steps.iter().map(|step| step.name()))
            .finish()
    }
}

/// Square median blur of the given radius
#[derive(Debug, Clone, Copy)]
pub struct MedianFilter {
    radius: u32,
}

impl MedianFilter {
    pub fn new(radius: u32) -> Self {
        Self { radius }
    }

    pub fn radius(&self) -> u32 {
        self.radius
    }
}

impl Pretreatment for MedianFilter {
    fn name(&self) -> &str {
        "median"
    }

    fn process(&self, image: &mut Image) -> Result<(), PretreatmentError> {
        if self.radius == 0 {
            return Ok(());
        }

        let format = image.pixel_format();
        match image.plane_mut() {
            PixelPlane::Mono8(plane) => {
                *plane = median_filter(plane, self.radius, self.radius);
            }
            PixelPlane::Rgb8(plane) => {
                *plane = median_filter(plane, self.radius, self.radius);
            }
            PixelPlane::Mono16(plane) => {
                trace!("Median {} on 16-bit {} plane", self.radius, format);
                *plane = median_filter_16(plane, self.radius);
            }
        }
        Ok(())
    }
}

/// Square median over a 16-bit plane; border windows repeat edge pixels
fn median_filter_16(plane: &Gray16Image, radius: u32) -> Gray16Image {
    let (width, height) = plane.dimensions();
    if width == 0 || height == 0 {
        return plane.clone();
    }
    let r = radius as i64;
    let side = (2 * radius + 1) as usize;
    let mut window = Vec::with_capacity(side * side);

    ImageBuffer::from_fn(width, height, |x, y| {
        window.clear();
        for dy in -r..=r {
            let sy = (y as i64 + dy).clamp(0, height as i64 - 1) as u32;
            for dx in -r..=r {
                let sx = (x as i64 + dx).clamp(0, width as i64 - 1) as u32;
                window.push(plane.get_pixel(sx, sy)[0]);
            }
        }
        let middle = window.len() / 2;
        let (_, median, _) = window.select_nth_unstable(middle);
        Luma([*median])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameBuffer, PixelFormat};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn mono8(width: u32, height: u32, values: Vec<u8>) -> Image {
        let frame = FrameBuffer::from_bytes(width, height, PixelFormat::Mono8, values).unwrap();
        Image::from_frame(&frame, false).unwrap()
    }

    struct Counting {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl Pretreatment for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn process(&self, _image: &mut Image) -> Result<(), PretreatmentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(PretreatmentError::Failed {
                    stage: "counting".to_string(),
                    details: "boom".to_string(),
                });
            }
            Ok(())
        }
    }

    #[test]
    fn test_median_removes_hot_pixel() {
        let mut values = vec![10u8; 9];
        values[4] = 255;
        let mut image = mono8(3, 3, values);

        MedianFilter::new(1).process(&mut image).unwrap();

        match image.plane() {
            PixelPlane::Mono8(plane) => assert_eq!(plane.get_pixel(1, 1)[0], 10),
            _ => panic!("plane type changed"),
        }
    }

    #[test]
    fn test_median_radius_zero_is_noop() {
        let mut image = mono8(2, 1, vec![0, 200]);
        MedianFilter::new(0).process(&mut image).unwrap();
        assert_eq!(image.plane().samples(), vec![0.0, 200.0]);
    }

    #[test]
    fn test_median_removes_hot_pixel_on_16_bit() {
        let mut values = vec![300u16; 9];
        values[4] = 4095;
        values[0] = 310;
        let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let frame = FrameBuffer::from_bytes(3, 3, PixelFormat::Mono12, bytes).unwrap();
        let mut image = Image::from_frame(&frame, false).unwrap();

        MedianFilter::new(1).process(&mut image).unwrap();

        let samples = image.plane().samples();
        assert_eq!(samples[4], 300.0);
        // clamped border repeats the corner value
        assert_eq!(samples[0], 310.0);
        assert_eq!(samples[8], 300.0);
    }

    #[test]
    fn test_group_runs_in_order_and_stops_on_failure() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let group = PretreatmentGroup::new()
            .with_step(Arc::new(Counting {
                calls: first.clone(),
                fail: true,
            }))
            .with_step(Arc::new(Counting {
                calls: second.clone(),
                fail: false,
            }));

        let mut image = mono8(1, 1, vec![1]);
        assert!(group.process(&mut image).is_err());
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
        assert_eq!(group.len(), 2);
    }

    #[test]
    fn test_empty_group_succeeds() {
        let group = PretreatmentGroup::new();
        let mut image = mono8(1, 1, vec![1]);
        assert!(group.is_empty());
        assert!(group.process(&mut image).is_ok());
    }
}
