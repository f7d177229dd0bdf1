use crate::error::FrameError;
use crate::exposure::ControlState;
use crate::frame::{FrameBuffer, PixelFormat};
use chrono::{DateTime, Utc};
use image::{imageops, GrayImage, ImageBuffer, Luma, Pixel, RgbImage};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type Gray16Image = ImageBuffer<Luma<u16>, Vec<u16>>;

/// Annotation key holding the software gain a frame was produced with
pub const GAIN_KEY: &str = "gain";
/// Annotation key holding the exposure time in milliseconds
pub const EXPOSURE_KEY: &str = "exposure";

/// Upper bound on histogram bin count; finer steps are rejected
pub const MAX_HISTOGRAM_BINS: usize = 1 << 20;

/// Sub-rectangle used for measurements. Signed so that bogus regions coming
/// from configuration can be detected instead of wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Region {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_degenerate(&self) -> bool {
        self.x < 0 || self.y < 0 || self.width <= 0 || self.height <= 0
    }

    /// Intersect with a `width` x `height` frame. `None` when nothing usable remains.
    pub fn clip(&self, width: u32, height: u32) -> Option<Bounds> {
        if self.is_degenerate() {
            return None;
        }

        let left = (self.x as i64).min(width as i64);
        let top = (self.y as i64).min(height as i64);
        let right = (self.x as i64 + self.width as i64).min(width as i64);
        let bottom = (self.y as i64 + self.height as i64).min(height as i64);

        if right > left && bottom > top {
            Some(Bounds {
                x: left as u32,
                y: top as u32,
                width: (right - left) as u32,
                height: (bottom - top) as u32,
            })
        } else {
            None
        }
    }
}

/// A region already clipped to a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Bounds {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }

    /// Clip `region` or fall back to the whole frame
    pub fn resolve(region: Option<&Region>, width: u32, height: u32) -> Self {
        region
            .and_then(|r| r.clip(width, height))
            .unwrap_or_else(|| Self::full(width, height))
    }
}

/// Min/max sample values and where they were found
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extrema {
    pub min: f64,
    pub max: f64,
    pub min_point: (u32, u32),
    pub max_point: (u32, u32),
}

/// 2-D pixel storage behind an [`Image`]
#[derive(Debug, Clone)]
pub enum PixelPlane {
    Mono8(GrayImage),
    Mono16(Gray16Image),
    Rgb8(RgbImage),
}

impl PixelPlane {
    pub fn from_frame(frame: &FrameBuffer) -> Result<Self, FrameError> {
        let (width, height) = (frame.width(), frame.height());
        let bytes = frame.data()?;
        let expected = frame.expected_size();
        let mismatch = || FrameError::SizeMismatch {
            expected,
            actual: bytes.len(),
        };

        let plane = match frame.pixel_format() {
            PixelFormat::Mono8 => PixelPlane::Mono8(
                GrayImage::from_raw(width, height, bytes.to_vec()).ok_or_else(mismatch)?,
            ),
            PixelFormat::Rgb8 => PixelPlane::Rgb8(
                RgbImage::from_raw(width, height, bytes.to_vec()).ok_or_else(mismatch)?,
            ),
            _ => {
                let samples: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                    .collect();
                PixelPlane::Mono16(
                    Gray16Image::from_raw(width, height, samples).ok_or_else(mismatch)?,
                )
            }
        };

        Ok(plane)
    }

    pub fn width(&self) -> u32 {
        match self {
            PixelPlane::Mono8(img) => img.width(),
            PixelPlane::Mono16(img) => img.width(),
            PixelPlane::Rgb8(img) => img.width(),
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            PixelPlane::Mono8(img) => img.height(),
            PixelPlane::Mono16(img) => img.height(),
            PixelPlane::Rgb8(img) => img.height(),
        }
    }

    pub fn channels(&self) -> usize {
        match self {
            PixelPlane::Rgb8(_) => 3,
            _ => 1,
        }
    }

    pub fn flip(&mut self, horizontal: bool, vertical: bool) {
        match self {
            PixelPlane::Mono8(img) => flip_in_place(img, horizontal, vertical),
            PixelPlane::Mono16(img) => flip_in_place(img, horizontal, vertical),
            PixelPlane::Rgb8(img) => flip_in_place(img, horizontal, vertical),
        }
    }

    /// Swap rows and columns
    pub fn transpose(&mut self) {
        match self {
            PixelPlane::Mono8(img) => *img = transposed(img),
            PixelPlane::Mono16(img) => *img = transposed(img),
            PixelPlane::Rgb8(img) => *img = transposed(img),
        }
    }

    /// Multiply every sample by `factor`, saturating at the container range
    pub fn scale(&mut self, factor: f64) {
        match self {
            PixelPlane::Mono8(img) => img
                .iter_mut()
                .for_each(|v| *v = (*v as f64 * factor).round().clamp(0.0, u8::MAX as f64) as u8),
            PixelPlane::Mono16(img) => img.iter_mut().for_each(|v| {
                *v = (*v as f64 * factor).round().clamp(0.0, u16::MAX as f64) as u16
            }),
            PixelPlane::Rgb8(img) => img
                .iter_mut()
                .for_each(|v| *v = (*v as f64 * factor).round().clamp(0.0, u8::MAX as f64) as u8),
        }
    }

    /// Left-shift every sample by `bits`, saturating at the container range
    pub fn shift_left(&mut self, bits: u32) {
        if bits == 0 {
            return;
        }
        match self {
            PixelPlane::Mono8(img) => img
                .iter_mut()
                .for_each(|v| *v = ((*v as u32) << bits).min(u8::MAX as u32) as u8),
            PixelPlane::Mono16(img) => img
                .iter_mut()
                .for_each(|v| *v = ((*v as u32) << bits).min(u16::MAX as u32) as u16),
            PixelPlane::Rgb8(img) => img
                .iter_mut()
                .for_each(|v| *v = ((*v as u32) << bits).min(u8::MAX as u32) as u8),
        }
    }

    pub fn region_extrema(&self, region: Option<&Region>) -> Extrema {
        let bounds = Bounds::resolve(region, self.width(), self.height());
        match self {
            PixelPlane::Mono8(img) => extrema_of(img.as_raw(), img.width(), 1, bounds),
            PixelPlane::Mono16(img) => extrema_of(img.as_raw(), img.width(), 1, bounds),
            PixelPlane::Rgb8(img) => extrema_of(img.as_raw(), img.width(), 3, bounds),
        }
    }

    pub fn region_mean(&self, region: Option<&Region>) -> f64 {
        let bounds = Bounds::resolve(region, self.width(), self.height());
        match self {
            PixelPlane::Mono8(img) => mean_of(img.as_raw(), img.width(), 1, bounds),
            PixelPlane::Mono16(img) => mean_of(img.as_raw(), img.width(), 1, bounds),
            PixelPlane::Rgb8(img) => mean_of(img.as_raw(), img.width(), 3, bounds),
        }
    }

    /// All samples as `f64`, row-major
    pub fn samples(&self) -> Vec<f64> {
        match self {
            PixelPlane::Mono8(img) => img.iter().map(|&v| v as f64).collect(),
            PixelPlane::Mono16(img) => img.iter().map(|&v| v as f64).collect(),
            PixelPlane::Rgb8(img) => img.iter().map(|&v| v as f64).collect(),
        }
    }
}

fn flip_in_place<P: Pixel>(img: &mut ImageBuffer<P, Vec<P::Subpixel>>, horizontal: bool, vertical: bool) {
    if horizontal {
        imageops::flip_horizontal_in_place(img);
    }
    if vertical {
        imageops::flip_vertical_in_place(img);
    }
}

fn transposed<P: Pixel>(img: &ImageBuffer<P, Vec<P::Subpixel>>) -> ImageBuffer<P, Vec<P::Subpixel>> {
    ImageBuffer::from_fn(img.height(), img.width(), |x, y| *img.get_pixel(y, x))
}

fn extrema_of<T: Copy + Into<f64>>(samples: &[T], width: u32, channels: usize, bounds: Bounds) -> Extrema {
    let mut extrema = Extrema {
        min: f64::INFINITY,
        max: f64::NEG_INFINITY,
        min_point: (bounds.x, bounds.y),
        max_point: (bounds.x, bounds.y),
    };

    for y in bounds.y..bounds.y + bounds.height {
        let row = y as usize * width as usize * channels;
        for x in bounds.x..bounds.x + bounds.width {
            let start = row + x as usize * channels;
            for &sample in &samples[start..start + channels] {
                let value: f64 = sample.into();
                if value < extrema.min {
                    extrema.min = value;
                    extrema.min_point = (x, y);
                }
                if value > extrema.max {
                    extrema.max = value;
                    extrema.max_point = (x, y);
                }
            }
        }
    }

    if bounds.width == 0 || bounds.height == 0 {
        extrema.min = 0.0;
        extrema.max = 0.0;
    }
    extrema
}

fn mean_of<T: Copy + Into<f64>>(samples: &[T], width: u32, channels: usize, bounds: Bounds) -> f64 {
    let count = bounds.width as usize * bounds.height as usize * channels;
    if count == 0 {
        return 0.0;
    }

    let mut sum = 0.0;
    for y in bounds.y..bounds.y + bounds.height {
        let row = y as usize * width as usize * channels;
        let start = row + bounds.x as usize * channels;
        let end = start + bounds.width as usize * channels;
        sum += samples[start..end].iter().map(|&v| v.into()).sum::<f64>();
    }
    sum / count as f64
}

/// Whole-frame statistics
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImageStatistics {
    pub extrema: Extrema,
    pub mean: Option<f64>,
}

/// Fixed-width histogram starting at zero
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    pub start: f64,
    pub end: f64,
    pub step: f64,
    pub frequencies: Vec<u64>,
    pub max_frequency: u64,
}

/// Frame after conversion to a pixel plane, with everything the pipeline
/// learns about it along the way.
#[derive(Debug, Clone)]
pub struct Image {
    plane: PixelPlane,
    pixel_format: PixelFormat,
    data_depth: u32,
    exposure_ms: f64,
    timestamp: DateTime<Utc>,
    statistics: Option<ImageStatistics>,
    signal_level: Option<f64>,
    annotations: serde_json::Map<String, Value>,
    control_state: ControlState,
}

impl Image {
    /// Build an image from a driver frame.
    ///
    /// With `depth_extend`, samples narrower than their container are shifted
    /// up so the image uses the full container range.
    pub fn from_frame(frame: &FrameBuffer, depth_extend: bool) -> Result<Self, FrameError> {
        let format = frame.pixel_format();
        let mut plane = PixelPlane::from_frame(frame)?;

        let mut data_depth = format.sample_depth();
        if depth_extend && format.container_depth() > data_depth {
            plane.shift_left(format.container_depth() - data_depth);
            data_depth = format.container_depth();
        }

        let mut annotations = serde_json::Map::new();
        annotations.insert(EXPOSURE_KEY.to_string(), Value::from(frame.exposure_ms()));

        Ok(Self {
            plane,
            pixel_format: format,
            data_depth,
            exposure_ms: frame.exposure_ms(),
            timestamp: frame.timestamp(),
            statistics: None,
            signal_level: None,
            annotations,
            control_state: ControlState::None,
        })
    }

    pub fn plane(&self) -> &PixelPlane {
        &self.plane
    }

    pub fn plane_mut(&mut self) -> &mut PixelPlane {
        self.statistics = None;
        self.signal_level = None;
        &mut self.plane
    }

    pub fn width(&self) -> u32 {
        self.plane.width()
    }

    pub fn height(&self) -> u32 {
        self.plane.height()
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    /// Bits actually populated per sample
    pub fn data_depth(&self) -> u32 {
        self.data_depth
    }

    pub fn exposure_ms(&self) -> f64 {
        self.exposure_ms
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn control_state(&self) -> ControlState {
        self.control_state
    }

    pub fn set_control_state(&mut self, state: ControlState) {
        self.control_state = state;
    }

    pub fn signal_level(&self) -> Option<f64> {
        self.signal_level
    }

    pub fn set_signal_level(&mut self, level: f64) {
        self.signal_level = Some(level);
    }

    pub fn statistics(&self) -> Option<&ImageStatistics> {
        self.statistics.as_ref()
    }

    pub fn extrema(&self) -> Option<Extrema> {
        self.statistics.map(|s| s.extrema)
    }

    /// Cache extrema measured by someone else (e.g. over a region)
    pub fn set_extrema(&mut self, extrema: Extrema) {
        let mean = self.statistics.and_then(|s| s.mean);
        self.statistics = Some(ImageStatistics { extrema, mean });
    }

    /// Whole-frame min/max and mean
    pub fn compute_statistics(&mut self) -> ImageStatistics {
        let stats = ImageStatistics {
            extrema: self.plane.region_extrema(None),
            mean: Some(self.plane.region_mean(None)),
        };
        self.statistics = Some(stats);
        stats
    }

    /// `None` for a non-positive step or one that would need more than
    /// [`MAX_HISTOGRAM_BINS`] bins
    pub fn histogram(&mut self, step: f64) -> Option<Histogram> {
        if step.is_nan() || step <= 0.0 {
            return None;
        }
        let max = match self.statistics {
            Some(stats) => stats.extrema.max,
            None => self.compute_statistics().extrema.max,
        };

        let top = (max / step).floor();
        if !top.is_finite() || top >= MAX_HISTOGRAM_BINS as f64 {
            return None;
        }
        let bins = (top as usize).checked_add(1)?;
        let mut frequencies = vec![0u64; bins];
        for value in self.plane.samples() {
            let index = ((value / step).floor() as usize).min(bins - 1);
            frequencies[index] += 1;
        }
        let max_frequency = frequencies.iter().copied().max().unwrap_or(0);

        Some(Histogram {
            start: 0.0,
            end: bins as f64 * step,
            step,
            frequencies,
            max_frequency,
        })
    }

    pub fn set_annotation<V: Into<Value>>(&mut self, key: impl Into<String>, value: V) {
        self.annotations.insert(key.into(), value.into());
    }

    pub fn annotation<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.annotations
            .get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub fn annotations(&self) -> &serde_json::Map<String, Value> {
        &self.annotations
    }

    /// Gain the frame was produced with; 1.0 when never annotated
    pub fn gain(&self) -> f64 {
        self.annotation::<f64>(GAIN_KEY).unwrap_or(1.0)
    }

    pub fn summary(&self) -> ImageSummary {
        let extrema = self.extrema();
        ImageSummary {
            width: self.width(),
            height: self.height(),
            pixel_format: self.pixel_format,
            data_depth: self.data_depth,
            exposure_ms: self.exposure_ms,
            gain: self.gain(),
            min: extrema.map(|e| e.min),
            max: extrema.map(|e| e.max),
            mean: self.statistics.and_then(|s| s.mean),
            signal_level: self.signal_level,
            control_state: self.control_state,
            timestamp: self.timestamp,
        }
    }
}

/// Serializable snapshot of an [`Image`] without pixel data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSummary {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub data_depth: u32,
    pub exposure_ms: f64,
    pub gain: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
    pub signal_level: Option<f64>,
    pub control_state: ControlState,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mono16_frame(width: u32, height: u32, values: &[u16]) -> FrameBuffer {
        let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        FrameBuffer::from_bytes(width, height, PixelFormat::Mono12, bytes)
            .unwrap()
            .with_exposure(40.0)
    }

    fn mono8_values(image: &Image) -> Vec<u8> {
        match image.plane() {
            PixelPlane::Mono8(img) => img.as_raw().clone(),
            other => panic!("unexpected plane {:?}", other),
        }
    }

    #[test]
    fn test_from_frame_decodes_little_endian() {
        let frame = mono16_frame(2, 2, &[1, 256, 4095, 7]);
        let image = Image::from_frame(&frame, false).unwrap();

        assert_eq!(image.data_depth(), 12);
        assert_eq!(image.exposure_ms(), 40.0);
        assert_eq!(image.annotation::<f64>(EXPOSURE_KEY), Some(40.0));
        match image.plane() {
            PixelPlane::Mono16(img) => assert_eq!(img.as_raw(), &vec![1, 256, 4095, 7]),
            other => panic!("unexpected plane {:?}", other),
        }
    }

    #[test]
    fn test_depth_extend_shifts_samples() {
        let frame = mono16_frame(2, 1, &[1, 4095]);
        let image = Image::from_frame(&frame, true).unwrap();

        assert_eq!(image.data_depth(), 16);
        match image.plane() {
            PixelPlane::Mono16(img) => assert_eq!(img.as_raw(), &vec![16, 65520]),
            other => panic!("unexpected plane {:?}", other),
        }
    }

    #[test]
    fn test_from_released_frame_fails() {
        let mut frame = mono16_frame(2, 1, &[1, 2]);
        frame.release();
        assert_eq!(Image::from_frame(&frame, false).unwrap_err(), FrameError::Released);
    }

    #[test]
    fn test_transpose_and_flip() {
        // 1 2 3
        // 4 5 6
        let frame =
            FrameBuffer::from_bytes(3, 2, PixelFormat::Mono8, vec![1, 2, 3, 4, 5, 6]).unwrap();
        let mut image = Image::from_frame(&frame, false).unwrap();

        image.plane_mut().transpose();
        assert_eq!((image.width(), image.height()), (2, 3));
        assert_eq!(mono8_values(&image), vec![1, 4, 2, 5, 3, 6]);

        image.plane_mut().flip(true, false);
        assert_eq!(mono8_values(&image), vec![4, 1, 5, 2, 6, 3]);

        image.plane_mut().flip(false, true);
        assert_eq!(mono8_values(&image), vec![6, 3, 5, 2, 4, 1]);
    }

    #[test]
    fn test_scale_saturates() {
        let frame = FrameBuffer::from_bytes(3, 1, PixelFormat::Mono8, vec![10, 100, 200]).unwrap();
        let mut image = Image::from_frame(&frame, false).unwrap();

        image.plane_mut().scale(2.0);
        assert_eq!(mono8_values(&image), vec![20, 200, 255]);
    }

    #[test]
    fn test_region_extrema_and_mean() {
        // 0 1 2 3
        // 4 5 6 7
        // 8 9 10 11
        let values: Vec<u16> = (0..12).collect();
        let frame = mono16_frame(4, 3, &values);
        let image = Image::from_frame(&frame, false).unwrap();
        let region = Region::new(1, 0, 2, 2);

        let extrema = image.plane().region_extrema(Some(&region));
        assert_eq!(extrema.min, 1.0);
        assert_eq!(extrema.max, 6.0);
        assert_eq!(extrema.min_point, (1, 0));
        assert_eq!(extrema.max_point, (2, 1));
        assert_eq!(image.plane().region_mean(Some(&region)), 3.5);

        let whole = image.plane().region_extrema(None);
        assert_eq!(whole.max, 11.0);
        assert_eq!(whole.max_point, (3, 2));
    }

    #[test]
    fn test_region_clipping() {
        assert_eq!(
            Region::new(2, 2, 10, 10).clip(4, 4),
            Some(Bounds {
                x: 2,
                y: 2,
                width: 2,
                height: 2
            })
        );
        assert_eq!(Region::new(5, 0, 2, 2).clip(4, 4), None);
        assert_eq!(Region::new(-1, 0, 2, 2).clip(4, 4), None);
        assert_eq!(Region::new(0, 0, 0, 2).clip(4, 4), None);
    }

    #[test]
    fn test_rgb_extrema_covers_all_channels() {
        let frame = FrameBuffer::from_bytes(2, 1, PixelFormat::Rgb8, vec![5, 9, 1, 250, 3, 7]).unwrap();
        let image = Image::from_frame(&frame, false).unwrap();

        let extrema = image.plane().region_extrema(None);
        assert_eq!(extrema.max, 250.0);
        assert_eq!(extrema.max_point, (1, 0));
        assert_eq!(extrema.min, 1.0);
        assert_eq!(extrema.min_point, (0, 0));
        assert_eq!(image.data_depth(), 8);
    }

    #[test]
    fn test_statistics_and_histogram() {
        let frame =
            FrameBuffer::from_bytes(4, 1, PixelFormat::Mono8, vec![0, 50, 150, 250]).unwrap();
        let mut image = Image::from_frame(&frame, false).unwrap();

        let stats = image.compute_statistics();
        assert_eq!(stats.extrema.max, 250.0);
        assert_eq!(stats.mean, Some(112.5));

        let histogram = image.histogram(100.0).unwrap();
        assert_eq!(histogram.frequencies, vec![2, 1, 1]);
        assert_eq!(histogram.end, 300.0);
        assert_eq!(histogram.max_frequency, 2);

        assert!(image.histogram(0.0).is_none());
    }

    #[test]
    fn test_histogram_rejects_excessive_bin_count() {
        let frame = FrameBuffer::from_bytes(2, 1, PixelFormat::Mono8, vec![0, 200]).unwrap();
        let mut image = Image::from_frame(&frame, false).unwrap();

        assert!(image.histogram(1e-300).is_none());
        assert!(image.histogram(f64::MIN_POSITIVE).is_none());
        assert_eq!(image.histogram(1.0).unwrap().frequencies.len(), 201);

        let mut image = Image::from_frame(&mono16_frame(1, 1, &[4095]), false).unwrap();
        assert!(image.histogram(1e-6).is_none());
        assert!(image.histogram(0.01).is_some());
    }

    #[test]
    fn test_annotations() {
        let frame = FrameBuffer::from_bytes(1, 1, PixelFormat::Mono8, vec![0]).unwrap();
        let mut image = Image::from_frame(&frame, false).unwrap();

        assert_eq!(image.gain(), 1.0);
        image.set_annotation(GAIN_KEY, 2.5);
        image.set_annotation("operator", "bench-3");

        assert_eq!(image.gain(), 2.5);
        assert_eq!(image.annotation::<String>("operator").as_deref(), Some("bench-3"));
        assert_eq!(image.annotation::<f64>("missing"), None);
    }

    #[test]
    fn test_summary_serializes() {
        let frame = mono16_frame(2, 1, &[10, 20]);
        let mut image = Image::from_frame(&frame, false).unwrap();
        image.compute_statistics();
        image.set_control_state(ControlState::Suitable);

        let json = serde_json::to_value(image.summary()).unwrap();
        assert_eq!(json["control_state"], "Suitable");
        assert_eq!(json["max"], 20.0);
        assert_eq!(json["pixel_format"], "Mono12");
    }
}
