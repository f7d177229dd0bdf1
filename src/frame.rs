use crate::error::FrameError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sensor pixel formats. The low byte of the code is the nominal bit depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Mono8,
    Mono10,
    Mono12,
    Mono14,
    Mono16,
    Rgb8,
}

impl PixelFormat {
    /// Driver-level format code
    pub fn code(&self) -> u32 {
        match self {
            PixelFormat::Mono8 => 0x0108,
            PixelFormat::Mono10 => 0x020A,
            PixelFormat::Mono12 => 0x030C,
            PixelFormat::Mono14 => 0x040E,
            PixelFormat::Mono16 => 0x0510,
            PixelFormat::Rgb8 => 0x01_0118,
        }
    }

    pub fn from_code(code: u32) -> Result<Self, FrameError> {
        match code {
            0x0108 => Ok(PixelFormat::Mono8),
            0x020A => Ok(PixelFormat::Mono10),
            0x030C => Ok(PixelFormat::Mono12),
            0x040E => Ok(PixelFormat::Mono14),
            0x0510 => Ok(PixelFormat::Mono16),
            0x01_0118 => Ok(PixelFormat::Rgb8),
            other => Err(FrameError::UnknownPixelFormat { code: other }),
        }
    }

    /// Nominal depth in bits
    pub fn depth(&self) -> u32 {
        self.code() & 0xff
    }

    /// Bytes per pixel in the raw buffer
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Mono8 => 1,
            PixelFormat::Mono10
            | PixelFormat::Mono12
            | PixelFormat::Mono14
            | PixelFormat::Mono16 => 2,
            PixelFormat::Rgb8 => 3,
        }
    }

    pub fn channels(&self) -> usize {
        match self {
            PixelFormat::Rgb8 => 3,
            _ => 1,
        }
    }

    /// Bits actually stored per sample once unpacked
    pub fn sample_depth(&self) -> u32 {
        match self {
            PixelFormat::Rgb8 => 8,
            other => other.depth(),
        }
    }

    /// Bits of the container each sample is stored in
    pub fn container_depth(&self) -> u32 {
        match self {
            PixelFormat::Mono8 | PixelFormat::Rgb8 => 8,
            _ => 16,
        }
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PixelFormat::Mono8 => "Mono8",
            PixelFormat::Mono10 => "Mono10",
            PixelFormat::Mono12 => "Mono12",
            PixelFormat::Mono14 => "Mono14",
            PixelFormat::Mono16 => "Mono16",
            PixelFormat::Rgb8 => "RGB8",
        };
        f.write_str(name)
    }
}

/// Rotation options for frame processing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rotation {
    /// Rotate 90 degrees clockwise
    Rotate90,
    /// Rotate 180 degrees
    Rotate180,
    /// Rotate 270 degrees clockwise (90 degrees counter-clockwise)
    Rotate270,
}

impl Rotation {
    /// Get rotation angle in degrees
    pub fn degrees(&self) -> u16 {
        match self {
            Rotation::Rotate90 => 90,
            Rotation::Rotate180 => 180,
            Rotation::Rotate270 => 270,
        }
    }
}

/// Raw frame as delivered by a camera driver.
///
/// A buffer is either unallocated or owns exactly one allocation of
/// `width * height * bytes_per_pixel` bytes. Cloning deep-copies the pixels.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
    exposure_ms: f64,
    timestamp: DateTime<Utc>,
    data: Option<Vec<u8>>,
}

impl FrameBuffer {
    /// Create an unallocated buffer
    pub fn new(width: u32, height: u32, pixel_format: PixelFormat) -> Self {
        Self {
            width,
            height,
            pixel_format,
            exposure_ms: 0.0,
            timestamp: Utc::now(),
            data: None,
        }
    }

    /// Wrap existing pixel bytes, checking the size against the format
    pub fn from_bytes(
        width: u32,
        height: u32,
        pixel_format: PixelFormat,
        data: Vec<u8>,
    ) -> Result<Self, FrameError> {
        let expected = Self::size_for(width, height, pixel_format);
        if data.len() != expected {
            return Err(FrameError::SizeMismatch {
                expected,
                actual: data.len(),
            });
        }

        Ok(Self {
            data: Some(data),
            ..Self::new(width, height, pixel_format)
        })
    }

    pub fn size_for(width: u32, height: u32, pixel_format: PixelFormat) -> usize {
        width as usize * height as usize * pixel_format.bytes_per_pixel()
    }

    /// Allocate zeroed storage, replacing any previous allocation
    pub fn allocate(&mut self) {
        self.data = Some(vec![0u8; self.expected_size()]);
    }

    /// Free the pixel storage. Reads fail afterwards.
    pub fn release(&mut self) {
        self.data = None;
    }

    pub fn is_allocated(&self) -> bool {
        self.data.is_some()
    }

    pub fn data(&self) -> Result<&[u8], FrameError> {
        self.data.as_deref().ok_or(FrameError::Released)
    }

    pub fn data_mut(&mut self) -> Result<&mut [u8], FrameError> {
        self.data.as_deref_mut().ok_or(FrameError::Released)
    }

    pub fn expected_size(&self) -> usize {
        Self::size_for(self.width, self.height, self.pixel_format)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    pub fn exposure_ms(&self) -> f64 {
        self.exposure_ms
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn set_exposure_ms(&mut self, exposure_ms: f64) {
        self.exposure_ms = exposure_ms;
    }

    pub fn set_timestamp(&mut self, timestamp: DateTime<Utc>) {
        self.timestamp = timestamp;
    }

    pub fn with_exposure(mut self, exposure_ms: f64) -> Self {
        self.exposure_ms = exposure_ms;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}
