use crate::error::CameraError;
use crate::frame::{FrameBuffer, PixelFormat};
use serde::{Deserialize, Serialize};

/// State-change notifications a camera session can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CameraEventKind {
    ConnectionError,
    ImagingError,
    CameraError,
    PreviewStart,
    PreviewFinish,
    PreviewError,
    SingleStart,
    SingleFinish,
    SingleError,
    OperateError,
}

impl CameraEventKind {
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            CameraEventKind::ConnectionError
                | CameraEventKind::ImagingError
                | CameraEventKind::CameraError
                | CameraEventKind::PreviewError
                | CameraEventKind::SingleError
                | CameraEventKind::OperateError
        )
    }
}

impl std::fmt::Display for CameraEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CameraEventKind::ConnectionError => "connection_error",
            CameraEventKind::ImagingError => "imaging_error",
            CameraEventKind::CameraError => "camera_error",
            CameraEventKind::PreviewStart => "preview_start",
            CameraEventKind::PreviewFinish => "preview_finish",
            CameraEventKind::PreviewError => "preview_error",
            CameraEventKind::SingleStart => "single_start",
            CameraEventKind::SingleFinish => "single_finish",
            CameraEventKind::SingleError => "single_error",
            CameraEventKind::OperateError => "operate_error",
        };
        f.write_str(name)
    }
}

/// What the sensor is currently doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CameraMode {
    #[default]
    Idle,
    Single,
    Preview,
}

/// Exposure limits supported by a sensor, in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExposureRange {
    pub min_ms: f64,
    pub max_ms: f64,
}

impl ExposureRange {
    pub fn new(min_ms: f64, max_ms: f64) -> Self {
        Self { min_ms, max_ms }
    }

    pub fn clamp(&self, exposure_ms: f64) -> f64 {
        exposure_ms.max(self.min_ms).min(self.max_ms)
    }

    pub fn contains(&self, exposure_ms: f64) -> bool {
        exposure_ms >= self.min_ms && exposure_ms <= self.max_ms
    }
}

/// Capability interface implemented by camera drivers.
///
/// Every call may block on the device, so callers in async code run them via
/// `tokio::task::spawn_blocking`. Implementations serialize access to the
/// physical device internally and must allow only one exposure in flight.
pub trait Camera: Send + Sync {
    /// Human readable model name
    fn model(&self) -> &str;

    fn init(&self) -> Result<(), CameraError>;

    fn close(&self) -> Result<(), CameraError>;

    fn start(&self) -> Result<(), CameraError>;

    fn stop(&self) -> Result<(), CameraError>;

    fn is_started(&self) -> bool;

    fn pixel_format(&self) -> PixelFormat;

    fn exposure_range(&self) -> ExposureRange;

    /// Apply an exposure time, clamping it to [`Camera::exposure_range`].
    /// Returns the value actually applied.
    fn set_exposure_ms(&self, exposure_ms: f64) -> Result<f64, CameraError>;

    fn exposure_ms(&self) -> f64;

    fn set_gain(&self, gain: f64) -> Result<(), CameraError>;

    fn gain(&self) -> f64;

    /// Expose and read out one frame
    fn take_frame(&self) -> Result<FrameBuffer, CameraError>;

    fn start_preview(&self) -> Result<(), CameraError>;

    fn stop_preview(&self) -> Result<(), CameraError>;

    fn mode(&self) -> CameraMode;

    /// Next preview frame if one is ready. `Ok(None)` when not previewing or
    /// nothing new has been read out.
    fn poll_preview_frame(&self) -> Result<Option<FrameBuffer>, CameraError>;
}
