use crate::camera::CameraEventKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExpocamError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("Camera error: {0}")]
    Camera(#[from] CameraError),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Pretreatment error: {0}")]
    Pretreatment(#[from] PretreatmentError),

    #[error("Event bus error: {0}")]
    EventBus(#[from] EventBusError),

    #[error("No camera connected")]
    NotConnected,

    #[error("A capture is already in progress")]
    Busy,

    #[error("System error: {message}")]
    System { message: String },
}

impl ExpocamError {
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }
}

/// Failures reported by a camera driver
#[derive(Error, Debug, Clone)]
pub enum CameraError {
    #[error("Failed to connect to camera: {details}")]
    Connection { details: String },

    #[error("Imaging failed: {details}")]
    Imaging { details: String },

    #[error("Camera fault: {details}")]
    Device { details: String },

    #[error("Preview failed: {details}")]
    Preview { details: String },

    #[error("Operation rejected: {details}")]
    Operation { details: String },

    #[error("Camera is not started")]
    NotStarted,
}

impl CameraError {
    /// Event kind observers see when this error is reported
    pub fn event_kind(&self) -> CameraEventKind {
        match self {
            CameraError::Connection { .. } => CameraEventKind::ConnectionError,
            CameraError::Imaging { .. } => CameraEventKind::ImagingError,
            CameraError::Device { .. } => CameraEventKind::CameraError,
            CameraError::Preview { .. } => CameraEventKind::PreviewError,
            CameraError::Operation { .. } | CameraError::NotStarted => {
                CameraEventKind::OperateError
            }
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame buffer has been released")]
    Released,

    #[error("Frame buffer size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("Unknown pixel format code: {code:#x}")]
    UnknownPixelFormat { code: u32 },
}

#[derive(Error, Debug, Clone)]
pub enum PretreatmentError {
    #[error("Stage '{stage}' failed: {details}")]
    Failed { stage: String, details: String },
}

#[derive(Error, Debug)]
pub enum EventBusError {
    #[error("Failed to publish event: {details}")]
    PublishFailed { details: String },

    #[error("Event channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, ExpocamError>;
