pub mod camera;
pub mod capture;
pub mod config;
pub mod error;
pub mod events;
pub mod exposure;
pub mod frame;
pub mod imaging;
pub mod pretreatment;
pub mod signal;

pub use camera::{Camera, CameraEventKind, CameraMode, ExposureRange, SimulatedCamera, SimulatedCameraBuilder};
pub use capture::{CaptureOrchestrator, CaptureStatus, FrameTransform};
pub use config::{CaptureConfig, ExpocamConfig, SimulatorConfig, SystemConfig};
pub use error::{CameraError, ExpocamError, Result};
pub use events::{CaptureEvent, DiscardReason, EventBus, EventFilter, EventReceiver};
pub use exposure::{
    AutoExposureController, ControlState, ControllerParameters, ExposureDecision,
    PreviewExposureAdvisor, PreviewTarget,
};
pub use frame::{FrameBuffer, PixelFormat, Rotation};
pub use imaging::{Image, ImageSummary, PixelPlane, Region};
pub use pretreatment::{MedianFilter, Pretreatment, PretreatmentGroup};
pub use signal::SignalLevelEstimator;
