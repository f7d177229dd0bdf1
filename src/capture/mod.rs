mod core;
mod preview;
mod status;
mod transform;

pub use self::core::CaptureOrchestrator;
pub use status::CaptureStatus;
pub use transform::FrameTransform;
