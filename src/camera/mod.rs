mod builder;
mod interface;
mod simulated;

pub use builder::SimulatedCameraBuilder;
pub use interface::{Camera, CameraEventKind, CameraMode, ExposureRange};
pub use simulated::SimulatedCamera;
