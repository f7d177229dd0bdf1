mod controller;
mod params;
mod preview;
#[cfg(test)]
mod tests;

pub use controller::{AutoExposureController, ControlState, ExposureDecision, SessionState};
pub use params::ControllerParameters;
pub use preview::{PreviewExposureAdvisor, PreviewTarget};
