use crate::imaging::Region;
use serde::{Deserialize, Serialize};

/// Tuning of the exposure/gain loop. Fixed for the duration of one control
/// run; replace between runs with
/// [`AutoExposureController::set_parameters`](super::AutoExposureController::set_parameters).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerParameters {
    /// Shortest exposure the loop may propose (ms)
    #[serde(default = "default_min_exposure")]
    pub min_exposure_ms: f64,

    /// Longest exposure the loop may propose (ms)
    #[serde(default = "default_max_exposure")]
    pub max_exposure_ms: f64,

    /// Upper bound for gain once exposure has saturated
    #[serde(default = "default_max_test_gain")]
    pub max_test_gain: f64,

    /// Upper bound for gain suggested while previewing
    #[serde(default = "default_preview_max_gain")]
    pub preview_max_gain: f64,

    /// Lower edge of the acceptable signal band
    #[serde(default = "default_min_level")]
    pub min_level: f64,

    /// Upper edge of the acceptable signal band
    #[serde(default = "default_max_level")]
    pub max_level: f64,

    /// Level the loop aims for when it has to move
    #[serde(default = "default_target_level")]
    pub target_level: f64,

    /// Region used for the signal measurement
    #[serde(default)]
    pub region: Option<Region>,
}

impl ControllerParameters {
    pub fn clamp_exposure(&self, exposure_ms: f64) -> f64 {
        exposure_ms.max(self.min_exposure_ms).min(self.max_exposure_ms)
    }

    pub fn in_band(&self, level: f64) -> bool {
        level >= self.min_level && level <= self.max_level
    }
}

impl Default for ControllerParameters {
    fn default() -> Self {
        Self {
            min_exposure_ms: default_min_exposure(),
            max_exposure_ms: default_max_exposure(),
            max_test_gain: default_max_test_gain(),
            preview_max_gain: default_preview_max_gain(),
            min_level: default_min_level(),
            max_level: default_max_level(),
            target_level: default_target_level(),
            region: None,
        }
    }
}

fn default_min_exposure() -> f64 {
    1.0
}
fn default_max_exposure() -> f64 {
    2000.0
}
fn default_max_test_gain() -> f64 {
    60.0
}
fn default_preview_max_gain() -> f64 {
    60.0
}
fn default_min_level() -> f64 {
    0.70
}
fn default_max_level() -> f64 {
    0.95
}
fn default_target_level() -> f64 {
    0.85
}
