use super::params::ControllerParameters;
use crate::imaging::Image;
use crate::signal::SignalLevelEstimator;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Level treated as saturated
const SATURATION_LEVEL: f64 = 0.99;
/// Largest multiplicative exposure step from a single dark sample
const MAX_STEP: f64 = 8.0;
/// Back-off applied to a saturated first sample
const FIRST_SATURATED_BACKOFF: f64 = 0.4;
/// Back-off applied to a saturated sample once an estimate exists
const SATURATED_BACKOFF: f64 = 0.7;

/// Why the control loop stopped (or that it has not)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ControlState {
    /// Controller was not consulted
    #[default]
    None,
    /// New settings proposed, take another sample
    Adjusting,
    /// Level inside the acceptable band
    Suitable,
    /// Too bright at minimum exposure
    Overflow,
    /// Too dark at maximum exposure and maximum gain
    TooLow,
}

impl ControlState {
    /// Whether the loop must stop on this state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ControlState::Suitable | ControlState::Overflow | ControlState::TooLow
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, ControlState::Overflow | ControlState::TooLow)
    }
}

impl std::fmt::Display for ControlState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ControlState::None => "none",
            ControlState::Adjusting => "adjusting",
            ControlState::Suitable => "suitable",
            ControlState::Overflow => "overflow",
            ControlState::TooLow => "too_low",
        };
        f.write_str(name)
    }
}

/// Flags that survive between calls within one acquisition session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionState {
    /// An exposure step has been computed from an unsaturated sample
    pub has_convergence_estimate: bool,
    /// Exposure is pinned at maximum and gain is being swept
    pub gain_expanded: bool,
}

/// Settings proposed for the next sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExposureDecision {
    pub state: ControlState,
    pub exposure_ms: f64,
    pub gain: f64,
}

impl ExposureDecision {
    fn hold(state: ControlState, exposure_ms: f64, gain: f64) -> Self {
        Self {
            state,
            exposure_ms,
            gain,
        }
    }
}

/// Hysteresis exposure/gain controller.
///
/// Exposure is adjusted first. Only once exposure is pinned at its maximum
/// and the signal is still short does the controller start sweeping gain,
/// and it hands control back to exposure once gain has come down to 1.
#[derive(Debug, Clone)]
pub struct AutoExposureController {
    params: ControllerParameters,
    estimator: SignalLevelEstimator,
    session: SessionState,
}

impl AutoExposureController {
    pub fn new(params: ControllerParameters) -> Self {
        let estimator = SignalLevelEstimator::new(params.region);
        Self {
            params,
            estimator,
            session: SessionState::default(),
        }
    }

    pub fn parameters(&self) -> &ControllerParameters {
        &self.params
    }

    /// Replace the tuning. The session flags are left alone.
    pub fn set_parameters(&mut self, params: ControllerParameters) {
        self.estimator.set_region(params.region);
        self.params = params;
    }

    pub fn estimator(&self) -> &SignalLevelEstimator {
        &self.estimator
    }

    pub fn session(&self) -> SessionState {
        self.session
    }

    /// Start a new acquisition session
    pub fn reset(&mut self) {
        debug!("Resetting auto-exposure session");
        self.session = SessionState::default();
    }

    /// Measure `image` and decide the next exposure/gain from the exposure
    /// and gain it was taken with.
    pub fn next_value(&mut self, image: &mut Image) -> ExposureDecision {
        let level = self.estimator.compute_level(image);
        self.decide(image.exposure_ms(), image.gain(), level)
    }

    /// Core decision procedure given the last exposure, gain and level
    pub fn decide(&mut self, exposure_ms: f64, gain: f64, level: f64) -> ExposureDecision {
        let p = &self.params;

        if p.in_band(level) {
            return ExposureDecision::hold(ControlState::Suitable, exposure_ms, gain);
        }

        if level > p.max_level && exposure_ms == p.min_exposure_ms {
            debug!(
                "Signal {:.3} too high at minimum exposure {}ms",
                level, exposure_ms
            );
            return ExposureDecision::hold(ControlState::Overflow, exposure_ms, gain);
        }

        let decision = if self.session.gain_expanded {
            self.sweep_gain(exposure_ms, gain, level)
        } else if level < p.min_level && exposure_ms >= p.max_exposure_ms {
            self.session.gain_expanded = true;
            let next_gain = p.max_test_gain.min(gain * p.target_level / level);
            debug!(
                "Exposure saturated at {}ms with level {:.3}; expanding gain to {:.3}",
                exposure_ms, level, next_gain
            );
            ExposureDecision::hold(ControlState::Adjusting, exposure_ms, next_gain)
        } else {
            let next = self.step_exposure(exposure_ms, level);
            ExposureDecision::hold(ControlState::Adjusting, next, gain)
        };

        debug!(
            "Auto-exposure: level {:.3} at {}ms x{:.3} -> {} {}ms x{:.3}",
            level, exposure_ms, gain, decision.state, decision.exposure_ms, decision.gain
        );
        decision
    }

    fn sweep_gain(&mut self, exposure_ms: f64, gain: f64, level: f64) -> ExposureDecision {
        let p = &self.params;

        if level < p.min_level {
            if gain >= p.max_test_gain {
                return ExposureDecision::hold(ControlState::TooLow, exposure_ms, gain);
            }
            let next_gain = p.max_test_gain.min(gain * p.target_level / level);
            return ExposureDecision::hold(ControlState::Adjusting, exposure_ms, next_gain);
        }

        let next_gain = (gain * p.target_level / level).max(1.0);
        if next_gain == 1.0 {
            self.session.gain_expanded = false;
        }
        ExposureDecision::hold(ControlState::Adjusting, exposure_ms, next_gain)
    }

    fn step_exposure(&mut self, exposure_ms: f64, level: f64) -> f64 {
        let p = &self.params;
        let proportional = exposure_ms * MAX_STEP.min(p.target_level / level);

        let next = if level >= SATURATION_LEVEL {
            if self.session.has_convergence_estimate {
                exposure_ms * SATURATED_BACKOFF
            } else {
                exposure_ms * FIRST_SATURATED_BACKOFF
            }
        } else {
            self.session.has_convergence_estimate = true;
            proportional
        };

        p.clamp_exposure(next)
    }
}

impl Default for AutoExposureController {
    fn default() -> Self {
        Self::new(ControllerParameters::default())
    }
}
