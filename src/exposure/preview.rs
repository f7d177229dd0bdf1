use super::params::ControllerParameters;
use crate::imaging::{Image, Region};
use tracing::trace;

/// Exposure anchors (ms) the gain tiers are built around
const LOW_ANCHOR_MS: f64 = 100.0;
const HIGH_ANCHOR_MS: f64 = 200.0;
/// Upper limits of the exposure x gain product for each anchor
const LOW_TIER_CAP: f64 = 30_000.0;
const HIGH_TIER_CAP: f64 = 60_000.0;

const MIN_SCALE: f64 = 0.1;
const MAX_SCALE: f64 = 10.0;
const SATURATED_SCALE: f64 = 0.4;

/// Mean-level band the preview advisor aims for
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreviewTarget {
    /// Full-scale sample value used to normalise the mean
    pub max_value: f64,
    pub min_level: f64,
    pub max_level: f64,
}

/// One-shot exposure/gain suggestion for live preview.
///
/// Unlike [`AutoExposureController`](super::AutoExposureController) this works
/// on the region mean, keeps no session state and trades exposure for gain
/// in fixed tiers so the preview frame rate stays usable.
#[derive(Debug, Clone, Default)]
pub struct PreviewExposureAdvisor {
    params: ControllerParameters,
}

impl PreviewExposureAdvisor {
    pub fn new(params: ControllerParameters) -> Self {
        Self { params }
    }

    /// Returns `(exposure_ms, gain)` for the next preview frame
    pub fn advise(&self, image: &Image, region: Option<&Region>, target: PreviewTarget) -> (f64, f64) {
        let level = image.plane().region_mean(region) / target.max_value;
        let product = self.scale_for(level, target) * image.gain() * image.exposure_ms();
        let advice = self.split(product);

        trace!(
            "Preview advice: mean level {:.3} -> {:.2}ms x{:.2}",
            level,
            advice.0,
            advice.1
        );
        advice
    }

    fn scale_for(&self, level: f64, target: PreviewTarget) -> f64 {
        let scale = if level > 0.99 {
            SATURATED_SCALE
        } else if level < target.min_level {
            target.min_level / level
        } else if level > target.max_level {
            target.max_level / level
        } else {
            1.0
        };
        scale.clamp(MIN_SCALE, MAX_SCALE)
    }

    fn split(&self, product: f64) -> (f64, f64) {
        let p = &self.params;
        let max_gain = p.preview_max_gain;

        if product < LOW_ANCHOR_MS {
            (product.max(p.min_exposure_ms), 1.0)
        } else if product < (LOW_ANCHOR_MS * max_gain).min(LOW_TIER_CAP) {
            (LOW_ANCHOR_MS, product / LOW_ANCHOR_MS)
        } else if product < (HIGH_ANCHOR_MS * max_gain).min(HIGH_TIER_CAP) {
            (HIGH_ANCHOR_MS, product / HIGH_ANCHOR_MS)
        } else {
            (p.clamp_exposure(product / max_gain), max_gain)
        }
    }
}
