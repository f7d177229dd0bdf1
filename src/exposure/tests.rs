use super::*;
use crate::frame::{FrameBuffer, PixelFormat};
use crate::imaging::{Image, Region, GAIN_KEY};

const EPS: f64 = 1e-9;

fn params() -> ControllerParameters {
    ControllerParameters {
        min_exposure_ms: 1.0,
        max_exposure_ms: 2000.0,
        max_test_gain: 60.0,
        preview_max_gain: 60.0,
        min_level: 0.70,
        max_level: 0.95,
        target_level: 0.85,
        region: None,
    }
}

fn controller() -> AutoExposureController {
    AutoExposureController::new(params())
}

/// 16-bit image whose brightest sample gives `level`
fn image_at(level: f64, exposure_ms: f64, gain: Option<f64>) -> Image {
    let peak = (level * 65536.0).min(65535.0) as u16;
    let values = [peak / 2, peak, peak / 4, 0];
    let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    let frame = FrameBuffer::from_bytes(2, 2, PixelFormat::Mono16, bytes)
        .unwrap()
        .with_exposure(exposure_ms);
    let mut image = Image::from_frame(&frame, false).unwrap();
    if let Some(gain) = gain {
        image.set_annotation(GAIN_KEY, gain);
    }
    image
}

#[test]
fn test_in_band_is_suitable_and_unchanged() {
    let mut ctl = controller();
    for level in [0.70, 0.75, 0.85, 0.90, 0.95] {
        let decision = ctl.decide(123.0, 2.0, level);
        assert_eq!(decision.state, ControlState::Suitable, "level {}", level);
        assert_eq!(decision.exposure_ms, 123.0);
        assert_eq!(decision.gain, 2.0);
    }
    assert_eq!(ctl.session(), SessionState::default());
}

#[test]
fn test_overflow_at_minimum_exposure() {
    let mut ctl = controller();
    for level in [0.951, 0.99, 1.0] {
        let decision = ctl.decide(1.0, 3.0, level);
        assert_eq!(decision.state, ControlState::Overflow);
        assert_eq!(decision.exposure_ms, 1.0);
        assert_eq!(decision.gain, 3.0);
    }
}

#[test]
fn test_first_dark_sample_scales_exposure() {
    let mut ctl = controller();
    let decision = ctl.decide(100.0, 1.0, 0.30);

    assert_eq!(decision.state, ControlState::Adjusting);
    assert!((decision.exposure_ms - 100.0 * 0.85 / 0.30).abs() < EPS);
    assert!((decision.exposure_ms - 283.333).abs() < 1e-3);
    assert_eq!(decision.gain, 1.0);
    assert!(ctl.session().has_convergence_estimate);
    assert!(!ctl.session().gain_expanded);
}

#[test]
fn test_first_saturated_sample_backs_off_hard() {
    let mut ctl = controller();
    let decision = ctl.decide(100.0, 1.0, 0.995);

    assert_eq!(decision.state, ControlState::Adjusting);
    assert!((decision.exposure_ms - 40.0).abs() < EPS);
    assert!(!ctl.session().has_convergence_estimate);
}

#[test]
fn test_saturated_sample_after_estimate_backs_off_gently() {
    let mut ctl = controller();
    ctl.decide(100.0, 1.0, 0.30);
    let decision = ctl.decide(283.0, 1.0, 0.995);

    assert_eq!(decision.state, ControlState::Adjusting);
    assert!((decision.exposure_ms - 283.0 * 0.7).abs() < EPS);
}

#[test]
fn test_exposure_step_is_capped() {
    let mut ctl = controller();
    let decision = ctl.decide(10.0, 1.0, 0.01);
    assert!((decision.exposure_ms - 80.0).abs() < EPS);

    let decision = ctl.decide(10.0, 1.0, 0.0);
    assert!((decision.exposure_ms - 80.0).abs() < EPS);
}

#[test]
fn test_exposure_proposals_are_clamped() {
    let mut ctl = controller();
    let decision = ctl.decide(1500.0, 1.0, 0.2);
    assert_eq!(decision.exposure_ms, 2000.0);

    let decision = ctl.decide(1.2, 1.0, 0.999);
    assert_eq!(decision.exposure_ms, 1.0);

    for level in [0.0, 0.05, 0.3, 0.5, 0.96, 0.99, 1.0] {
        for exposure in [1.5, 10.0, 500.0, 1999.0] {
            let mut ctl = controller();
            let d = ctl.decide(exposure, 1.0, level);
            assert!(d.exposure_ms >= 1.0 && d.exposure_ms <= 2000.0);
        }
    }
}

#[test]
fn test_saturated_exposure_engages_gain() {
    let mut ctl = controller();
    let decision = ctl.decide(2000.0, 1.5, 0.40);

    assert_eq!(decision.state, ControlState::Adjusting);
    assert_eq!(decision.exposure_ms, 2000.0);
    assert!((decision.gain - 1.5 * 0.85 / 0.40).abs() < EPS);
    assert!(ctl.session().gain_expanded);
}

#[test]
fn test_gain_expansion_is_capped_and_then_too_low() {
    let mut ctl = controller();
    let decision = ctl.decide(2000.0, 40.0, 0.10);
    assert_eq!(decision.gain, 60.0);

    let decision = ctl.decide(2000.0, 60.0, 0.50);
    assert_eq!(decision.state, ControlState::TooLow);
    assert_eq!(decision.gain, 60.0);
    assert_eq!(decision.exposure_ms, 2000.0);
}

#[test]
fn test_gain_expanded_keeps_exposure_while_dark() {
    let mut ctl = controller();
    ctl.decide(2000.0, 1.0, 0.40);

    let decision = ctl.decide(2000.0, 2.125, 0.60);
    assert_eq!(decision.state, ControlState::Adjusting);
    assert_eq!(decision.exposure_ms, 2000.0);
    assert!((decision.gain - 2.125 * 0.85 / 0.60).abs() < EPS);
    assert!(ctl.session().gain_expanded);
}

#[test]
fn test_gain_expanded_too_bright_reduces_gain_and_disengages_at_one() {
    let mut ctl = controller();
    ctl.decide(2000.0, 1.0, 0.40);

    let decision = ctl.decide(2000.0, 4.0, 0.98);
    assert!((decision.gain - 4.0 * 0.85 / 0.98).abs() < EPS);
    assert!(ctl.session().gain_expanded);

    let decision = ctl.decide(2000.0, 1.1, 0.99);
    assert_eq!(decision.state, ControlState::Adjusting);
    assert_eq!(decision.gain, 1.0);
    assert_eq!(decision.exposure_ms, 2000.0);
    assert!(!ctl.session().gain_expanded);

    // back in the exposure regime
    let decision = ctl.decide(2000.0, 1.0, 0.99);
    assert!((decision.exposure_ms - 2000.0 * 0.4).abs() < EPS);
}

#[test]
fn test_gain_proposals_stay_in_range() {
    for start_gain in [1.0, 5.0, 30.0, 59.0] {
        for level in [0.0, 0.1, 0.5, 0.96, 1.0] {
            let mut ctl = controller();
            ctl.decide(2000.0, 1.0, 0.40);
            let d = ctl.decide(2000.0, start_gain, level);
            assert!(d.gain >= 1.0 && d.gain <= 60.0, "gain {}", d.gain);
        }
    }
}

#[test]
fn test_reset_replays_first_sample() {
    let mut fresh = controller();
    let expected = fresh.decide(100.0, 1.0, 0.30);

    let mut used = controller();
    used.decide(100.0, 1.0, 0.30);
    used.decide(2000.0, 1.0, 0.40);
    assert!(used.session().gain_expanded);
    assert!(used.session().has_convergence_estimate);

    used.reset();
    assert_eq!(used.session(), SessionState::default());
    assert_eq!(used.decide(100.0, 1.0, 0.30), expected);

    used.reset();
    let mut fresh = controller();
    assert_eq!(used.decide(100.0, 1.0, 0.995), fresh.decide(100.0, 1.0, 0.995));
}

#[test]
fn test_next_value_measures_image() {
    let mut ctl = controller();
    let mut image = image_at(0.30, 100.0, Some(1.0));

    let decision = ctl.next_value(&mut image);
    let level = image.signal_level().unwrap();
    assert!((level - 0.30).abs() < 1e-4);
    assert_eq!(decision.state, ControlState::Adjusting);
    assert!((decision.exposure_ms - 100.0 * 0.85 / level).abs() < EPS);
}

#[test]
fn test_next_value_defaults_missing_gain_to_one() {
    let mut ctl = controller();
    let mut image = image_at(0.40, 2000.0, None);

    let decision = ctl.next_value(&mut image);
    let level = image.signal_level().unwrap();
    assert!((decision.gain - 0.85 / level).abs() < EPS);
}

#[test]
fn test_next_value_uses_region() {
    let mut ctl = AutoExposureController::new(ControllerParameters {
        region: Some(Region::new(0, 1, 2, 1)),
        ..params()
    });
    // bright row 0 is excluded, row 1 is dark
    let mut image = image_at(0.80, 100.0, Some(1.0));

    let decision = ctl.next_value(&mut image);
    assert_eq!(decision.state, ControlState::Adjusting);
    assert!(image.signal_level().unwrap() < 0.25);
}

#[test]
fn test_control_state_classification() {
    assert!(ControlState::Suitable.is_terminal());
    assert!(ControlState::Overflow.is_terminal());
    assert!(ControlState::TooLow.is_terminal());
    assert!(!ControlState::Adjusting.is_terminal());
    assert!(!ControlState::None.is_terminal());
    assert!(ControlState::TooLow.is_failure());
    assert!(!ControlState::Suitable.is_failure());
}

fn preview_target() -> PreviewTarget {
    PreviewTarget {
        max_value: 65536.0,
        min_level: 0.4,
        max_level: 0.6,
    }
}

#[test]
fn test_preview_advice_in_band_keeps_product() {
    let advisor = PreviewExposureAdvisor::new(params());
    // mean of [peak/2, peak, peak/4, 0] = 0.4375 * peak
    let image = image_at(1.0, 50.0, Some(1.0));

    let (exposure, gain) = advisor.advise(&image, None, preview_target());
    assert!((exposure - 50.0).abs() < 1e-6);
    assert_eq!(gain, 1.0);
}

#[test]
fn test_preview_advice_moves_into_gain_tiers() {
    let advisor = PreviewExposureAdvisor::new(params());
    let dark = image_at(0.04, 100.0, Some(2.0));

    // level ~0.0175, scale capped at 10 -> product 2000
    let (exposure, gain) = advisor.advise(&dark, None, preview_target());
    assert_eq!(exposure, 100.0);
    assert!((gain - 20.0).abs() < 1e-6);

    let darker = image_at(0.04, 500.0, Some(2.0));
    let (exposure, gain) = advisor.advise(&darker, None, preview_target());
    assert_eq!(exposure, 200.0);
    assert!((gain - 50.0).abs() < 1e-6);

    let darkest = image_at(0.04, 1000.0, Some(2.0));
    let (exposure, gain) = advisor.advise(&darkest, None, preview_target());
    assert_eq!(gain, 60.0);
    assert!((exposure - 20_000.0 / 60.0).abs() < 1e-6);
}

#[test]
fn test_preview_advice_tops_out_at_preview_max_gain() {
    let advisor = PreviewExposureAdvisor::new(ControllerParameters {
        preview_max_gain: 10.0,
        ..params()
    });
    let dark = image_at(0.04, 1000.0, Some(2.0));

    let (exposure, gain) = advisor.advise(&dark, None, preview_target());
    assert_eq!(gain, 10.0);
    assert!((exposure - 2000.0).abs() < 1e-6);
}

#[test]
fn test_preview_advice_saturated_backs_off() {
    let advisor = PreviewExposureAdvisor::new(params());
    let bytes = [u16::MAX; 4].iter().flat_map(|v| v.to_le_bytes()).collect();
    let frame = FrameBuffer::from_bytes(2, 2, PixelFormat::Mono16, bytes)
        .unwrap()
        .with_exposure(50.0);
    let image = Image::from_frame(&frame, false).unwrap();

    let (exposure, gain) = advisor.advise(&image, None, preview_target());
    assert!((exposure - 20.0).abs() < 1e-6);
    assert_eq!(gain, 1.0);
}
