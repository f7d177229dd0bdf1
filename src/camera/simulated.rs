use super::interface::{Camera, CameraMode, ExposureRange};
use crate::config::SimulatorConfig;
use crate::error::CameraError;
use crate::frame::{FrameBuffer, PixelFormat};
use chrono::Utc;
use parking_lot::Mutex;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

#[derive(Debug)]
struct SensorState {
    online: bool,
    initialized: bool,
    started: bool,
    mode: CameraMode,
    gain: f64,
    /// Exposure most recently applied
    exposure_ms: f64,
    /// Exposure the sensor is actually integrating with
    effective_exposure_ms: f64,
    /// Frames left before `exposure_ms` takes effect
    pending_frames: u32,
    failures_to_inject: u32,
    frames_taken: u64,
}

/// Software sensor that renders a horizontal brightness ramp.
///
/// The brightest column receives `flux_per_ms * exposure * gain` counts,
/// the darkest half of that. Exposure changes only reach the pixels after
/// `latency_frames` further readouts, which is what the capture path's
/// settling discards are for.
pub struct SimulatedCamera {
    config: SimulatorConfig,
    range: ExposureRange,
    state: Mutex<SensorState>,
}

impl SimulatedCamera {
    pub fn new(config: SimulatorConfig) -> Self {
        let range = ExposureRange::new(config.min_exposure_ms, config.max_exposure_ms);
        let exposure = range.clamp(config.initial_exposure_ms);

        info!(
            "Simulated camera '{}' ({}x{} {}, exposure {}..{}ms, latency {} frames)",
            config.model,
            config.resolution.0,
            config.resolution.1,
            config.pixel_format,
            range.min_ms,
            range.max_ms,
            config.latency_frames
        );

        Self {
            range,
            state: Mutex::new(SensorState {
                online: true,
                initialized: false,
                started: false,
                mode: CameraMode::Idle,
                gain: 1.0,
                exposure_ms: exposure,
                effective_exposure_ms: exposure,
                pending_frames: 0,
                failures_to_inject: 0,
                frames_taken: 0,
            }),
            config,
        }
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// Make the next `count` foreground takes fail with an imaging error
    pub fn fail_next_frames(&self, count: u32) {
        self.state.lock().failures_to_inject = count;
    }

    /// Simulate the device being unplugged (`false`) or plugged back in
    pub fn set_online(&self, online: bool) {
        self.state.lock().online = online;
    }

    /// Foreground frames read out so far, including failed ones
    pub fn frames_taken(&self) -> u64 {
        self.state.lock().frames_taken
    }

    /// Exposure the next frame will actually be integrated with
    pub fn effective_exposure_ms(&self) -> f64 {
        let state = self.state.lock();
        if state.pending_frames > 0 {
            state.effective_exposure_ms
        } else {
            state.exposure_ms
        }
    }

    /// Count the brightest column receives at the given settings
    pub fn peak_signal(&self, exposure_ms: f64, gain: f64) -> f64 {
        self.config.flux_per_ms * exposure_ms * gain
    }

    fn render(&self, integrated_ms: f64, reported_ms: f64, gain: f64) -> FrameBuffer {
        let (width, height) = self.config.resolution;
        let format = self.config.pixel_format;
        let full_scale = ((1u64 << format.sample_depth()) - 1) as f64;
        let peak = self.peak_signal(integrated_ms, gain);

        let row: Vec<u16> = (0..width)
            .map(|x| {
                let fraction = if width > 1 {
                    0.5 + 0.5 * x as f64 / (width - 1) as f64
                } else {
                    1.0
                };
                (peak * fraction).round().clamp(0.0, full_scale) as u16
            })
            .collect();

        let mut data = Vec::with_capacity(FrameBuffer::size_for(width, height, format));
        for _ in 0..height {
            for &value in &row {
                match format {
                    PixelFormat::Mono8 => data.push(value as u8),
                    PixelFormat::Rgb8 => data.extend_from_slice(&[value as u8; 3]),
                    _ => data.extend_from_slice(&value.to_le_bytes()),
                }
            }
        }

        let mut frame = FrameBuffer::new(width, height, format)
            .with_exposure(reported_ms)
            .with_timestamp(Utc::now());
        frame.allocate();
        if let Ok(buffer) = frame.data_mut() {
            buffer.copy_from_slice(&data);
        }
        frame
    }
}

impl Camera for SimulatedCamera {
    fn model(&self) -> &str {
        &self.config.model
    }

    fn init(&self) -> Result<(), CameraError> {
        let mut state = self.state.lock();
        if !state.online {
            return Err(CameraError::Connection {
                details: format!("{} is not responding", self.config.model),
            });
        }
        state.initialized = true;
        debug!("Simulated camera initialized");
        Ok(())
    }

    fn close(&self) -> Result<(), CameraError> {
        let mut state = self.state.lock();
        state.initialized = false;
        state.started = false;
        state.mode = CameraMode::Idle;
        debug!("Simulated camera closed");
        Ok(())
    }

    fn start(&self) -> Result<(), CameraError> {
        let mut state = self.state.lock();
        if !state.initialized {
            return Err(CameraError::Operation {
                details: "camera must be initialized before start".to_string(),
            });
        }
        state.started = true;
        Ok(())
    }

    fn stop(&self) -> Result<(), CameraError> {
        let mut state = self.state.lock();
        state.started = false;
        state.mode = CameraMode::Idle;
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.state.lock().started
    }

    fn pixel_format(&self) -> PixelFormat {
        self.config.pixel_format
    }

    fn exposure_range(&self) -> ExposureRange {
        self.range
    }

    fn set_exposure_ms(&self, exposure_ms: f64) -> Result<f64, CameraError> {
        let applied = self.range.clamp(exposure_ms);
        if !self.range.contains(exposure_ms) {
            warn!(
                "Exposure {}ms outside {}..{}ms, using {}ms",
                exposure_ms, self.range.min_ms, self.range.max_ms, applied
            );
        }

        let mut state = self.state.lock();
        if applied != state.exposure_ms {
            if state.pending_frames == 0 {
                state.effective_exposure_ms = state.exposure_ms;
            }
            state.exposure_ms = applied;
            state.pending_frames = self.config.latency_frames;
        }
        Ok(applied)
    }

    fn exposure_ms(&self) -> f64 {
        self.state.lock().exposure_ms
    }

    fn set_gain(&self, gain: f64) -> Result<(), CameraError> {
        if !gain.is_finite() || gain <= 0.0 {
            return Err(CameraError::Operation {
                details: format!("invalid gain {}", gain),
            });
        }
        self.state.lock().gain = gain;
        Ok(())
    }

    fn gain(&self) -> f64 {
        self.state.lock().gain
    }

    fn take_frame(&self) -> Result<FrameBuffer, CameraError> {
        let (integrated, reported, gain) = {
            let mut state = self.state.lock();
            if !state.started {
                return Err(CameraError::NotStarted);
            }
            state.frames_taken += 1;

            let integrated = if state.pending_frames > 0 {
                state.pending_frames -= 1;
                state.effective_exposure_ms
            } else {
                state.effective_exposure_ms = state.exposure_ms;
                state.exposure_ms
            };

            if state.failures_to_inject > 0 {
                state.failures_to_inject -= 1;
                return Err(CameraError::Imaging {
                    details: "injected readout failure".to_string(),
                });
            }

            if state.mode == CameraMode::Idle {
                state.mode = CameraMode::Single;
            }
            (integrated, state.exposure_ms, state.gain)
        };

        if self.config.readout_ms > 0 {
            std::thread::sleep(Duration::from_millis(self.config.readout_ms));
        }

        let frame = self.render(integrated, reported, gain);

        let mut state = self.state.lock();
        if state.mode == CameraMode::Single {
            state.mode = CameraMode::Idle;
        }
        trace!(
            "Simulated frame: integrated {}ms (reported {}ms) x{}",
            integrated,
            reported,
            gain
        );
        Ok(frame)
    }

    fn start_preview(&self) -> Result<(), CameraError> {
        let mut state = self.state.lock();
        if !state.started {
            return Err(CameraError::Preview {
                details: "camera is not started".to_string(),
            });
        }
        state.mode = CameraMode::Preview;
        Ok(())
    }

    fn stop_preview(&self) -> Result<(), CameraError> {
        let mut state = self.state.lock();
        if state.mode == CameraMode::Preview {
            state.mode = CameraMode::Idle;
        }
        Ok(())
    }

    fn mode(&self) -> CameraMode {
        self.state.lock().mode
    }

    fn poll_preview_frame(&self) -> Result<Option<FrameBuffer>, CameraError> {
        let (exposure, gain) = {
            let state = self.state.lock();
            if state.mode != CameraMode::Preview {
                return Ok(None);
            }
            (state.exposure_ms, state.gain)
        };
        Ok(Some(self.render(exposure, exposure, gain)))
    }
}
