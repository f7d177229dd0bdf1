use crate::exposure::ControllerParameters;
use crate::frame::{PixelFormat, Rotation};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ExpocamConfig {
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub controller: ControllerParameters,
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub simulator: SimulatorConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CaptureConfig {
    /// Frames to throw away after the exposure time changes
    #[serde(default = "default_frames_to_skip")]
    pub frames_to_skip_after_exposure_set: u32,

    /// Mirror frames left/right
    #[serde(default)]
    pub flip_horizontal: bool,

    /// Mirror frames top/bottom
    #[serde(default)]
    pub flip_vertical: bool,

    /// Horizontal flip the sensor needs to produce an upright image
    #[serde(default)]
    pub native_flip_horizontal: bool,

    /// Vertical flip the sensor needs to produce an upright image
    #[serde(default)]
    pub native_flip_vertical: bool,

    /// Clockwise rotation, composed with the flips into one transpose + flip pass
    pub rotation: Option<Rotation>,

    /// Hardware gain used for foreground captures
    #[serde(default = "default_gain")]
    pub take_gain: f64,

    /// Hardware gain used while previewing
    #[serde(default = "default_gain")]
    pub preview_gain: f64,

    /// Software gain a foreground capture starts from
    #[serde(default = "default_gain")]
    pub virtual_gain: f64,

    /// Software gain applied to preview frames
    #[serde(default = "default_gain")]
    pub preview_virtual_gain: f64,

    /// Shift samples up to the container depth (e.g. 12 bit data to 16 bit)
    #[serde(default)]
    pub depth_extend: bool,

    /// Run the exposure loop for `take_image`
    #[serde(default = "default_auto_exposure")]
    pub auto_exposure: bool,

    /// Upper bound on frames taken by one auto-exposure capture
    #[serde(default = "default_max_iterations")]
    pub max_auto_exposure_iterations: u32,

    /// Preview polling period in milliseconds
    #[serde(default = "default_preview_poll_interval")]
    pub preview_poll_interval_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SystemConfig {
    /// Event bus capacity
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
}

/// Scene and sensor model for the simulated camera
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SimulatorConfig {
    #[serde(default = "default_simulator_model")]
    pub model: String,

    #[serde(default = "default_simulator_resolution")]
    pub resolution: (u32, u32),

    #[serde(default = "default_simulator_pixel_format")]
    pub pixel_format: PixelFormat,

    #[serde(default = "default_simulator_min_exposure")]
    pub min_exposure_ms: f64,

    #[serde(default = "default_simulator_max_exposure")]
    pub max_exposure_ms: f64,

    #[serde(default = "default_simulator_initial_exposure")]
    pub initial_exposure_ms: f64,

    /// Counts per millisecond at gain 1 for the brightest pixel
    #[serde(default = "default_simulator_flux")]
    pub flux_per_ms: f64,

    /// Frames still read out at the old exposure after a change
    #[serde(default = "default_simulator_latency")]
    pub latency_frames: u32,

    /// Readout time added to every foreground frame
    #[serde(default)]
    pub readout_ms: u64,
}

impl ExpocamConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("expocam.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            .add_source(File::with_name(&path_str).required(false))
            // EXPOCAM_CAPTURE__TAKE_GAIN=4 -> capture.take_gain
            .add_source(
                Environment::with_prefix("EXPOCAM")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: ExpocamConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.controller;

        if c.min_exposure_ms <= 0.0 || c.max_exposure_ms <= 0.0 {
            return Err(ConfigError::Message(
                "Controller exposure limits must be greater than 0".to_string(),
            ));
        }

        if c.min_exposure_ms > c.max_exposure_ms {
            return Err(ConfigError::Message(format!(
                "Controller min_exposure_ms ({}) exceeds max_exposure_ms ({})",
                c.min_exposure_ms, c.max_exposure_ms
            )));
        }

        if c.min_level > c.max_level {
            return Err(ConfigError::Message(format!(
                "Controller min_level ({}) exceeds max_level ({})",
                c.min_level, c.max_level
            )));
        }

        if c.target_level < c.min_level || c.target_level > c.max_level {
            return Err(ConfigError::Message(format!(
                "Controller target_level ({}) must lie within [{}, {}]",
                c.target_level, c.min_level, c.max_level
            )));
        }

        if c.max_test_gain < 1.0 || c.preview_max_gain < 1.0 {
            return Err(ConfigError::Message(
                "Controller gain limits must be at least 1".to_string(),
            ));
        }

        let cap = &self.capture;
        if cap.max_auto_exposure_iterations == 0 {
            return Err(ConfigError::Message(
                "Capture max_auto_exposure_iterations must be greater than 0".to_string(),
            ));
        }

        if cap.preview_poll_interval_ms == 0 {
            return Err(ConfigError::Message(
                "Capture preview_poll_interval_ms must be greater than 0".to_string(),
            ));
        }

        for (name, gain) in [
            ("take_gain", cap.take_gain),
            ("preview_gain", cap.preview_gain),
            ("virtual_gain", cap.virtual_gain),
            ("preview_virtual_gain", cap.preview_virtual_gain),
        ] {
            if gain <= 0.0 {
                return Err(ConfigError::Message(format!(
                    "Capture {} must be greater than 0",
                    name
                )));
            }
        }

        if self.system.event_bus_capacity == 0 {
            return Err(ConfigError::Message(
                "Event bus capacity must be greater than 0".to_string(),
            ));
        }

        let sim = &self.simulator;
        if sim.resolution.0 == 0 || sim.resolution.1 == 0 {
            return Err(ConfigError::Message(
                "Simulator resolution must be greater than 0".to_string(),
            ));
        }

        if sim.min_exposure_ms <= 0.0 || sim.min_exposure_ms > sim.max_exposure_ms {
            return Err(ConfigError::Message(
                "Simulator exposure range is invalid".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            frames_to_skip_after_exposure_set: default_frames_to_skip(),
            flip_horizontal: false,
            flip_vertical: false,
            native_flip_horizontal: false,
            native_flip_vertical: false,
            rotation: None,
            take_gain: default_gain(),
            preview_gain: default_gain(),
            virtual_gain: default_gain(),
            preview_virtual_gain: default_gain(),
            depth_extend: false,
            auto_exposure: default_auto_exposure(),
            max_auto_exposure_iterations: default_max_iterations(),
            preview_poll_interval_ms: default_preview_poll_interval(),
        }
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            event_bus_capacity: default_event_bus_capacity(),
        }
    }
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            model: default_simulator_model(),
            resolution: default_simulator_resolution(),
            pixel_format: default_simulator_pixel_format(),
            min_exposure_ms: default_simulator_min_exposure(),
            max_exposure_ms: default_simulator_max_exposure(),
            initial_exposure_ms: default_simulator_initial_exposure(),
            flux_per_ms: default_simulator_flux(),
            latency_frames: default_simulator_latency(),
            readout_ms: 0,
        }
    }
}

// Default value functions
fn default_frames_to_skip() -> u32 {
    2
}
fn default_gain() -> f64 {
    1.0
}
fn default_auto_exposure() -> bool {
    true
}
fn default_max_iterations() -> u32 {
    15
}
fn default_preview_poll_interval() -> u64 {
    50
}

fn default_event_bus_capacity() -> usize {
    256
}

fn default_simulator_model() -> String {
    "Simulated".to_string()
}
fn default_simulator_resolution() -> (u32, u32) {
    (64, 48)
}
fn default_simulator_pixel_format() -> PixelFormat {
    PixelFormat::Mono12
}
fn default_simulator_min_exposure() -> f64 {
    1.0
}
fn default_simulator_max_exposure() -> f64 {
    2000.0
}
fn default_simulator_initial_exposure() -> f64 {
    10.0
}
fn default_simulator_flux() -> f64 {
    20.0
}
fn default_simulator_latency() -> u32 {
    2
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::Region;
    use std::env;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = ExpocamConfig::default();

        assert!(config.validate().is_ok());
        assert_eq!(config.capture.frames_to_skip_after_exposure_set, 2);
        assert_eq!(config.capture.max_auto_exposure_iterations, 15);
        assert!(config.capture.auto_exposure);
        assert_eq!(config.controller.max_exposure_ms, 2000.0);
        assert_eq!(config.controller.target_level, 0.85);
        assert_eq!(config.simulator.pixel_format, PixelFormat::Mono12);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[capture]
take_gain = 4.0
rotation = "Rotate90"
flip_horizontal = true

[controller]
min_level = 0.5
target_level = 0.6
region = {{ x = 2, y = 3, width = 10, height = 8 }}

[simulator]
pixel_format = "Mono16"
resolution = [32, 16]
"#
        )
        .unwrap();

        let config = ExpocamConfig::load_from_file(file.path()).unwrap();

        assert_eq!(config.capture.take_gain, 4.0);
        assert_eq!(config.capture.rotation, Some(Rotation::Rotate90));
        assert!(config.capture.flip_horizontal);
        // untouched fields keep their defaults
        assert_eq!(config.capture.frames_to_skip_after_exposure_set, 2);
        assert_eq!(config.controller.min_level, 0.5);
        assert_eq!(config.controller.max_level, 0.95);
        assert_eq!(config.controller.region, Some(Region::new(2, 3, 10, 8)));
        assert_eq!(config.simulator.pixel_format, PixelFormat::Mono16);
        assert_eq!(config.simulator.resolution, (32, 16));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ExpocamConfig::load_from_file(dir.path().join("absent.toml")).unwrap();

        assert_eq!(config.capture.take_gain, 1.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_environment_variable_override() {
        env::set_var("EXPOCAM_SIMULATOR__LATENCY_FRAMES", "5");

        let dir = tempfile::tempdir().unwrap();
        let config = ExpocamConfig::load_from_file(dir.path().join("absent.toml")).unwrap();
        env::remove_var("EXPOCAM_SIMULATOR__LATENCY_FRAMES");

        assert_eq!(config.simulator.latency_frames, 5);
    }

    #[test]
    fn test_config_validation() {
        let mut config = ExpocamConfig::default();

        config.controller.min_level = 0.96;
        assert!(config.validate().is_err());
        config.controller.min_level = 0.70;

        config.controller.target_level = 0.99;
        assert!(config.validate().is_err());
        config.controller.target_level = 0.85;

        config.controller.min_exposure_ms = 3000.0;
        assert!(config.validate().is_err());
        config.controller.min_exposure_ms = 0.0;
        assert!(config.validate().is_err());
        config.controller.min_exposure_ms = 1.0;

        config.controller.max_test_gain = 0.5;
        assert!(config.validate().is_err());
        config.controller.max_test_gain = 60.0;

        config.capture.max_auto_exposure_iterations = 0;
        assert!(config.validate().is_err());
        config.capture.max_auto_exposure_iterations = 15;

        config.capture.virtual_gain = 0.0;
        assert!(config.validate().is_err());
        config.capture.virtual_gain = 1.0;

        config.capture.preview_poll_interval_ms = 0;
        assert!(config.validate().is_err());
        config.capture.preview_poll_interval_ms = 50;

        config.system.event_bus_capacity = 0;
        assert!(config.validate().is_err());
        config.system.event_bus_capacity = 16;

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serializes_to_toml() {
        let config = ExpocamConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();

        assert!(text.contains("[capture]"));
        assert!(text.contains("take_gain"));
        assert!(text.contains("[controller]"));
    }
}
