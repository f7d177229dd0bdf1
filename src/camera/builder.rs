use super::simulated::SimulatedCamera;
use crate::config::SimulatorConfig;
use crate::error::{ExpocamError, Result};

/// Builder for the simulated camera
pub struct SimulatedCameraBuilder {
    config: Option<SimulatorConfig>,
    offline: bool,
}

impl SimulatedCameraBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            offline: false,
        }
    }

    pub fn config(mut self, config: SimulatorConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Build a camera whose `init` fails until it is brought back online
    pub fn offline(mut self) -> Self {
        self.offline = true;
        self
    }

    pub fn build(self) -> Result<SimulatedCamera> {
        let config = self
            .config
            .ok_or_else(|| ExpocamError::system("Simulator configuration must be specified"))?;

        if config.resolution.0 == 0 || config.resolution.1 == 0 {
            return Err(ExpocamError::system(format!(
                "Simulator resolution {}x{} is empty",
                config.resolution.0, config.resolution.1
            )));
        }

        let camera = SimulatedCamera::new(config);
        if self.offline {
            camera.set_online(false);
        }
        Ok(camera)
    }
}

impl Default for SimulatedCameraBuilder {
    fn default() -> Self {
        Self::new()
    }
}
