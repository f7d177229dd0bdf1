use crate::config::CaptureConfig;
use crate::frame::Rotation;
use crate::imaging::PixelPlane;

/// Geometric correction applied to every frame: an optional transpose
/// followed by flips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameTransform {
    pub transpose: bool,
    pub flip_horizontal: bool,
    pub flip_vertical: bool,
}

impl FrameTransform {
    /// Compose flips with a clockwise rotation
    pub fn new(flip_horizontal: bool, flip_vertical: bool, rotation: Option<Rotation>) -> Self {
        let mut transform = Self {
            transpose: false,
            flip_horizontal,
            flip_vertical,
        };

        match rotation {
            None => {}
            Some(Rotation::Rotate90) => {
                transform.transpose = true;
                transform.flip_horizontal = !transform.flip_horizontal;
            }
            Some(Rotation::Rotate180) => {
                transform.flip_horizontal = !transform.flip_horizontal;
                transform.flip_vertical = !transform.flip_vertical;
            }
            Some(Rotation::Rotate270) => {
                transform.transpose = true;
                transform.flip_vertical = !transform.flip_vertical;
            }
        }

        transform
    }

    /// User flips are relative to the sensor's native orientation
    pub fn from_config(config: &CaptureConfig) -> Self {
        Self::new(
            config.native_flip_horizontal ^ config.flip_horizontal,
            config.native_flip_vertical ^ config.flip_vertical,
            config.rotation,
        )
    }

    pub fn is_identity(&self) -> bool {
        !self.transpose && !self.flip_horizontal && !self.flip_vertical
    }

    pub fn apply(&self, plane: &mut PixelPlane) {
        if self.transpose {
            plane.transpose();
        }
        plane.flip(self.flip_horizontal, self.flip_vertical);
    }
}
