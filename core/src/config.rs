//! Renderer configuration handed in by the embedder.

use std::path::PathBuf;

use crate::limits::FRAMES_IN_FLIGHT;

/// Feature toggles for optional pipeline stages.
#[derive(Clone, Copy, Debug)]
pub struct Features {
    /// Run the hierarchical-Z occlusion test in the per-camera cull.
    pub occlusion_culling: bool,
    /// Build the depth pyramid (required by occlusion culling).
    pub depth_pyramid: bool,
    /// Submit compute passes on a dedicated compute queue when one exists.
    pub async_compute: bool,
    /// Sample the environment map and BRDF LUT in the ambient pass.
    pub ibl: bool,
}

impl Default for Features {
    fn default() -> Self {
        Features {
            occlusion_culling: true,
            depth_pyramid: true,
            async_compute: false,
            ibl: true,
        }
    }
}

/// Top-level configuration for renderer creation.
#[derive(Clone, Debug)]
pub struct RenderConfig {
    /// Initial window extent in pixels.
    pub width: u32,
    /// Initial window extent in pixels.
    pub height: u32,
    /// Requested frames in flight; clamped to the build constant.
    pub frames_in_flight: usize,
    /// Optional stage toggles.
    pub features: Features,
    /// Path of the pre-decoded environment cubemap, if IBL is enabled.
    pub environment_path: Option<PathBuf>,
    /// Path of the pre-decoded BRDF lookup table, if IBL is enabled.
    pub brdf_lut_path: Option<PathBuf>,
}

impl RenderConfig {
    /// Config with defaults for the given extent.
    pub fn new(width: u32, height: u32) -> Self {
        RenderConfig {
            width,
            height,
            frames_in_flight: FRAMES_IN_FLIGHT,
            features: Features::default(),
            environment_path: None,
            brdf_lut_path: None,
        }
    }

    /// Override the feature toggles.
    pub fn with_features(mut self, features: Features) -> Self {
        self.features = features;
        self
    }

    /// Set the environment cubemap path.
    pub fn with_environment(mut self, path: impl Into<PathBuf>) -> Self {
        self.environment_path = Some(path.into());
        self
    }

    /// Set the BRDF lookup-table path.
    pub fn with_brdf_lut(mut self, path: impl Into<PathBuf>) -> Self {
        self.brdf_lut_path = Some(path.into());
        self
    }

    /// Frames in flight actually used, never above the build constant.
    pub fn effective_frames_in_flight(&self) -> usize {
        self.frames_in_flight.clamp(1, FRAMES_IN_FLIGHT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_in_flight_clamped() {
        let mut config = RenderConfig::new(640, 480);
        config.frames_in_flight = 7;
        assert_eq!(config.effective_frames_in_flight(), FRAMES_IN_FLIGHT);
        config.frames_in_flight = 0;
        assert_eq!(config.effective_frames_in_flight(), 1);
    }
}
