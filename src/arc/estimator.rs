//! Lightweight memory estimator for chunk admission.

use crate::Resolution;

/// Estimated accelerator footprint of one chunk inference call.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceEstimate {
    pub frames: usize,
    pub resolution: Resolution,
    pub memory_mb: f32,
}

/// Stateless estimator relying on chunk length and inference resolution.
#[derive(Debug, Clone)]
pub struct ResourceEstimator {
    /// Working-set bytes per input pixel, activations included.
    pub bytes_per_pixel: f32,
}

impl Default for ResourceEstimator {
    fn default() -> Self {
        Self {
            bytes_per_pixel: 64.0,
        }
    }
}

impl ResourceEstimator {
    /// Scales linearly with the number of pixels the model sees at once.
    pub fn estimate(&self, frames: usize, resolution: Resolution) -> ResourceEstimate {
        let pixels = frames as f32 * resolution.pixels() as f32;
        ResourceEstimate {
            frames,
            resolution,
            memory_mb: pixels * self.bytes_per_pixel / (1024.0 * 1024.0),
        }
    }
}
