//! Backend configuration.

use anyhow::{bail, Result};
use serde::Deserialize;

/// Parameters recognized by the mapping backend. Deserialized by an
/// external configuration loader; defaults match the RGB-D pipeline.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Reprojection χ² threshold for the two-pass outlier sweep.
    pub chi2_th: f64,

    /// Maximum Hamming distance for re-matching a new mappoint against an
    /// existing keyframe's keypoints.
    pub re_match_descriptor_distance: f64,

    /// Minimum number of shared mappoints for a covisibility link.
    pub min_covisibility_weight: usize,

    /// Levenberg-Marquardt iterations per bundle adjustment round.
    pub bundle_iterations: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            chi2_th: 5.991,
            re_match_descriptor_distance: 50.0,
            min_covisibility_weight: 15,
            bundle_iterations: 10,
        }
    }
}

impl BackendConfig {
    /// Reject configurations the backend cannot run with. Called at
    /// backend construction; failures are fatal.
    pub fn validate(&self) -> Result<()> {
        if !self.chi2_th.is_finite() || self.chi2_th <= 0.0 {
            bail!("chi2_th must be positive and finite, got {}", self.chi2_th);
        }
        if !self.re_match_descriptor_distance.is_finite() || self.re_match_descriptor_distance < 0.0
        {
            bail!(
                "re_match_descriptor_distance must be non-negative, got {}",
                self.re_match_descriptor_distance
            );
        }
        if self.bundle_iterations == 0 {
            bail!("bundle_iterations must be at least 1");
        }
        Ok(())
    }
}
