//! Process-wide fusion parameters.

use thiserror::Error;

/// Errors raised while validating the fusion setup. All of them are fatal
/// at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("voxel resolution must be positive, got {0}")]
    NonPositiveVoxelRes(f32),
    #[error("truncation distance must be positive, got {0}")]
    NonPositiveTau(f32),
    #[error("integration distances must be non-negative, got {0}")]
    NegativeDistance(f32),
    #[error("minimum distance {min} is not below maximum distance {max}")]
    InvalidDistanceRange { min: f32, max: f32 },
    #[error("unknown dataset type: {0}")]
    UnknownDataset(String),
}

/// Fusion parameters, immutable once the engine is built.
#[derive(Debug, Clone, Copy)]
pub struct FusionConfig {
    /// Edge length of a voxel in meters.
    pub voxel_res: f32,
    /// Truncation distance in meters. Also the standard deviation of the
    /// Gaussian integration weight.
    pub tau: f32,
    /// Near clipping distance for depth samples.
    pub min_dist: f32,
    /// Far clipping distance for depth samples.
    pub max_dist: f32,
    /// Largest frame dimensions the engine has to accept, used to size
    /// the per-frame scratch clouds.
    pub max_frame_width: usize,
    pub max_frame_height: usize,
}

impl FusionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.voxel_res <= 0.0 {
            return Err(ConfigError::NonPositiveVoxelRes(self.voxel_res));
        }
        if self.tau <= 0.0 {
            return Err(ConfigError::NonPositiveTau(self.tau));
        }
        if self.min_dist < 0.0 {
            return Err(ConfigError::NegativeDistance(self.min_dist));
        }
        if self.max_dist < 0.0 {
            return Err(ConfigError::NegativeDistance(self.max_dist));
        }
        if self.min_dist >= self.max_dist {
            return Err(ConfigError::InvalidDistanceRange {
                min: self.min_dist,
                max: self.max_dist,
            });
        }
        Ok(())
    }
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            voxel_res: 0.01,
            tau: 0.025,
            min_dist: 0.0,
            max_dist: 2.0,
            max_frame_width: 640,
            max_frame_height: 480,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(FusionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_non_positive_resolution() {
        let config = FusionConfig {
            voxel_res: 0.0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NonPositiveVoxelRes(_))
        ));
    }

    #[test]
    fn test_rejects_non_positive_tau() {
        let config = FusionConfig {
            tau: -0.01,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::NonPositiveTau(_))));
    }

    #[test]
    fn test_rejects_inverted_distance_range() {
        let config = FusionConfig {
            min_dist: 3.0,
            max_dist: 2.0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidDistanceRange { .. })
        ));
    }
}
