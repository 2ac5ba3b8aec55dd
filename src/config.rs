//! Tracker configuration.

use serde::{Deserialize, Serialize};

use crate::{Result, TrackerError};

/// Configuration for sample admission while tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Drop samples with non-finite or out-of-range coordinates instead of
    /// appending them. Default: true
    pub skip_invalid_points: bool,

    /// Minimum distance in meters from the previous sample of the open segment.
    /// Samples closer than this are dropped. Default: 0.0 (keep every sample)
    pub min_point_spacing_meters: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            skip_invalid_points: true,
            min_point_spacing_meters: 0.0,
        }
    }
}

impl TrackerConfig {
    /// Parse a JSON config. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| TrackerError::Config {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.min_point_spacing_meters.is_finite() || self.min_point_spacing_meters < 0.0 {
            return Err(TrackerError::Config {
                message: format!(
                    "min_point_spacing_meters must be a non-negative number, got {}",
                    self.min_point_spacing_meters
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_keep_every_valid_sample() {
        let config = TrackerConfig::default();
        assert!(config.skip_invalid_points);
        assert_eq!(config.min_point_spacing_meters, 0.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_partial() {
        let config = TrackerConfig::from_json(r#"{"min_point_spacing_meters": 2.5}"#).unwrap();
        assert_eq!(config.min_point_spacing_meters, 2.5);
        assert!(config.skip_invalid_points);
    }

    #[test]
    fn test_from_json_rejects_negative_spacing() {
        let result = TrackerConfig::from_json(r#"{"min_point_spacing_meters": -1.0}"#);
        assert!(matches!(result, Err(TrackerError::Config { .. })));
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        let result = TrackerConfig::from_json("not json");
        assert!(matches!(result, Err(TrackerError::Config { .. })));
    }
}
