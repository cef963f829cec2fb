//! Erosion configuration.

use std::path::Path;

use glam::{Vec2, Vec3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Steepest angle of repose accepted, in degrees.
pub const MAX_ANGLE_OF_REPOSE_DEG: f32 = 89.9;

/// Errors raised while loading or saving a configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid configuration JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Water flow and sediment transport parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HydraulicParams {
    /// Number of outer iterations.
    pub iterations: u32,
    /// Time step of one iteration.
    pub time_delta: f32,
    /// Water added per unit time to every cell.
    pub precipitation_rate: f32,
    /// Water removed per unit time from every cell.
    pub evaporation_rate: f32,
    /// Pipe coefficient scaling the pressure-driven outflow.
    pub flow_rate: f32,

    /// Sediment carried per unit of speed × tilt (Kc).
    pub sediment_capacity: f32,
    /// Base dissolve rate (Ks).
    pub sediment_dissolve_rate: f32,
    /// Base deposit rate (Kd).
    pub sediment_deposit_rate: f32,

    /// Dissolve multiplier for cells at the bottom of a channel.
    pub riverbed_dissolve_rate: f32,
    /// Deposit multiplier for cells at the bottom of a channel.
    pub riverbed_deposit_rate: f32,
    /// Dissolve multiplier for shallow cells on the channel edge.
    pub riverbank_dissolve_rate: f32,
    /// Deposit multiplier for shallow cells on the channel edge.
    pub riverbank_deposit_rate: f32,
}

impl Default for HydraulicParams {
    fn default() -> Self {
        Self {
            iterations: 50,
            time_delta: 0.05,
            precipitation_rate: 0.02,
            evaporation_rate: 0.01,
            flow_rate: 1.0,

            sediment_capacity: 1.0,
            sediment_dissolve_rate: 0.3,
            sediment_deposit_rate: 0.3,

            riverbed_dissolve_rate: 1.0,
            riverbed_deposit_rate: 1.0,
            riverbank_dissolve_rate: 0.5,
            riverbank_deposit_rate: 1.5,
        }
    }
}

/// Slope relaxation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThermalParams {
    /// Run thermal sub-steps after each hydraulic iteration.
    pub enabled: bool,
    /// Sub-steps per outer iteration.
    pub iterations: u32,
    /// Fraction of the excess slope moved per sub-step (0-1).
    pub time_delta: f32,
    /// Angle of repose in degrees. Typical: 30-45.
    pub angle_of_repose_deg: f32,
    /// Largest per-cell variation of the angle, in degrees. Redrawn every
    /// sub-step.
    pub repose_jitter_deg: f32,
    /// Also relax towards the four diagonal neighbours.
    pub include_diagonals: bool,
}

impl Default for ThermalParams {
    fn default() -> Self {
        Self {
            enabled: true,
            iterations: 4,
            time_delta: 0.5,
            angle_of_repose_deg: 35.0,
            repose_jitter_deg: 0.0,
            include_diagonals: false,
        }
    }
}

/// Parameters for one erosion run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErosionConfig {
    pub hydraulic: HydraulicParams,
    pub thermal: ThermalParams,

    /// World size of the terrain: x = width, y = height of a unit input
    /// height, z = length.
    pub terrain_dimensions: Vec3,
    /// World units per cell. Derived from `terrain_dimensions` when unset.
    pub texel_size: Option<Vec2>,
    /// Spatial scale applied to the texel size.
    pub sim_scale: f32,
    /// Gravitational constant.
    pub gravity: f32,

    /// Multiplier on the height change applied per step.
    pub effect_scalar: f32,
    /// Mirror the net height change of the run about the input terrain.
    pub invert_effect: bool,

    /// Seed for the angle-of-repose jitter.
    pub seed: u64,
}

impl Default for ErosionConfig {
    fn default() -> Self {
        Self {
            hydraulic: HydraulicParams::default(),
            thermal: ThermalParams::default(),

            terrain_dimensions: Vec3::new(1000.0, 600.0, 1000.0),
            texel_size: None,
            sim_scale: 1.0,
            gravity: 9.81,

            effect_scalar: 1.0,
            invert_effect: false,

            seed: 42,
        }
    }
}

fn non_negative(name: &str, value: f32) -> f32 {
    if value >= 0.0 {
        value
    } else {
        log::warn!("{} = {} is negative, clamping to 0", name, value);
        0.0
    }
}

fn positive_or(name: &str, value: f32, fallback: f32) -> f32 {
    if value > 0.0 && value.is_finite() {
        value
    } else {
        log::warn!("{} = {} must be positive, using {}", name, value, fallback);
        fallback
    }
}

impl ErosionConfig {
    /// Loads a configuration from a JSON file. Missing keys take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn to_json_string(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Returns a copy with every out-of-range value clamped into range.
    ///
    /// Tuning values are never rejected: negative rates become zero, the
    /// angle of repose is clamped to `[0, 89.9]` degrees, the thermal rate to
    /// `[0, 1]`, and non-positive scales fall back to their defaults.
    pub fn sanitized(&self) -> Self {
        let defaults = ErosionConfig::default();
        let h = &self.hydraulic;
        let t = &self.thermal;

        let hydraulic = HydraulicParams {
            iterations: h.iterations,
            time_delta: non_negative("hydraulic.time_delta", h.time_delta),
            precipitation_rate: non_negative("hydraulic.precipitation_rate", h.precipitation_rate),
            evaporation_rate: non_negative("hydraulic.evaporation_rate", h.evaporation_rate),
            flow_rate: non_negative("hydraulic.flow_rate", h.flow_rate),
            sediment_capacity: non_negative("hydraulic.sediment_capacity", h.sediment_capacity),
            sediment_dissolve_rate: non_negative("hydraulic.sediment_dissolve_rate", h.sediment_dissolve_rate),
            sediment_deposit_rate: non_negative("hydraulic.sediment_deposit_rate", h.sediment_deposit_rate),
            riverbed_dissolve_rate: non_negative("hydraulic.riverbed_dissolve_rate", h.riverbed_dissolve_rate),
            riverbed_deposit_rate: non_negative("hydraulic.riverbed_deposit_rate", h.riverbed_deposit_rate),
            riverbank_dissolve_rate: non_negative("hydraulic.riverbank_dissolve_rate", h.riverbank_dissolve_rate),
            riverbank_deposit_rate: non_negative("hydraulic.riverbank_deposit_rate", h.riverbank_deposit_rate),
        };

        let angle = t.angle_of_repose_deg.clamp(0.0, MAX_ANGLE_OF_REPOSE_DEG);
        if angle != t.angle_of_repose_deg {
            log::warn!(
                "thermal.angle_of_repose_deg = {} out of range, clamped to {}",
                t.angle_of_repose_deg,
                angle
            );
        }
        let thermal = ThermalParams {
            enabled: t.enabled,
            iterations: t.iterations,
            time_delta: non_negative("thermal.time_delta", t.time_delta).min(1.0),
            angle_of_repose_deg: angle,
            repose_jitter_deg: non_negative("thermal.repose_jitter_deg", t.repose_jitter_deg),
            include_diagonals: t.include_diagonals,
        };

        let d = self.terrain_dimensions;
        let terrain_dimensions = Vec3::new(
            positive_or("terrain_dimensions.x", d.x, defaults.terrain_dimensions.x),
            positive_or("terrain_dimensions.y", d.y, defaults.terrain_dimensions.y),
            positive_or("terrain_dimensions.z", d.z, defaults.terrain_dimensions.z),
        );
        let texel_size = self.texel_size.and_then(|t| {
            if t.x > 0.0 && t.y > 0.0 {
                Some(t)
            } else {
                log::warn!("texel_size {:?} must be positive, deriving it from terrain_dimensions", t);
                None
            }
        });

        Self {
            hydraulic,
            thermal,
            terrain_dimensions,
            texel_size,
            sim_scale: positive_or("sim_scale", self.sim_scale, defaults.sim_scale),
            gravity: positive_or("gravity", self.gravity, defaults.gravity),
            effect_scalar: non_negative("effect_scalar", self.effect_scalar),
            invert_effect: self.invert_effect,
            seed: self.seed,
        }
    }

    /// World height of a unit input height.
    pub fn height_scale(&self) -> f32 {
        self.terrain_dimensions.y
    }

    /// World units per cell for a `width x height` grid, including `sim_scale`.
    pub fn texel_size_for(&self, width: usize, height: usize) -> Vec2 {
        let base = self.texel_size.unwrap_or_else(|| {
            Vec2::new(
                self.terrain_dimensions.x / width.max(1) as f32,
                self.terrain_dimensions.z / height.max(1) as f32,
            )
        });
        base * self.sim_scale
    }
}

/// Slope tangent for an angle of repose in degrees, after clamping.
pub fn talus_slope(angle_deg: f32) -> f32 {
    angle_deg.clamp(0.0, MAX_ANGLE_OF_REPOSE_DEG).to_radians().tan()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitized_clamps_instead_of_rejecting() {
        let mut config = ErosionConfig::default();
        config.hydraulic.precipitation_rate = -1.0;
        config.thermal.angle_of_repose_deg = 120.0;
        config.thermal.repose_jitter_deg = -3.0;
        config.thermal.time_delta = 4.0;
        config.sim_scale = 0.0;
        config.texel_size = Some(Vec2::new(-1.0, 1.0));

        let clean = config.sanitized();
        assert_eq!(clean.hydraulic.precipitation_rate, 0.0);
        assert_eq!(clean.thermal.angle_of_repose_deg, MAX_ANGLE_OF_REPOSE_DEG);
        assert_eq!(clean.thermal.repose_jitter_deg, 0.0);
        assert_eq!(clean.thermal.time_delta, 1.0);
        assert_eq!(clean.sim_scale, 1.0);
        assert_eq!(clean.texel_size, None);
    }

    #[test]
    fn test_sanitized_keeps_valid_config() {
        let config = ErosionConfig::default();
        assert_eq!(config.sanitized(), config);
    }

    #[test]
    fn test_talus_slope() {
        assert_eq!(talus_slope(0.0), 0.0);
        assert!((talus_slope(45.0) - 1.0).abs() < 1e-6);
        assert!(talus_slope(90.0) > 500.0);
        assert_eq!(talus_slope(-10.0), 0.0);
    }

    #[test]
    fn test_texel_size() {
        let mut config = ErosionConfig::default();
        assert_eq!(config.texel_size_for(500, 250), Vec2::new(2.0, 4.0));
        config.sim_scale = 0.5;
        assert_eq!(config.texel_size_for(500, 250), Vec2::new(1.0, 2.0));
        config.texel_size = Some(Vec2::splat(3.0));
        assert_eq!(config.texel_size_for(500, 250), Vec2::splat(1.5));
    }

    #[test]
    fn test_json_round_trip_with_partial_input() {
        let config: ErosionConfig =
            serde_json::from_str(r#"{ "hydraulic": { "iterations": 7 }, "invert_effect": true }"#).unwrap();
        assert_eq!(config.hydraulic.iterations, 7);
        assert_eq!(config.hydraulic.time_delta, HydraulicParams::default().time_delta);
        assert!(config.invert_effect);

        let text = config.to_json_string().unwrap();
        let back: ErosionConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("erosion.json");
        std::fs::write(&path, r#"{ "thermal": { "angle_of_repose_deg": 30.0 } }"#).unwrap();
        let config = ErosionConfig::from_json_file(&path).unwrap();
        assert_eq!(config.thermal.angle_of_repose_deg, 30.0);

        let missing = ErosionConfig::from_json_file(&dir.path().join("missing.json"));
        assert!(matches!(missing, Err(ConfigError::Io(_))));
    }
}
