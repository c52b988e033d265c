//! YAML configuration for the companion.
//!
//! Keys are camelCase; every parameter has a default so a missing file
//! or an empty document still yields a runnable configuration. Parsing
//! and semantic validation are separate steps so the two failure modes
//! map to distinct exit codes.

use std::path::Path;

use serde::{Deserialize, Serialize};

use rover_core::geometry::Angle;
use rover_core::marker::MarkerParams;
use rover_core::radar::{BeamModel, RadarParams};
use rover_core::status::RobotSpec;
use rover_core::world::WorldParams;

use crate::error::CompanionError;

/// Top-level configuration document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    pub robot: RobotConfig,
    pub modeller: ModellerConfig,
    pub spec: SpecConfig,
    pub watchdog: WatchdogConfig,
}

/// Sensor link settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct RobotConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout: u64,
    pub read_timeout: u64,
    pub backoff_min: u64,
    pub backoff_max: u64,
    /// Clock-sync exchange period in milliseconds.
    pub clock_sync_interval: u64,
    /// Consecutive failed connects before giving up; 0 retries forever.
    pub max_retries: u32,
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self {
            host: "192.168.4.1".to_string(),
            port: 4001,
            connect_timeout: 10_000,
            read_timeout: 3_000,
            backoff_min: 500,
            backoff_max: 30_000,
            clock_sync_interval: 60_000,
            max_retries: 0,
        }
    }
}

/// World-modeller parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct ModellerConfig {
    pub radar_width: usize,
    pub radar_height: usize,
    /// Cell size in metres.
    pub radar_grid: f64,
    pub radar_clean_interval: i64,
    pub correlation_interval: i64,
    pub echo_persistence: i64,
    pub contact_persistence: i64,
    /// Evidence weight decay constant in milliseconds.
    pub decay: i64,
    pub num_sectors: usize,
    pub min_radar_distance: f64,
    /// Marker location EMA time constant in milliseconds.
    pub marker_decay: f64,
    pub marker_clean_decay: f64,
    pub marker_size: f64,
    pub min_number_events: u32,
    pub beam: BeamModel,
    pub min_inference_interval: i64,
}

impl Default for ModellerConfig {
    fn default() -> Self {
        Self {
            radar_width: 51,
            radar_height: 51,
            radar_grid: 0.2,
            radar_clean_interval: 30_000,
            correlation_interval: 500,
            echo_persistence: 300_000,
            contact_persistence: 300_000,
            decay: 300_000,
            num_sectors: 24,
            min_radar_distance: 0.3,
            marker_decay: 60_000.0,
            marker_clean_decay: 30_000.0,
            marker_size: 0.2,
            min_number_events: 3,
            beam: BeamModel::Ray,
            min_inference_interval: 100,
        }
    }
}

/// Robot physical specification and calibration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct SpecConfig {
    pub max_radar_distance: f64,
    /// Sonar beam half-angle in degrees.
    pub receptive_angle: f64,
    pub contact_radius: f64,
    /// Camera horizontal half view in degrees.
    pub camera_half_view: f64,
    /// Camera calibration in radians per pixel.
    pub camera_angular_ratio: f64,
    pub safe_distance: f64,
    /// Supply calibration in volts per ADC count.
    pub supply_scale: f64,
}

impl Default for SpecConfig {
    fn default() -> Self {
        let spec = RobotSpec::default();
        Self {
            max_radar_distance: spec.max_radar_distance,
            receptive_angle: spec.receptive_angle.to_deg(),
            contact_radius: spec.contact_radius,
            camera_half_view: spec.camera_half_view.to_deg(),
            camera_angular_ratio: spec.camera_angular_ratio,
            safe_distance: spec.safe_distance,
            supply_scale: spec.supply_scale,
        }
    }
}

/// Watchdog settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct WatchdogConfig {
    /// How long the safety predicate may fail continuously, in
    /// milliseconds.
    pub window: i64,
    /// Minimum admissible supply voltage.
    pub min_supply_voltage: f64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            window: 5_000,
            min_supply_voltage: 7.0,
        }
    }
}

impl Config {
    /// Load and validate a configuration file. A missing path yields the
    /// defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, CompanionError> {
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    CompanionError::Config(format!("{}: {e}", path.display()))
                })?;
                serde_yaml::from_str(&text).map_err(|e| {
                    CompanionError::Config(format!("{}: {e}", path.display()))
                })?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Semantic validation, separate from parsing.
    pub fn validate(&self) -> Result<(), CompanionError> {
        let m = &self.modeller;
        let fail = |msg: String| Err(CompanionError::Validation(msg));
        if m.radar_width == 0 || m.radar_height == 0 {
            return fail("radarWidth and radarHeight must be positive".into());
        }
        if m.radar_grid <= 0.0 {
            return fail(format!("radarGrid must be positive, got {}", m.radar_grid));
        }
        if m.num_sectors == 0 {
            return fail("numSectors must be positive".into());
        }
        if m.decay <= 0 {
            return fail(format!("decay must be positive, got {}", m.decay));
        }
        if m.marker_decay <= 0.0 || m.marker_clean_decay <= 0.0 {
            return fail("markerDecay and markerCleanDecay must be positive".into());
        }
        if m.correlation_interval < 0 {
            return fail("correlationInterval must not be negative".into());
        }
        if self.spec.max_radar_distance <= 0.0 {
            return fail("maxRadarDistance must be positive".into());
        }
        if self.robot.backoff_min == 0 || self.robot.backoff_max < self.robot.backoff_min {
            return fail("backoffMin must be positive and at most backoffMax".into());
        }
        Ok(())
    }

    /// The robot specification described by this configuration.
    pub fn robot_spec(&self) -> RobotSpec {
        RobotSpec {
            max_radar_distance: self.spec.max_radar_distance,
            receptive_angle: Angle::from_deg(self.spec.receptive_angle),
            contact_radius: self.spec.contact_radius,
            camera_half_view: Angle::from_deg(self.spec.camera_half_view),
            marker_size: self.modeller.marker_size,
            camera_angular_ratio: self.spec.camera_angular_ratio,
            safe_distance: self.spec.safe_distance,
            supply_scale: self.spec.supply_scale,
        }
    }

    /// The world-modeller parameters described by this configuration.
    pub fn world_params(&self) -> WorldParams {
        let spec = self.robot_spec();
        let m = &self.modeller;
        WorldParams {
            radar_width: m.radar_width,
            radar_height: m.radar_height,
            radar_grid: m.radar_grid,
            radar: RadarParams {
                decay: m.decay,
                clean_interval: m.radar_clean_interval,
                echo_persistence: m.echo_persistence,
                contact_persistence: m.contact_persistence,
                max_radar_distance: spec.max_radar_distance,
                receptive_angle: spec.receptive_angle,
                contact_radius: spec.contact_radius,
                beam: m.beam,
            },
            num_sectors: m.num_sectors,
            min_radar_distance: m.min_radar_distance,
            marker: MarkerParams {
                correlation_interval: m.correlation_interval,
                location_decay: m.marker_decay,
                clean_decay: m.marker_clean_decay,
                marker_size: m.marker_size,
                min_number_events: m.min_number_events,
            },
            min_inference_interval: m.min_inference_interval,
            spec,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.modeller.decay, 300_000);
        assert_eq!(config.modeller.num_sectors, 24);
    }

    #[test]
    fn test_parse_camel_case_document() {
        let yaml = r#"
robot:
  host: 10.0.0.7
  port: 4040
modeller:
  radarWidth: 31
  radarHeight: 31
  radarGrid: 0.1
  numSectors: 36
  beam: arc
spec:
  maxRadarDistance: 2.5
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.robot.host, "10.0.0.7");
        assert_eq!(config.robot.port, 4040);
        assert_eq!(config.modeller.radar_width, 31);
        assert_eq!(config.modeller.num_sectors, 36);
        assert_eq!(config.modeller.beam, BeamModel::Arc);
        assert!((config.spec.max_radar_distance - 2.5).abs() < 1e-12);
        // Unset keys keep their defaults.
        assert_eq!(config.modeller.decay, 300_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let yaml = "modeller:\n  radarDepth: 3\n";
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }

    #[test]
    fn test_validation_failures() {
        let mut config = Config::default();
        config.modeller.num_sectors = 0;
        let err = config.validate().unwrap_err();
        assert_eq!(err.exit_code(), 3);

        let mut config = Config::default();
        config.modeller.radar_grid = -0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_world_params_carries_spec_values() {
        let mut config = Config::default();
        config.spec.max_radar_distance = 2.0;
        config.modeller.decay = 100_000;
        let params = config.world_params();
        assert!((params.radar.max_radar_distance - 2.0).abs() < 1e-12);
        assert_eq!(params.radar.decay, 100_000);
        assert!((params.marker.location_decay - 60_000.0).abs() < 1e-12);
    }
}
