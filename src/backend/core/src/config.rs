//! Configuration management.
//!
//! The engine never reads global state: every tunable below is handed to the
//! component constructors explicitly. `Config::load` is only a convenience for
//! the binary, layering an optional file under `FLEETLOG__*` environment
//! variables.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{FleetError, Result};
use crate::state::EntityKind;
use crate::telemetry::LoggingConfig;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Engine tunables
    #[serde(default)]
    pub engine: EngineConfig,

    /// Durable storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Health staleness timeouts and sweep cadence
    #[serde(default)]
    pub health: HealthConfig,

    /// Per-subscriber delta buffer; overflow closes the subscription
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,

    /// Page size used when a query does not specify one
    #[serde(default = "default_page_size")]
    pub default_page_size: usize,

    /// Upper bound applied to caller-supplied page sizes
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            health: HealthConfig::default(),
            subscriber_buffer: default_subscriber_buffer(),
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
        }
    }
}

impl EngineConfig {
    /// Reject values that would make the engine misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.subscriber_buffer == 0 {
            return Err(FleetError::configuration("engine.subscriber_buffer must be at least 1"));
        }
        if self.default_page_size == 0 {
            return Err(FleetError::configuration("engine.default_page_size must be at least 1"));
        }
        if self.max_page_size < self.default_page_size {
            return Err(FleetError::configuration(
                "engine.max_page_size must not be smaller than engine.default_page_size",
            ));
        }
        self.health.validate()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Per entity type staleness timeouts
    #[serde(default)]
    pub timeouts: HealthTimeouts,

    /// How often the background sweep degrades stale entities
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            timeouts: HealthTimeouts::default(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

impl HealthConfig {
    fn validate(&self) -> Result<()> {
        if self.sweep_interval.is_zero() {
            return Err(FleetError::configuration("engine.health.sweep_interval must be non-zero"));
        }
        for kind in EntityKind::ALL {
            if self.timeouts.for_kind(kind).is_zero() {
                return Err(FleetError::configuration(format!(
                    "engine.health.timeouts.{} must be non-zero",
                    kind
                )));
            }
        }
        Ok(())
    }
}

/// Staleness timeout per entity type.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthTimeouts {
    #[serde(default = "default_robot_timeout", with = "humantime_serde")]
    pub robot: Duration,
    #[serde(default = "default_device_timeout", with = "humantime_serde")]
    pub door: Duration,
    #[serde(default = "default_device_timeout", with = "humantime_serde")]
    pub lift: Duration,
    #[serde(default = "default_device_timeout", with = "humantime_serde")]
    pub dispenser: Duration,
    #[serde(default = "default_device_timeout", with = "humantime_serde")]
    pub ingestor: Duration,
    #[serde(default = "default_fleet_timeout", with = "humantime_serde")]
    pub fleet: Duration,
}

impl Default for HealthTimeouts {
    fn default() -> Self {
        Self {
            robot: default_robot_timeout(),
            door: default_device_timeout(),
            lift: default_device_timeout(),
            dispenser: default_device_timeout(),
            ingestor: default_device_timeout(),
            fleet: default_fleet_timeout(),
        }
    }
}

impl HealthTimeouts {
    /// Same timeout for every entity type.
    pub fn uniform(timeout: Duration) -> Self {
        Self {
            robot: timeout,
            door: timeout,
            lift: timeout,
            dispenser: timeout,
            ingestor: timeout,
            fleet: timeout,
        }
    }

    pub fn for_kind(&self, kind: EntityKind) -> Duration {
        match kind {
            EntityKind::Robot => self.robot,
            EntityKind::Door => self.door,
            EntityKind::Lift => self.lift,
            EntityKind::Dispenser => self.dispenser,
            EntityKind::Ingestor => self.ingestor,
            EntityKind::Fleet => self.fleet,
        }
    }
}

/// Which durable backend to open.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process-local, lost on exit. Useful for tests and demos.
    #[default]
    Memory,
    /// sled database on local disk
    Sled,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// Directory for the sled database
    #[serde(default = "default_data_dir")]
    pub path: PathBuf,

    /// Flush sled after every write instead of relying on background flushing
    #[serde(default = "default_flush_on_write")]
    pub flush_on_write: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_data_dir(),
            flush_on_write: default_flush_on_write(),
        }
    }
}

// Default value functions
fn default_subscriber_buffer() -> usize { 256 }
fn default_page_size() -> usize { 50 }
fn default_max_page_size() -> usize { 500 }
fn default_sweep_interval() -> Duration { Duration::from_secs(1) }
fn default_robot_timeout() -> Duration { Duration::from_secs(10) }
fn default_device_timeout() -> Duration { Duration::from_secs(10) }
fn default_fleet_timeout() -> Duration { Duration::from_secs(30) }
fn default_data_dir() -> PathBuf { PathBuf::from("./data/fleetlog") }
fn default_flush_on_write() -> bool { true }

impl Config {
    /// Load configuration from environment variables only.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("FLEETLOG").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.engine.validate()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides on top.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("FLEETLOG").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.engine.validate()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.subscriber_buffer, 256);
        assert_eq!(config.default_page_size, 50);
        assert_eq!(config.health.timeouts.fleet, Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_buffer_rejected() {
        let config = EngineConfig {
            subscriber_buffer: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_page_bounds_rejected() {
        let config = EngineConfig {
            default_page_size: 100,
            max_page_size: 10,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_humantime_timeouts_deserialize() {
        let json = serde_json::json!({
            "timeouts": { "robot": "3s", "door": "500ms" },
            "sweep_interval": "250ms"
        });
        let health: HealthConfig = serde_json::from_value(json).unwrap();
        assert_eq!(health.timeouts.robot, Duration::from_secs(3));
        assert_eq!(health.timeouts.door, Duration::from_millis(500));
        assert_eq!(health.timeouts.lift, Duration::from_secs(10));
        assert_eq!(health.sweep_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_uniform_timeouts() {
        let timeouts = HealthTimeouts::uniform(Duration::from_secs(2));
        for kind in EntityKind::ALL {
            assert_eq!(timeouts.for_kind(kind), Duration::from_secs(2));
        }
    }
}
