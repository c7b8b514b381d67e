//! Configuration loading and validation

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thermowire_bus::SimulatedDevice;
use thermowire_core::{Address, AddressParseError, BusId, DEFAULT_RESOLUTION};
use thermowire_discovery::{EngineConfig, DEFAULT_POLL_INTERVAL_MS};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Sensor {name} has an invalid address: {source}")]
    InvalidAddress {
        name: String,
        #[source]
        source: AddressParseError,
    },
    #[error("Bus {0} is listed more than once")]
    DuplicateBus(u8),
    #[error("Resolution must be between 9 and 12 bits, got {0}")]
    InvalidResolution(u8),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub engine: EngineSection,
    /// Buses to scan
    #[serde(default, rename = "bus")]
    pub buses: Vec<BusConfig>,
    /// Names to pre-assign to known addresses
    #[serde(default, rename = "sensor")]
    pub sensors: Vec<SensorConfig>,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Bind address for web server
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Probe and value refresh period in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub driver: DriverKind,
    /// Root of the kernel w1 device tree, for the sysfs driver
    #[serde(default)]
    pub sysfs_root: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            poll_interval_ms: default_poll_interval(),
            driver: DriverKind::default(),
            sysfs_root: None,
        }
    }
}

/// Which bus driver backs the engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// In-memory buses populated from `[[simulation.device]]`
    #[default]
    Simulated,
    /// Linux kernel w1 subsystem
    Sysfs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    /// Resolution written to newly attached sensors, in bits
    #[serde(default = "default_resolution")]
    pub default_resolution: u8,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            default_resolution: default_resolution(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    pub id: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    pub name: String,
    pub address: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default, rename = "device")]
    pub devices: Vec<SimulatedDevice>,
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_resolution() -> u8 {
    DEFAULT_RESOLUTION
}

impl Config {
    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            poll_interval_ms: self.daemon.poll_interval_ms,
            default_resolution: self.engine.default_resolution,
        }
    }

    pub fn bus_ids(&self) -> Vec<BusId> {
        self.buses.iter().map(|b| BusId(b.id)).collect()
    }

    /// Pre-assigned names with their parsed addresses
    pub fn named_sensors(&self) -> Result<Vec<(String, Address)>, ConfigError> {
        self.sensors
            .iter()
            .map(|sensor| {
                let address = sensor.address.parse().map_err(|source| {
                    ConfigError::InvalidAddress {
                        name: sensor.name.clone(),
                        source,
                    }
                })?;
                Ok((sensor.name.clone(), address))
            })
            .collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(9..=12).contains(&self.engine.default_resolution) {
            return Err(ConfigError::InvalidResolution(
                self.engine.default_resolution,
            ));
        }
        let mut seen = HashSet::new();
        for bus in &self.buses {
            if !seen.insert(bus.id) {
                return Err(ConfigError::DuplicateBus(bus.id));
            }
        }
        self.named_sensors()?;
        Ok(())
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    let config = if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        config
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Config::default()
    };
    config.validate()?;
    Ok(config)
}
