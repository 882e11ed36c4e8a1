// Topics, driver parameters and telemetry query discovery
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::Path;

use crate::motor::{roboteq, DriveGeometry, DriveMode, QueryRegistry, UnitConverter};

// Zenoh topics
pub const TOPIC_READ: &str = "roboteq/read"; // raw telemetry
pub const TOPIC_HEALTH: &str = "roboteq/state/health"; // engine state
pub const TOPIC_TELEMETRY_PREFIX: &str = "roboteq/telemetry"; // one topic per query channel

// Services (zenoh queryables)
pub const SERVICE_CONFIG: &str = "roboteq/config_service";
pub const SERVICE_COMMAND: &str = "roboteq/command_service";
pub const SERVICE_MAINTENANCE: &str = "roboteq/maintenance_service";

/// Parameters whose name contains this marker declare a telemetry query
const QUERY_MARKER: &str = "query";
/// Channel name starts after "query" and one separator, e.g. "query.motor_amps"
const QUERY_NAME_OFFSET: usize = QUERY_MARKER.len() + 1;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Improper configuration! {name} needs to be greater than zero (got {value})")]
    NonPositive { name: &'static str, value: f64 },
}

fn default_serial_port() -> String {
    "dev/ttyACM0".to_string()
}

fn default_baudrate() -> u32 {
    roboteq::DEFAULT_BAUDRATE
}

fn default_true() -> bool {
    true
}

fn default_cmd_vel_topic() -> String {
    "cmd_vel".to_string()
}

/// Driver parameters, loaded from a JSON file
#[derive(Debug, Clone, Deserialize)]
pub struct DriverConfig {
    #[serde(default = "default_serial_port")]
    pub serial_port: String,
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    #[serde(default = "default_true")]
    pub closed_loop: bool,
    /// Convert velocity commands; when false, values are forwarded as raw power
    #[serde(default = "default_true")]
    pub diff_drive_mode: bool,
    #[serde(default)]
    pub wheel_circumference: f64,
    #[serde(default)]
    pub track_width: f64,
    #[serde(default)]
    pub max_rpm: f64,
    #[serde(default)]
    pub gear_reduction: f64,
    /// Telemetry rate in Hz
    #[serde(default)]
    pub frequency: i64,
    #[serde(default = "default_cmd_vel_topic")]
    pub cmd_vel_topic: String,
    /// Everything else, including the `query.*` entries
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            serial_port: default_serial_port(),
            baudrate: default_baudrate(),
            closed_loop: true,
            diff_drive_mode: true,
            wheel_circumference: 0.0,
            track_width: 0.0,
            max_rpm: 0.0,
            gear_reduction: 0.0,
            frequency: 0,
            cmd_vel_topic: default_cmd_vel_topic(),
            params: Map::new(),
        }
    }
}

impl DriverConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Every non-positive physical constant or frequency
    pub fn validate(&self) -> Vec<ConfigError> {
        [
            ("wheel_circumference", self.wheel_circumference),
            ("track_width", self.track_width),
            ("max_rpm", self.max_rpm),
            ("gear_reduction", self.gear_reduction),
            ("frequency", self.frequency as f64),
        ]
        .into_iter()
        .filter(|&(_, value)| !(value > 0.0))
        .map(|(name, value)| ConfigError::NonPositive { name, value })
        .collect()
    }

    pub fn drive_mode(&self) -> DriveMode {
        DriveMode::from_closed_loop(self.closed_loop)
    }

    pub fn geometry(&self) -> DriveGeometry {
        DriveGeometry {
            wheel_circumference: self.wheel_circumference,
            track_width: self.track_width,
            max_rpm: self.max_rpm,
            gear_reduction: self.gear_reduction,
        }
    }

    pub fn converter(&self) -> UnitConverter {
        UnitConverter::new(self.drive_mode(), self.geometry())
    }

    /// `(channel name, query)` pairs found among the extra parameters, in key order
    pub fn query_bindings(&self) -> Vec<(String, String)> {
        self.params
            .iter()
            .filter_map(|(key, value)| {
                let pos = key.find(QUERY_MARKER)?;
                let query = value.as_str()?;
                let name = key.get(pos + QUERY_NAME_OFFSET..)?;
                if name.is_empty() {
                    return None;
                }
                Some((name.to_string(), query.to_string()))
            })
            .collect()
    }

    pub fn registry(&self) -> QueryRegistry {
        QueryRegistry::new(self.query_bindings())
    }

    /// Poll period derived from the telemetry rate; a non-positive rate polls at 1 Hz
    pub fn poll_period_ms(&self) -> u64 {
        (1000 / self.frequency.max(1) as u64).max(1)
    }
}
