// Define message types crossing the zenoh boundary

use serde::{Deserialize, Serialize};

// Velocity command from teleop/navigation -> driver
// In power mode (diff_drive_mode = false) the two fields are raw motor 1 / motor 2 power
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct VelocityCommand {
    pub linear: f64,  // m/s
    pub angular: f64, // rad/s
}

/// Request for the config and command services
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenericCommand {
    pub user_input: String,
    pub channel: i64,
    pub value: i64,
}

/// Request for the maintenance service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MaintenanceRequest {
    pub user_input: String,
}

/// Reply of every service: the sent command, or the controller's answer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceResponse {
    pub result: String,
}

// Decoded telemetry for one query channel, published every successful poll
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelValues {
    pub stamp_ms: u64, // unix time
    pub value: Vec<i32>,
}
