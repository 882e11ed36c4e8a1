// Motor control module for a Roboteq dual-channel controller
//
// Provides:
// - Differential-drive unit conversion (velocity command -> motor setpoint)
// - Roboteq ASCII command encoding and the serial link
// - Telemetry query registration and frame decoding
// - Protocol engine tying them together

mod driver;
pub mod kinematics;
pub mod query;
pub mod roboteq;
pub mod telemetry;

pub use driver::{EngineState, Poll, ProtocolEngine};
pub use kinematics::{DriveGeometry, DriveMode, DriveOutput, Motor, MotorSetpoint, UnitConverter};
pub use query::{QueryBinding, QueryRegistry};
pub use roboteq::{ByteChannel, RoboteqError, SerialChannel};
pub use telemetry::{DecodeError, TelemetryDecoder, TelemetryRecord};
