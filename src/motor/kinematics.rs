// Differential-drive unit conversion for the Roboteq base
// Converts a body-frame velocity command (linear, angular) into a single motor setpoint.

/// Open-loop power scale for the left motor (power range is roughly -1000..1000)
const LEFT_POWER_SCALE: f64 = 80.0;
/// Open-loop power scale for the right motor
const RIGHT_POWER_SCALE: f64 = 500.0;

const SECONDS_PER_MINUTE: f64 = 60.0;

/// Controller operating mode, fixed for the lifetime of the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveMode {
    /// Motor driven by power level, no feedback
    OpenLoop,
    /// Motor driven by target RPM with the controller's internal feedback
    ClosedLoop,
}

impl DriveMode {
    pub fn from_closed_loop(closed_loop: bool) -> Self {
        if closed_loop {
            DriveMode::ClosedLoop
        } else {
            DriveMode::OpenLoop
        }
    }

    /// Value of the `^MMOD` operating-mode parameter
    pub fn mmod_value(self) -> u8 {
        match self {
            DriveMode::OpenLoop => 0,
            DriveMode::ClosedLoop => 1,
        }
    }
}

/// Controller motor channel
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Motor {
    Left = 1,
    Right = 2,
}

impl Motor {
    pub const ALL: [Motor; 2] = [Motor::Left, Motor::Right];

    pub fn channel(self) -> u8 {
        self as u8
    }
}

/// Power level (open loop) or target RPM (closed loop) for one motor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotorSetpoint {
    pub motor: Motor,
    pub value: i32,
}

/// Result of converting one velocity command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveOutput {
    /// Both motors commanded to zero
    Stop,
    /// One motor driven, the other force-stopped
    Single(MotorSetpoint),
}

/// Physical constants of the base. All of them must be > 0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriveGeometry {
    pub wheel_circumference: f64, // meters
    pub track_width: f64,         // meters
    pub max_rpm: f64,
    pub gear_reduction: f64,
}

/// Per-wheel values before the single-axis selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WheelSetpoints {
    pub left: i32,
    pub right: i32,
}

/// Converts velocity commands to motor setpoints for a fixed mode and geometry
#[derive(Debug, Clone, Copy)]
pub struct UnitConverter {
    mode: DriveMode,
    geometry: DriveGeometry,
}

impl UnitConverter {
    pub fn new(mode: DriveMode, geometry: DriveGeometry) -> Self {
        Self { mode, geometry }
    }

    pub fn mode(&self) -> DriveMode {
        self.mode
    }

    /// Wheel linear speeds (m/s) as `(left, right)`
    ///
    /// Speeds are held in single precision, which decides where the setpoints
    /// truncate (0.35 m/s at 1200 rpm per m/s gives 419, not 420).
    pub fn wheel_speeds(&self, linear: f64, angular: f64) -> (f64, f64) {
        let half_turn = self.geometry.track_width * angular / 2.0;
        let left = (linear - half_turn) as f32;
        let right = (linear + half_turn) as f32;
        (left as f64, right as f64)
    }

    /// Compute both wheel setpoints for the configured mode
    ///
    /// Values are truncated toward zero. In closed loop the right motor is mounted
    /// mirrored, so its RPM sign is inverted.
    pub fn wheel_setpoints(&self, linear: f64, angular: f64) -> WheelSetpoints {
        let (left_speed, right_speed) = self.wheel_speeds(linear, angular);
        let g = &self.geometry;

        match self.mode {
            DriveMode::OpenLoop => {
                let full_scale = g.wheel_circumference * g.max_rpm;
                WheelSetpoints {
                    left: (left_speed * LEFT_POWER_SCALE * SECONDS_PER_MINUTE / full_scale) as i32,
                    right: (right_speed * RIGHT_POWER_SCALE * SECONDS_PER_MINUTE / full_scale)
                        as i32,
                }
            }
            DriveMode::ClosedLoop => {
                let rpm = |speed: f64| {
                    g.gear_reduction * speed * SECONDS_PER_MINUTE / g.wheel_circumference
                };
                WheelSetpoints {
                    left: rpm(left_speed) as i32,
                    right: (-rpm(right_speed)) as i32,
                }
            }
        }
    }

    /// Convert a velocity command into a drive output
    ///
    /// Only one axis is actuated per command: a non-zero linear component drives
    /// the left motor only, otherwise a non-zero angular component drives the
    /// right motor only.
    pub fn convert(&self, linear: f64, angular: f64) -> DriveOutput {
        if linear == 0.0 && angular == 0.0 {
            return DriveOutput::Stop;
        }

        let wheels = self.wheel_setpoints(linear, angular);
        if linear != 0.0 {
            DriveOutput::Single(MotorSetpoint {
                motor: Motor::Left,
                value: wheels.left,
            })
        } else {
            DriveOutput::Single(MotorSetpoint {
                motor: Motor::Right,
                value: wheels.right,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> DriveGeometry {
        DriveGeometry {
            wheel_circumference: 0.5,
            track_width: 0.4,
            max_rpm: 3000.0,
            gear_reduction: 10.0,
        }
    }

    #[test]
    fn test_zero_velocity_is_stop_in_both_modes() {
        for mode in [DriveMode::OpenLoop, DriveMode::ClosedLoop] {
            let converter = UnitConverter::new(mode, geometry());
            assert_eq!(converter.convert(0.0, 0.0), DriveOutput::Stop);
        }
    }

    #[test]
    fn test_zero_velocity_is_stop_with_bad_geometry() {
        let bad = DriveGeometry {
            wheel_circumference: 0.0,
            track_width: -1.0,
            max_rpm: 0.0,
            gear_reduction: 0.0,
        };
        let converter = UnitConverter::new(DriveMode::ClosedLoop, bad);
        assert_eq!(converter.convert(0.0, 0.0), DriveOutput::Stop);
    }

    #[test]
    fn test_closed_loop_linear_drives_left_only() {
        let converter = UnitConverter::new(DriveMode::ClosedLoop, geometry());
        // 10 * 0.125 * 60 / 0.5 = 150 rpm
        let out = converter.convert(0.125, 0.0);
        assert_eq!(
            out,
            DriveOutput::Single(MotorSetpoint {
                motor: Motor::Left,
                value: 150
            })
        );
    }

    #[test]
    fn test_wheel_speed_truncates_in_single_precision() {
        let converter = UnitConverter::new(DriveMode::ClosedLoop, geometry());
        // 0.35 is 0.34999999 as f32: 10 * 0.34999999 * 60 / 0.5 = 419.99999
        assert_eq!(
            converter.convert(0.35, 0.0),
            DriveOutput::Single(MotorSetpoint {
                motor: Motor::Left,
                value: 419
            })
        );
    }

    #[test]
    fn test_closed_loop_angular_drives_right_only() {
        let converter = UnitConverter::new(DriveMode::ClosedLoop, geometry());
        // right speed = 0.4 * 1.0 / 2 = 0.2 m/s -> -(10 * 0.2 * 60 / 0.5) = -240
        let out = converter.convert(0.0, 1.0);
        assert_eq!(
            out,
            DriveOutput::Single(MotorSetpoint {
                motor: Motor::Right,
                value: -240
            })
        );
    }

    #[test]
    fn test_closed_loop_right_sign_is_mirrored() {
        for geometry in [
            geometry(),
            DriveGeometry {
                wheel_circumference: 1.3,
                track_width: 0.9,
                max_rpm: 100.0,
                gear_reduction: 3.5,
            },
        ] {
            let converter = UnitConverter::new(DriveMode::ClosedLoop, geometry);
            // Pure linear motion: both wheels see the same speed magnitude
            for linear in [0.3, -0.7, 2.0] {
                let wheels = converter.wheel_setpoints(linear, 0.0);
                assert_ne!(wheels.left, 0);
                assert_eq!(wheels.right, -wheels.left);
            }
        }
    }

    #[test]
    fn test_open_loop_uses_asymmetric_scales() {
        let converter = UnitConverter::new(DriveMode::OpenLoop, geometry());
        let wheels = converter.wheel_setpoints(1.0, 0.0);
        // 1.0 * 80 * 60 / (0.5 * 3000) = 3.2 -> 3
        assert_eq!(wheels.left, 3);
        // 1.0 * 500 * 60 / (0.5 * 3000) = 20
        assert_eq!(wheels.right, 20);
    }

    #[test]
    fn test_open_loop_angular_drives_right() {
        let converter = UnitConverter::new(DriveMode::OpenLoop, geometry());
        // right speed = 0.4 * 5 / 2 = 1.0 m/s -> 20
        let out = converter.convert(0.0, 5.0);
        assert_eq!(
            out,
            DriveOutput::Single(MotorSetpoint {
                motor: Motor::Right,
                value: 20
            })
        );
    }

    #[test]
    fn test_linear_wins_over_angular() {
        let converter = UnitConverter::new(DriveMode::ClosedLoop, geometry());
        match converter.convert(0.5, 1.0) {
            DriveOutput::Single(sp) => assert_eq!(sp.motor, Motor::Left),
            other => panic!("expected single setpoint, got {:?}", other),
        }
    }

    #[test]
    fn test_mode_values() {
        assert_eq!(DriveMode::from_closed_loop(true).mmod_value(), 1);
        assert_eq!(DriveMode::from_closed_loop(false).mmod_value(), 0);
    }
}
