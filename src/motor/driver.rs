// Protocol engine for a Roboteq dual-channel controller
//
// Combines unit conversion, command encoding and telemetry decoding on top of a
// single byte channel. The engine is not shared: whoever owns it serializes all
// access to the link.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::kinematics::{DriveOutput, Motor, UnitConverter};
use super::query::QueryRegistry;
use super::roboteq::{self, ByteChannel, Result, RoboteqError, WATCHDOG_MS};
use super::telemetry::{TelemetryDecoder, TelemetryRecord};

/// Lifecycle of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// Link not open or setup not sent yet
    Idle,
    /// Setup sent, commands and polling accepted
    Running,
    /// Link failed; terminal until the process restarts
    Faulted,
}

/// Result of one polling tick that found bytes on the link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Poll {
    /// Raw text as read, for diagnostics
    pub raw: String,
    /// One record per registered channel, or none if the read did not decode
    pub records: Vec<TelemetryRecord>,
}

pub struct ProtocolEngine<C: ByteChannel> {
    channel: Option<C>,
    state: EngineState,
    converter: UnitConverter,
    registry: QueryRegistry,
    decoder: TelemetryDecoder,
    frequency: i64,
}

impl<C: ByteChannel> ProtocolEngine<C> {
    pub fn new(converter: UnitConverter, registry: QueryRegistry, frequency: i64) -> Self {
        let decoder = TelemetryDecoder::new(registry.len());
        Self {
            channel: None,
            state: EngineState::Idle,
            converter,
            registry,
            decoder,
            frequency,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn registry(&self) -> &QueryRegistry {
        &self.registry
    }

    /// Open the link and send the startup sequence
    ///
    /// Stops both motors, arms the controller watchdog, sets the operating mode
    /// and installs the telemetry script. Any failure leaves the engine Faulted.
    pub fn start<F>(&mut self, open: F) -> Result<()>
    where
        F: FnOnce() -> Result<C>,
    {
        if self.state != EngineState::Idle {
            return Err(RoboteqError::InvalidState { state: self.state });
        }

        let channel = match open() {
            Ok(channel) => channel,
            Err(e) => {
                error!("Unable to open link: {}", e);
                self.state = EngineState::Faulted;
                return Err(e);
            }
        };
        self.channel = Some(channel);

        match self.send_setup() {
            Ok(()) => {
                self.state = EngineState::Running;
                info!("Controller initialized, {} telemetry channels", self.registry.len());
                Ok(())
            }
            Err(e) => self.fault(e),
        }
    }

    fn send_setup(&mut self) -> Result<()> {
        let mode = self.converter.mode();
        let channel = self.link()?;

        // Stop motors
        for motor in Motor::ALL {
            write_logged(channel, &roboteq::go(motor, 0))?;
        }
        for motor in Motor::ALL {
            write_logged(channel, &roboteq::speed(motor, 0))?;
        }
        channel.flush()?;

        write_logged(channel, &roboteq::watchdog(WATCHDOG_MS))?;
        for motor in Motor::ALL {
            write_logged(channel, &roboteq::operating_mode(motor, mode))?;
        }
        channel.flush()?;

        for binding in self.registry.bindings() {
            info!("Telemetry channel {}: {}", binding.channel_name, binding.query_code);
        }
        let setup = self.registry.setup_string(self.frequency);
        let channel = self.link()?;
        write_logged(channel, &setup)?;
        channel.flush()
    }

    fn link(&mut self) -> Result<&mut C> {
        let state = self.state;
        self.channel
            .as_mut()
            .ok_or(RoboteqError::InvalidState { state })
    }

    fn running_link(&mut self) -> Result<&mut C> {
        if self.state != EngineState::Running {
            return Err(RoboteqError::InvalidState { state: self.state });
        }
        self.link()
    }

    fn fault<T>(&mut self, e: RoboteqError) -> Result<T> {
        error!("Link failure, engine faulted: {}", e);
        self.state = EngineState::Faulted;
        Err(e)
    }

    /// Write one command and flush, faulting the engine on failure
    fn send(&mut self, cmd: &str) -> Result<()> {
        let result = self.running_link().and_then(|channel| {
            write_logged(channel, cmd)?;
            channel.flush()
        });
        match result {
            Err(e @ RoboteqError::InvalidState { .. }) => Err(e),
            Err(e) => self.fault(e),
            Ok(()) => Ok(()),
        }
    }

    /// Convert and send a velocity command; returns the encoded command
    pub fn send_velocity(&mut self, linear: f64, angular: f64) -> Result<String> {
        let output = self.converter.convert(linear, angular);
        match output {
            DriveOutput::Stop => info!("Stopping motors"),
            DriveOutput::Single(sp) => {
                let wheels = self.converter.wheel_setpoints(linear, angular);
                info!("left: {:9} right: {:9} -> motor {:?}", wheels.left, wheels.right, sp.motor);
            }
        }
        let cmd = roboteq::drive(&output);
        self.send(&cmd)?;
        Ok(cmd)
    }

    /// Forward raw power values to both motors; returns the encoded command
    pub fn send_power(&mut self, left: f64, right: f64) -> Result<String> {
        let cmd = roboteq::power(left, right);
        self.send(&cmd)?;
        info!("left: {:9.3} right: {:9.3}", left, right);
        Ok(cmd)
    }

    /// Set and persist a controller parameter; returns the encoded command
    pub fn send_config(&mut self, key: &str, channel: i64, value: i64) -> Result<String> {
        let cmd = roboteq::config(key, channel, value);
        self.send(&cmd)?;
        Ok(cmd)
    }

    /// Send an immediate runtime command; returns the encoded command
    pub fn send_command(&mut self, key: &str, channel: i64, value: i64) -> Result<String> {
        let cmd = roboteq::command(key, channel, value);
        self.send(&cmd)?;
        Ok(cmd)
    }

    /// Send a maintenance command and return whatever the controller has
    /// buffered right after the write
    pub fn maintenance(&mut self, input: &str) -> Result<String> {
        let cmd = roboteq::maintenance(input);
        self.send(&cmd)?;

        let result = self.running_link().and_then(|channel| {
            let n = channel.available()?;
            channel.read(n)
        });
        match result {
            Ok(bytes) => {
                let answer = String::from_utf8_lossy(&bytes).into_owned();
                info!("Maintenance answer: {:?}", answer);
                Ok(answer)
            }
            Err(e) => self.fault(e),
        }
    }

    /// Read whatever telemetry is buffered and decode it
    ///
    /// Returns `Ok(None)` when nothing is available. A read that does not decode
    /// is logged and yields an empty record list.
    pub fn poll(&mut self) -> Result<Option<Poll>> {
        let result = self.running_link().and_then(|channel| {
            let n = channel.available()?;
            if n == 0 {
                return Ok(Vec::new());
            }
            channel.read(n)
        });
        let bytes = match result {
            Ok(bytes) => bytes,
            Err(e @ RoboteqError::InvalidState { .. }) => return Err(e),
            Err(e) => return self.fault(e),
        };

        if bytes.is_empty() {
            debug!("No telemetry available");
            return Ok(None);
        }

        let records = self.decoder.decode_or_log(&bytes);
        Ok(Some(Poll {
            raw: String::from_utf8_lossy(&bytes).into_owned(),
            records,
        }))
    }
}

fn write_logged<C: ByteChannel>(channel: &mut C, cmd: &str) -> Result<()> {
    info!("Writing to serial: {:?}", cmd);
    channel.write(cmd.as_bytes())
}

impl<C: ByteChannel> Drop for ProtocolEngine<C> {
    fn drop(&mut self) {
        // Try to stop motors when the engine goes away (safety measure)
        if self.state == EngineState::Running {
            if let Err(e) = self.send(&roboteq::drive(&DriveOutput::Stop)) {
                warn!("Failed to stop motors on drop: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::kinematics::{DriveGeometry, DriveMode};
    use crate::motor::roboteq::mock::MockChannel;
    use std::io;

    fn engine(mode: DriveMode) -> ProtocolEngine<MockChannel> {
        let converter = UnitConverter::new(
            mode,
            DriveGeometry {
                wheel_circumference: 0.5,
                track_width: 0.4,
                max_rpm: 3000.0,
                gear_reduction: 10.0,
            },
        );
        let registry = QueryRegistry::new([("amps", "?A"), ("rpm", "?S")]);
        ProtocolEngine::new(converter, registry, 10)
    }

    fn started(mode: DriveMode) -> (ProtocolEngine<MockChannel>, MockChannel) {
        let mock = MockChannel::default();
        let mut engine = engine(mode);
        let link = mock.clone();
        engine.start(move || Ok(link)).unwrap();
        mock.clear();
        (engine, mock)
    }

    #[test]
    fn test_startup_sequence() {
        let mock = MockChannel::default();
        let mut engine = engine(DriveMode::ClosedLoop);
        assert_eq!(engine.state(), EngineState::Idle);

        let link = mock.clone();
        engine.start(move || Ok(link)).unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        assert_eq!(
            mock.written(),
            "!G 1 0\r!G 2 0\r!S 1 0\r!S 2 0\r\
             ^RWD 1000\r^MMOD 1 1\r^MMOD 2 1\r\
             ^echof 1_#c_\"DH?\",\"?\"?A_?S_# 10_"
        );
    }

    #[test]
    fn test_open_loop_mode_command() {
        let mock = MockChannel::default();
        let mut engine = engine(DriveMode::OpenLoop);
        let link = mock.clone();
        engine.start(move || Ok(link)).unwrap();
        assert!(mock.written().contains("^MMOD 1 0\r^MMOD 2 0\r"));
    }

    #[test]
    fn test_open_failure_faults() {
        let mut engine = engine(DriveMode::ClosedLoop);
        let result = engine.start(|| {
            Err(io::Error::new(io::ErrorKind::NotFound, "no such port").into())
        });
        assert!(result.is_err());
        assert_eq!(engine.state(), EngineState::Faulted);
        assert!(matches!(
            engine.send_velocity(1.0, 0.0),
            Err(RoboteqError::InvalidState {
                state: EngineState::Faulted
            })
        ));
    }

    #[test]
    fn test_setup_write_failure_faults() {
        let mock = MockChannel::default();
        mock.fail_writes();
        let mut engine = engine(DriveMode::ClosedLoop);
        let link = mock.clone();
        assert!(engine.start(move || Ok(link)).is_err());
        assert_eq!(engine.state(), EngineState::Faulted);
    }

    #[test]
    fn test_commands_rejected_before_start() {
        let mut engine = engine(DriveMode::ClosedLoop);
        assert!(matches!(
            engine.send_command("G", 1, 10),
            Err(RoboteqError::InvalidState {
                state: EngineState::Idle
            })
        ));
        assert!(engine.poll().is_err());
    }

    #[test]
    fn test_velocity_commands() {
        let (mut engine, mock) = started(DriveMode::ClosedLoop);

        assert_eq!(engine.send_velocity(0.125, 0.0).unwrap(), "!G 1 150_!G 2 0\r");
        assert_eq!(engine.send_velocity(0.0, 0.0).unwrap(), "!G 1 0\r!G 2 0\r");
        assert_eq!(
            mock.written(),
            "!G 1 150_!G 2 0\r!G 1 0\r!G 2 0\r"
        );
    }

    #[test]
    fn test_write_failure_faults_engine() {
        let (mut engine, mock) = started(DriveMode::ClosedLoop);
        mock.fail_writes();
        assert!(matches!(
            engine.send_velocity(0.1, 0.0),
            Err(RoboteqError::Io(_))
        ));
        assert_eq!(engine.state(), EngineState::Faulted);
    }

    #[test]
    fn test_generic_commands() {
        let (mut engine, mock) = started(DriveMode::ClosedLoop);
        assert_eq!(
            engine.send_config("MXRPM", 1, 3000).unwrap(),
            "^MXRPM 1 3000_ %%clsav321654987"
        );
        assert_eq!(engine.send_power(0.5, -0.25).unwrap(), "!G 1 0.5_!G 2 -0.25_");
        assert_eq!(engine.send_command("S", 2, 100).unwrap(), "!S 2 100_");
        assert_eq!(
            mock.written(),
            "^MXRPM 1 3000_ %%clsav321654987!G 1 0.5_!G 2 -0.25_!S 2 100_"
        );
    }

    #[test]
    fn test_maintenance_returns_buffered_answer() {
        let (mut engine, mock) = started(DriveMode::ClosedLoop);
        mock.push_inbound(b"+\r");
        assert_eq!(engine.maintenance("EESAV").unwrap(), "+\r");
        assert_eq!(mock.written(), "%EESAV _");
    }

    #[test]
    fn test_maintenance_read_failure_faults_engine() {
        let (mut engine, mock) = started(DriveMode::ClosedLoop);
        mock.fail_reads();
        assert!(matches!(
            engine.maintenance("EESAV"),
            Err(RoboteqError::Io(_))
        ));
        // The command itself went out before the read failed
        assert_eq!(mock.written(), "%EESAV _");
        assert_eq!(engine.state(), EngineState::Faulted);
    }

    #[test]
    fn test_poll_read_failure_faults_engine() {
        let (mut engine, mock) = started(DriveMode::ClosedLoop);
        mock.push_inbound(b"DH?1?2");
        mock.fail_reads();
        assert!(matches!(engine.poll(), Err(RoboteqError::Io(_))));
        assert_eq!(engine.state(), EngineState::Faulted);
        assert!(matches!(
            engine.poll(),
            Err(RoboteqError::InvalidState {
                state: EngineState::Faulted
            })
        ));
    }

    #[test]
    fn test_poll_empty_is_noop() {
        let (mut engine, _mock) = started(DriveMode::ClosedLoop);
        assert_eq!(engine.poll().unwrap(), None);
    }

    #[test]
    fn test_poll_decodes_channels() {
        let (mut engine, mock) = started(DriveMode::ClosedLoop);
        mock.push_inbound(b"DH?10:20?30:40?99");

        let poll = engine.poll().unwrap().unwrap();
        assert_eq!(poll.raw, "DH?10:20?30:40?99");
        assert_eq!(
            poll.records,
            vec![
                TelemetryRecord {
                    slot_index: 0,
                    values: vec![10, 20]
                },
                TelemetryRecord {
                    slot_index: 1,
                    values: vec![30, 40]
                },
            ]
        );
    }

    #[test]
    fn test_poll_malformed_keeps_running() {
        let (mut engine, mock) = started(DriveMode::ClosedLoop);
        mock.push_inbound(b"garbage");

        let poll = engine.poll().unwrap().unwrap();
        assert!(poll.records.is_empty());
        assert_eq!(engine.state(), EngineState::Running);
    }

    #[test]
    fn test_drop_stops_motors() {
        let (engine, mock) = started(DriveMode::ClosedLoop);
        drop(engine);
        assert_eq!(mock.written(), "!G 1 0\r!G 2 0\r");
    }
}
