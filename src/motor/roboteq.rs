// Roboteq ASCII command dialect and serial link
//
// Commands are plain text:
//   !G <motor> <value>    go (power or rpm, depending on MMOD)
//   !S <motor> <value>    speed/stop
//   ^<param> ...          runtime configuration
//   %<command>            maintenance
//   #...                  batch setup
// A standalone command is terminated by '\r', '_' separates commands sent in one batch.

use serialport::{self, SerialPort};
use std::io::{Read, Write};
use std::time::Duration;
use tracing::debug;

use super::kinematics::{DriveMode, DriveOutput, Motor};

/// Default serial configuration for Roboteq controllers
pub const DEFAULT_BAUDRATE: u32 = 115_200;
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Controller-side watchdog interval armed at startup
pub const WATCHDOG_MS: u32 = 1000;

const COMMAND_END: char = '\r';
const SEPARATOR: char = '_';

/// Saves the current configuration to the controller's EEPROM
const SAVE_CONFIG: &str = "%%clsav321654987";

/// Error types for the Roboteq link
#[derive(Debug, thiserror::Error)]
pub enum RoboteqError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation not allowed in engine state {state:?}")]
    InvalidState { state: super::driver::EngineState },
}

pub type Result<T> = std::result::Result<T, RoboteqError>;

/// Duplex byte channel to the controller
///
/// Not safe for concurrent use; the owner serializes every write and read.
pub trait ByteChannel: Send {
    fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Number of bytes that can be read without blocking
    fn available(&mut self) -> Result<usize>;

    fn read(&mut self, n: usize) -> Result<Vec<u8>>;

    fn flush(&mut self) -> Result<()>;
}

/// Serial port link to a Roboteq controller
pub struct SerialChannel {
    port: Box<dyn SerialPort>,
}

impl SerialChannel {
    /// Open a new connection to the controller
    pub fn open_with_baudrate(port_name: &str, baudrate: u32) -> Result<Self> {
        let port = serialport::new(port_name, baudrate)
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .open()?;

        Ok(Self { port })
    }
}

impl ByteChannel for SerialChannel {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.port.write_all(bytes)?;
        Ok(())
    }

    fn available(&mut self) -> Result<usize> {
        Ok(self.port.bytes_to_read()? as usize)
    }

    fn read(&mut self, n: usize) -> Result<Vec<u8>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; n];
        let read = self.port.read(&mut buf)?;
        buf.truncate(read);
        debug!("Read {} bytes from serial", read);
        Ok(buf)
    }

    fn flush(&mut self) -> Result<()> {
        self.port.flush()?;
        Ok(())
    }
}

// === Command encoding ===

/// `!G <motor> <value>` as a standalone command
pub fn go(motor: Motor, value: i32) -> String {
    format!("!G {} {}{}", motor.channel(), value, COMMAND_END)
}

/// `!S <motor> <value>` as a standalone command
pub fn speed(motor: Motor, value: i32) -> String {
    format!("!S {} {}{}", motor.channel(), value, COMMAND_END)
}

/// `^RWD <ms>`: the controller stops the motors when no command arrives in time
pub fn watchdog(timeout_ms: u32) -> String {
    format!("^RWD {}{}", timeout_ms, COMMAND_END)
}

/// `^MMOD <motor> <0|1>`
pub fn operating_mode(motor: Motor, mode: DriveMode) -> String {
    format!("^MMOD {} {}{}", motor.channel(), mode.mmod_value(), COMMAND_END)
}

/// Encode a converted velocity command
///
/// The driven motor is sent as a batched `_` command, the force-stopped motor as
/// a standalone `\r` command.
pub fn drive(output: &DriveOutput) -> String {
    match output {
        DriveOutput::Stop => Motor::ALL.iter().map(|&m| go(m, 0)).collect(),
        DriveOutput::Single(setpoint) => Motor::ALL
            .iter()
            .map(|&m| {
                if m == setpoint.motor {
                    format!("!G {} {}{}", m.channel(), setpoint.value, SEPARATOR)
                } else {
                    go(m, 0)
                }
            })
            .collect(),
    }
}

/// Significant digits of a float rendered on the wire
const FLOAT_PRECISION: usize = 6;

/// Render a float like printf's `%g`: 6 significant digits, trailing zeros removed,
/// exponent notation outside 1e-4..1e6
fn format_float(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value < 0.0 { "-inf" } else { "inf" }.to_string();
    }
    if value == 0.0 {
        return "0".to_string();
    }

    let sci = format!("{:.*e}", FLOAT_PRECISION - 1, value);
    let Some((mantissa, exp)) = sci.split_once('e') else {
        return sci;
    };
    let exp: i32 = exp.parse().unwrap_or(0);

    if (-4..FLOAT_PRECISION as i32).contains(&exp) {
        let decimals = (FLOAT_PRECISION as i32 - 1 - exp) as usize;
        trim_fraction(&format!("{:.*}", decimals, value)).to_string()
    } else {
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", trim_fraction(mantissa), sign, exp.abs())
    }
}

fn trim_fraction(text: &str) -> &str {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.')
    } else {
        text
    }
}

/// Raw power command: both values forwarded as given
pub fn power(left: f64, right: f64) -> String {
    format!(
        "!G {} {}{}!G {} {}{}",
        Motor::Left.channel(),
        format_float(left),
        SEPARATOR,
        Motor::Right.channel(),
        format_float(right),
        SEPARATOR
    )
}

/// `^<key> <channel> <value>_ %%clsav...`: set a parameter and persist it
pub fn config(key: &str, channel: i64, value: i64) -> String {
    format!("^{} {} {}{} {}", key, channel, value, SEPARATOR, SAVE_CONFIG)
}

/// `!<key> <channel> <value>_`: immediate runtime command, not persisted
pub fn command(key: &str, channel: i64, value: i64) -> String {
    format!("!{} {} {}{}", key, channel, value, SEPARATOR)
}

/// `%<input> _`: maintenance command, passed through verbatim
pub fn maintenance(input: &str) -> String {
    format!("%{} {}", input, SEPARATOR)
}
