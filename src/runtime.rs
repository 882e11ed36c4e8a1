// Driver loop: one task owns the controller link
// Velocity commands, service requests and the telemetry timer are multiplexed here,
// so every write and read on the serial link happens one at a time.

use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::interval;
use tracing::{error, info, warn};
use zenoh::query::Query;

use crate::config::{
    DriverConfig, SERVICE_COMMAND, SERVICE_CONFIG, SERVICE_MAINTENANCE, TOPIC_HEALTH, TOPIC_READ,
    TOPIC_TELEMETRY_PREFIX,
};
use crate::messages::{
    ChannelValues, GenericCommand, MaintenanceRequest, ServiceResponse, VelocityCommand,
};
use crate::motor::{ByteChannel, Poll, ProtocolEngine, RoboteqError, SerialChannel};

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Invalid request: {0}")]
    Request(#[from] serde_json::Error),

    #[error(transparent)]
    Link(#[from] RoboteqError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Config,
    Command,
    Maintenance,
}

pub struct Runtime<C: ByteChannel> {
    engine: ProtocolEngine<C>,
    diff_drive_mode: bool,
}

impl<C: ByteChannel> Runtime<C> {
    pub fn new(engine: ProtocolEngine<C>, diff_drive_mode: bool) -> Self {
        Self {
            engine,
            diff_drive_mode,
        }
    }

    pub fn engine(&self) -> &ProtocolEngine<C> {
        &self.engine
    }

    /// Process an incoming velocity (or raw power) command
    fn on_velocity(&mut self, payload: &[u8]) -> Result<String, HandlerError> {
        let cmd: VelocityCommand = serde_json::from_slice(payload)?;
        let sent = if self.diff_drive_mode {
            self.engine.send_velocity(cmd.linear, cmd.angular)?
        } else {
            self.engine.send_power(cmd.linear, cmd.angular)?
        };
        Ok(sent)
    }

    /// Process a service request
    fn on_service(&mut self, service: Service, payload: &[u8]) -> Result<ServiceResponse, HandlerError> {
        let result = match service {
            Service::Config => {
                let req: GenericCommand = serde_json::from_slice(payload)?;
                self.engine.send_config(&req.user_input, req.channel, req.value)?
            }
            Service::Command => {
                let req: GenericCommand = serde_json::from_slice(payload)?;
                self.engine.send_command(&req.user_input, req.channel, req.value)?
            }
            Service::Maintenance => {
                let req: MaintenanceRequest = serde_json::from_slice(payload)?;
                self.engine.maintenance(&req.user_input)?
            }
        };
        info!("{:?} service: {:?}", service, result);
        Ok(ServiceResponse { result })
    }

    /// Read and decode telemetry for one tick
    fn on_tick(&mut self) -> Result<Option<Poll>, RoboteqError> {
        self.engine.poll()
    }
}

/// Run a blocking serial exchange on the current worker without stalling the others
///
/// Needs the multi-thread runtime.
fn link_io<T>(f: impl FnOnce() -> T) -> T {
    tokio::task::block_in_place(f)
}

fn stamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn payload_of(query: &Query) -> Vec<u8> {
    query
        .payload()
        .map(|p| p.to_bytes().into_owned())
        .unwrap_or_default()
}

async fn answer(
    query: &Query,
    result: &Result<ServiceResponse, HandlerError>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    match result {
        Ok(response) => {
            let json = serde_json::to_string(response)?;
            query.reply(query.key_expr().clone(), json).await?;
        }
        Err(e) => {
            warn!("Service request failed: {}", e);
            query.reply_err(e.to_string()).await?;
        }
    }
    Ok(())
}

pub async fn run(config: DriverConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Improper constants are reported but do not stop the driver
    for e in config.validate() {
        error!("{}", e);
    }
    info!("In {:?} mode, serial port: {}", config.drive_mode(), config.serial_port);
    info!("cmd_vel: {}", config.cmd_vel_topic);

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    let mut engine: ProtocolEngine<SerialChannel> =
        ProtocolEngine::new(config.converter(), config.registry(), config.frequency);
    let (port, baudrate) = (config.serial_port.clone(), config.baudrate);
    engine.start(|| {
        let link = SerialChannel::open_with_baudrate(&port, baudrate)?;
        info!("Serial port {} initialized", port);
        Ok(link)
    })?;

    info!("Setting up publishers, subscribers and services...");
    let cmd_sub = session.declare_subscriber(config.cmd_vel_topic.clone()).await?;
    let config_service = session.declare_queryable(SERVICE_CONFIG).await?;
    let command_service = session.declare_queryable(SERVICE_COMMAND).await?;
    let maintenance_service = session.declare_queryable(SERVICE_MAINTENANCE).await?;

    let pub_read = session.declare_publisher(TOPIC_READ).await?;
    let pub_health = session.declare_publisher(TOPIC_HEALTH).await?;
    let mut pub_channels = Vec::with_capacity(engine.registry().len());
    for binding in engine.registry().bindings() {
        let topic = format!("{}/{}", TOPIC_TELEMETRY_PREFIX, binding.channel_name);
        info!("Publish topic: {}", topic);
        pub_channels.push(session.declare_publisher(topic).await?);
    }

    let mut runtime = Runtime::new(engine, config.diff_drive_mode);
    let mut tick = interval(Duration::from_millis(config.poll_period_ms()));

    info!(
        "Driver started: {}ms poll period, {} telemetry channels",
        config.poll_period_ms(),
        pub_channels.len()
    );

    // Every branch touches the serial link inline, so the engine needs no lock.
    // A read or write can block for up to the port timeout; `link_io` moves
    // that wait off the async worker so the zenoh session keeps running.
    loop {
        tokio::select! {
            _ = tick.tick() => {
                if let Some(poll) = link_io(|| runtime.on_tick())? {
                    pub_read.put(poll.raw).await?;
                    let stamp_ms = stamp_ms();
                    for record in poll.records {
                        let msg = ChannelValues { stamp_ms, value: record.values };
                        pub_channels[record.slot_index].put(serde_json::to_string(&msg)?).await?;
                    }
                }
                let health_json = serde_json::to_string(&runtime.engine().state())?;
                pub_health.put(health_json).await?;
            }
            sample = cmd_sub.recv_async() => {
                let sample = sample?;
                let payload = sample.payload().to_bytes();
                match link_io(|| runtime.on_velocity(&payload)) {
                    Ok(_) => {}
                    Err(HandlerError::Request(e)) => warn!("Failed to parse command: {}", e),
                    Err(HandlerError::Link(e)) => return Err(e.into()),
                }
            }
            query = config_service.recv_async() => {
                let query = query?;
                let payload = payload_of(&query);
                let result = link_io(|| runtime.on_service(Service::Config, &payload));
                answer(&query, &result).await?;
                if let Err(HandlerError::Link(e)) = result {
                    return Err(e.into());
                }
            }
            query = command_service.recv_async() => {
                let query = query?;
                let payload = payload_of(&query);
                let result = link_io(|| runtime.on_service(Service::Command, &payload));
                answer(&query, &result).await?;
                if let Err(HandlerError::Link(e)) = result {
                    return Err(e.into());
                }
            }
            query = maintenance_service.recv_async() => {
                let query = query?;
                let payload = payload_of(&query);
                let result = link_io(|| runtime.on_service(Service::Maintenance, &payload));
                answer(&query, &result).await?;
                if let Err(HandlerError::Link(e)) = result {
                    return Err(e.into());
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    Ok(())
}
