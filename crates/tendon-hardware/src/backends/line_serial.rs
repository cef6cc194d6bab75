//! Line-protocol controller on a serial port.

use crate::codec::line::{
    parse_pid, parse_profile, parse_reply, parse_sensor_fields, LineCommand, LineReply, PONG,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tendon_core::capabilities::CORE_CAPABILITIES;
use tendon_core::serial::{drain_serial_buffer, open_serial, read_line_bounded, DynSerial, LinePort};
use tendon_core::{
    CommandGate, Device, DeviceError, DeviceResult, LimitType, MotionProfile, PidGains,
    PlatformInfo, SensorSample, TransportKind,
};
use tokio::io::{AsyncWriteExt, BufReader};
use tracing::{debug, info, instrument, warn};

const BACKEND: &str = "line-serial";

/// Wait after opening the port before the first command.
pub const POST_OPEN_SETTLE: Duration = Duration::from_millis(500);

/// Line-protocol backend.
///
/// All traffic goes through a [`CommandGate`], so an emergency stop is written
/// as soon as the in-flight transaction completes.
pub struct LineSerialBackend {
    path: String,
    baud: u32,
    timeout: Duration,
    port: CommandGate<Option<LinePort>>,
    connected: AtomicBool,
}

impl LineSerialBackend {
    /// Backend that opens `path` at `baud` on connect.
    pub fn new(path: impl Into<String>, baud: u32, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            baud,
            timeout,
            port: CommandGate::new(None),
            connected: AtomicBool::new(false),
        }
    }

    /// Backend over an already-open stream. `connect` skips opening and goes
    /// straight to the liveness check.
    pub fn with_port(port: DynSerial, timeout: Duration) -> Self {
        Self {
            path: String::new(),
            baud: 0,
            timeout,
            port: CommandGate::new(Some(BufReader::new(port))),
            connected: AtomicBool::new(false),
        }
    }

    async fn exchange(
        port: &mut Option<LinePort>,
        command: LineCommand,
        timeout: Duration,
    ) -> DeviceResult<LineReply> {
        let port = port.as_mut().ok_or(DeviceError::NotConnected)?;
        let stale = drain_serial_buffer(port, Duration::ZERO).await;
        if stale > 0 {
            debug!(bytes = stale, "Discarded stale input");
        }

        let line = command.encode();
        debug!(command = line.trim_end(), "line tx");
        port.get_mut().write_all(line.as_bytes()).await?;
        port.get_mut().flush().await?;

        let reply = read_line_bounded(port, timeout, command.verb()).await?;
        debug!(reply = %reply, "line rx");
        parse_reply(&reply)
    }

    #[instrument(skip(self), fields(verb = command.verb()), err)]
    async fn transaction(&self, command: LineCommand) -> DeviceResult<LineReply> {
        self.ensure_connected()?;
        let mut port = self.port.regular().await;
        Self::exchange(&mut port, command, self.timeout).await
    }

    /// Run `command` and require an `ACK`, returning its payload tokens.
    async fn acknowledged(&self, command: LineCommand) -> DeviceResult<Vec<String>> {
        expect_ack(command, self.transaction(command).await?)
    }

    fn ensure_connected(&self) -> DeviceResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DeviceError::NotConnected)
        }
    }
}

fn expect_ack(command: LineCommand, reply: LineReply) -> DeviceResult<Vec<String>> {
    match reply {
        LineReply::Ack(tokens) => Ok(tokens),
        LineReply::Nack(reason) => Err(DeviceError::rejected(command.verb(), reason)),
        LineReply::Data(_) => Err(DeviceError::Decode(format!(
            "unexpected DATA reply to {}",
            command.verb()
        ))),
    }
}

#[async_trait]
impl Device for LineSerialBackend {
    fn platform_info(&self) -> PlatformInfo {
        PlatformInfo {
            name: "Line-protocol controller".into(),
            transport: TransportKind::LineSerial,
            protocol_version: "1.0".into(),
            capabilities: CORE_CAPABILITIES.to_vec(),
        }
    }

    async fn connect(&self) -> DeviceResult<()> {
        let mut port = self.port.regular().await;
        if port.is_none() {
            let opened = open_serial(&self.path, self.baud, BACKEND).await?;
            tokio::time::sleep(POST_OPEN_SETTLE).await;
            let mut reader = BufReader::new(opened);
            drain_serial_buffer(&mut reader, Duration::from_millis(50)).await;
            *port = Some(reader);
        }

        let reply = Self::exchange(&mut port, LineCommand::Ping, self.timeout)
            .await
            .map_err(|e| DeviceError::connection(BACKEND, format!("ping failed: {e}")))?;
        match reply {
            LineReply::Ack(tokens) if tokens.first().map(String::as_str) == Some(PONG) => {
                self.connected.store(true, Ordering::SeqCst);
                info!(path = %self.path, baud = self.baud, "Line controller connected");
                Ok(())
            }
            other => {
                *port = None;
                Err(DeviceError::connection(
                    BACKEND,
                    format!("unexpected ping reply {other:?}"),
                ))
            }
        }
    }

    async fn disconnect(&self) -> DeviceResult<()> {
        if self.connected.swap(false, Ordering::SeqCst) {
            let mut port = self.port.regular().await;
            if let Some(mut p) = port.take() {
                if let Err(e) = p.get_mut().shutdown().await {
                    warn!(error = %e, "Serial shutdown failed");
                }
            }
            info!(path = %self.path, "Line controller disconnected");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn enable(&self) -> DeviceResult<()> {
        self.acknowledged(LineCommand::Enable).await.map(drop)
    }

    async fn disable(&self) -> DeviceResult<()> {
        self.acknowledged(LineCommand::Disable).await.map(drop)
    }

    async fn emergency_stop(&self) -> DeviceResult<()> {
        self.ensure_connected()?;
        let mut port = self.port.priority().await;
        let reply = Self::exchange(&mut port, LineCommand::EmergencyStop, self.timeout).await?;
        warn!("Emergency stop sent");
        expect_ack(LineCommand::EmergencyStop, reply).map(drop)
    }

    async fn set_position(&self, counts: i32) -> DeviceResult<()> {
        self.acknowledged(LineCommand::SetPosition(counts)).await.map(drop)
    }

    async fn set_velocity(&self, rpm: i32) -> DeviceResult<()> {
        self.acknowledged(LineCommand::SetVelocity(rpm)).await.map(drop)
    }

    async fn set_torque(&self, mnm: i32) -> DeviceResult<()> {
        self.acknowledged(LineCommand::SetTorque(mnm)).await.map(drop)
    }

    async fn set_current(&self, ma: i32) -> DeviceResult<()> {
        self.acknowledged(LineCommand::SetCurrent(ma)).await.map(drop)
    }

    async fn get_sensors(&self) -> DeviceResult<SensorSample> {
        match self.transaction(LineCommand::GetSensors).await? {
            LineReply::Data(tokens) => parse_sensor_fields(&tokens),
            LineReply::Nack(reason) => Err(DeviceError::rejected("GETSENSORS", reason)),
            LineReply::Ack(_) => Err(DeviceError::Decode("expected DATA reply".into())),
        }
    }

    async fn set_pid_params(&self, gains: PidGains) -> DeviceResult<()> {
        self.acknowledged(LineCommand::SetPid(gains)).await.map(drop)
    }

    async fn get_pid_params(&self) -> DeviceResult<PidGains> {
        parse_pid(&self.acknowledged(LineCommand::GetPid).await?)
    }

    async fn set_motion_profile(&self, profile: MotionProfile) -> DeviceResult<()> {
        self.acknowledged(LineCommand::SetProfile(profile))
            .await
            .map(drop)
    }

    async fn get_motion_profile(&self) -> DeviceResult<MotionProfile> {
        parse_profile(&self.acknowledged(LineCommand::GetProfile).await?)
    }

    async fn set_limit(&self, limit: LimitType, value: i32) -> DeviceResult<()> {
        self.acknowledged(LineCommand::SetLimit(limit, value))
            .await
            .map(drop)
    }

    async fn zero_sensors(&self) -> DeviceResult<()> {
        self.acknowledged(LineCommand::Zero).await.map(drop)
    }
}
