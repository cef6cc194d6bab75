//! JSON-line controller over TCP.
//!
//! Commands use one socket. Sample streaming uses a second socket on
//! `port + 1`, so a busy stream never delays command replies.

use crate::codec::json_line::{
    pid_from_value, profile_from_value, sample_from_line, sample_from_value, JsonReply,
    JsonRequest,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tendon_core::capabilities::CORE_CAPABILITIES;
use tendon_core::serial::read_line_bounded;
use tendon_core::{
    Capability, CommandGate, Device, DeviceError, DeviceResult, LimitType, MotionProfile,
    PidGains, PlatformInfo, SampleFeed, SensorSample, TransportKind,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

const BACKEND: &str = "json-line";

/// Buffered samples between the stream socket reader and the streaming engine.
const FEED_CAPACITY: usize = 256;

type Connection = BufReader<TcpStream>;

/// JSON-line backend.
pub struct JsonTcpBackend {
    host: String,
    port: u16,
    timeout: Duration,
    conn: CommandGate<Option<Connection>>,
    connected: AtomicBool,
    info: parking_lot::Mutex<PlatformInfo>,
    feed: Mutex<Option<JoinHandle<()>>>,
}

impl JsonTcpBackend {
    /// Backend for the controller at `host:port`.
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        let mut capabilities = CORE_CAPABILITIES.to_vec();
        capabilities.push(Capability::PushStreaming);
        Self {
            host: host.into(),
            port,
            timeout,
            conn: CommandGate::new(None),
            connected: AtomicBool::new(false),
            info: parking_lot::Mutex::new(PlatformInfo {
                name: "JSON-line controller".into(),
                transport: TransportKind::JsonLine,
                protocol_version: "unknown".into(),
                capabilities,
            }),
            feed: Mutex::new(None),
        }
    }

    async fn exchange(
        conn: &mut Option<Connection>,
        request: &JsonRequest,
        timeout: Duration,
    ) -> DeviceResult<Value> {
        let conn = conn.as_mut().ok_or(DeviceError::NotConnected)?;
        let line = request.encode()?;
        debug!(request = line.trim_end(), "json tx");
        conn.get_mut().write_all(line.as_bytes()).await?;

        let reply = read_line_bounded(conn, timeout, &request.cmd).await?;
        debug!(reply = %reply, "json rx");
        JsonReply::decode(&reply)?.into_data(&request.cmd)
    }

    #[instrument(skip(self, request), fields(cmd = %request.cmd), err)]
    async fn send(&self, request: JsonRequest) -> DeviceResult<Value> {
        self.ensure_connected()?;
        let mut conn = self.conn.regular().await;
        Self::exchange(&mut conn, &request, self.timeout).await
    }

    async fn command(&self, request: JsonRequest) -> DeviceResult<()> {
        self.send(request).await.map(drop)
    }

    fn ensure_connected(&self) -> DeviceResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DeviceError::NotConnected)
        }
    }

    async fn open_socket(&self, port: u16) -> DeviceResult<TcpStream> {
        let addr = format!("{}:{}", self.host, port);
        tokio::time::timeout(self.timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| DeviceError::connection(BACKEND, format!("connect to {addr} timed out")))?
            .map_err(|e| DeviceError::connection(BACKEND, format!("connect to {addr}: {e}")))
    }

    fn refresh_info(&self, data: &Value) {
        let mut info = self.info.lock();
        if let Some(name) = data.get("name").and_then(Value::as_str) {
            info.name = name.to_string();
        }
        if let Some(version) = data.get("firmware_version").and_then(Value::as_str) {
            info.protocol_version = version.to_string();
        }
    }

    async fn stop_reader(&self) {
        if let Some(task) = self.feed.lock().await.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

#[async_trait]
impl Device for JsonTcpBackend {
    fn platform_info(&self) -> PlatformInfo {
        self.info.lock().clone()
    }

    async fn connect(&self) -> DeviceResult<()> {
        let stream = self.open_socket(self.port).await?;
        let mut conn = self.conn.regular().await;
        *conn = Some(BufReader::new(stream));

        if let Err(e) = Self::exchange(&mut conn, &JsonRequest::bare("PING"), self.timeout).await {
            *conn = None;
            return Err(DeviceError::connection(BACKEND, format!("ping failed: {e}")));
        }
        match Self::exchange(&mut conn, &JsonRequest::bare("GET_INFO"), self.timeout).await {
            Ok(data) => self.refresh_info(&data),
            Err(e) => debug!(error = %e, "GET_INFO unavailable"),
        }

        self.connected.store(true, Ordering::SeqCst);
        info!(host = %self.host, port = self.port, "JSON-line controller connected");
        Ok(())
    }

    async fn disconnect(&self) -> DeviceResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.close_feed().await {
            warn!(error = %e, "Stream shutdown failed");
        }
        self.connected.store(false, Ordering::SeqCst);
        let mut conn = self.conn.regular().await;
        if let Some(mut c) = conn.take() {
            if let Err(e) = c.get_mut().shutdown().await {
                warn!(error = %e, "Command socket shutdown failed");
            }
        }
        info!(host = %self.host, "JSON-line controller disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn enable(&self) -> DeviceResult<()> {
        self.command(JsonRequest::bare("ENABLE")).await
    }

    async fn disable(&self) -> DeviceResult<()> {
        self.command(JsonRequest::bare("DISABLE")).await
    }

    async fn emergency_stop(&self) -> DeviceResult<()> {
        self.ensure_connected()?;
        let mut conn = self.conn.priority().await;
        Self::exchange(&mut conn, &JsonRequest::bare("ESTOP"), self.timeout).await?;
        warn!("Emergency stop sent");
        Ok(())
    }

    async fn set_position(&self, counts: i32) -> DeviceResult<()> {
        self.command(JsonRequest::setpoint("SET_POSITION", counts)).await
    }

    async fn set_velocity(&self, rpm: i32) -> DeviceResult<()> {
        self.command(JsonRequest::setpoint("SET_VELOCITY", rpm)).await
    }

    async fn set_torque(&self, mnm: i32) -> DeviceResult<()> {
        self.command(JsonRequest::setpoint("SET_TORQUE", mnm)).await
    }

    async fn set_current(&self, ma: i32) -> DeviceResult<()> {
        self.command(JsonRequest::setpoint("SET_CURRENT", ma)).await
    }

    async fn get_sensors(&self) -> DeviceResult<SensorSample> {
        sample_from_value(self.send(JsonRequest::bare("GET_SENSORS")).await?)
    }

    async fn set_pid_params(&self, gains: PidGains) -> DeviceResult<()> {
        self.command(JsonRequest::set_pid(gains)).await
    }

    async fn get_pid_params(&self) -> DeviceResult<PidGains> {
        pid_from_value(self.send(JsonRequest::bare("GET_PID")).await?)
    }

    async fn set_motion_profile(&self, profile: MotionProfile) -> DeviceResult<()> {
        self.command(JsonRequest::set_profile(profile)).await
    }

    async fn get_motion_profile(&self) -> DeviceResult<MotionProfile> {
        profile_from_value(self.send(JsonRequest::bare("GET_PROFILE")).await?)
    }

    async fn set_limit(&self, limit: LimitType, value: i32) -> DeviceResult<()> {
        self.command(JsonRequest::set_limit(limit, value)).await
    }

    async fn zero_sensors(&self) -> DeviceResult<()> {
        self.command(JsonRequest::bare("ZERO_SENSORS")).await
    }

    async fn open_feed(&self, rate_hz: f64) -> DeviceResult<Option<SampleFeed>> {
        self.ensure_connected()?;
        self.stop_reader().await;

        let socket = self.open_socket(self.port.saturating_add(1)).await?;
        self.command(JsonRequest::with("START_STREAM", json!({ "rate": rate_hz })))
            .await?;

        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        let task = tokio::spawn(async move {
            let mut lines = BufReader::new(socket).lines();
            loop {
                let item = match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => sample_from_line(&line),
                    Ok(None) => break,
                    Err(e) => Err(DeviceError::from(e)),
                };
                let fatal = matches!(item, Err(DeviceError::Io(_)));
                if tx.send(item).await.is_err() || fatal {
                    break;
                }
            }
            debug!("Stream socket reader exited");
        });
        *self.feed.lock().await = Some(task);
        info!(rate_hz, "Controller stream started");
        Ok(Some(rx))
    }

    async fn close_feed(&self) -> DeviceResult<()> {
        let running = self.feed.lock().await.is_some();
        if !running {
            return Ok(());
        }
        let stopped = self.command(JsonRequest::bare("STOP_STREAM")).await;
        self.stop_reader().await;
        stopped
    }
}
