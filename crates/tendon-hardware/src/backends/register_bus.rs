//! Register-mapped controller behind a serial bus bridge.

use crate::codec::register::{
    decode_pid, decode_profile, decode_sensor_block, encode_pid, encode_profile, limit_register,
    RegisterCodec, RegisterReply, CTRL_DISABLE, CTRL_ENABLE, CTRL_ESTOP, CTRL_ZERO_SENSORS,
    REG_CONTROL, REG_CURRENT_CMD, REG_PID, REG_POSITION_CMD, REG_PROFILE, REG_SENSORS, REG_STATUS,
    REG_TORQUE_CMD, REG_VELOCITY_CMD, SENSOR_BLOCK_LEN,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tendon_core::capabilities::CORE_CAPABILITIES;
use tendon_core::serial::{drain_serial_buffer, open_serial, DynSerial};
use tendon_core::{
    CalibrationSet, CommandGate, Device, DeviceError, DeviceResult, LimitType, MotionProfile,
    PidGains, PlatformInfo, SensorSample, TransportKind,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, instrument, warn};

const BACKEND: &str = "register-bus";

/// Bridge link speed.
pub const BRIDGE_BAUD: u32 = 115_200;

/// Register-protocol backend.
pub struct RegisterBusBackend {
    bus: String,
    codec: RegisterCodec,
    timeout: Duration,
    port: CommandGate<Option<DynSerial>>,
    connected: AtomicBool,
    calibration: RwLock<CalibrationSet>,
}

impl RegisterBusBackend {
    /// Backend for the device at `address` behind the bridge at `bus`.
    pub fn new(bus: impl Into<String>, address: u8, timeout: Duration) -> Self {
        Self {
            bus: bus.into(),
            codec: RegisterCodec::new(address),
            timeout,
            port: CommandGate::new(None),
            connected: AtomicBool::new(false),
            calibration: RwLock::new(CalibrationSet::new()),
        }
    }

    /// Backend over an already-open bridge stream.
    pub fn with_port(port: DynSerial, address: u8, timeout: Duration) -> Self {
        Self {
            port: CommandGate::new(Some(port)),
            ..Self::new("", address, timeout)
        }
    }

    async fn exchange(
        codec: RegisterCodec,
        port: &mut Option<DynSerial>,
        frame: &[u8],
        requested: u8,
        command: &str,
        timeout: Duration,
    ) -> DeviceResult<RegisterReply> {
        let port = port.as_mut().ok_or(DeviceError::NotConnected)?;
        drain_serial_buffer(port, Duration::ZERO).await;
        debug!(frame = ?frame, "register tx");
        port.write_all(frame).await?;
        port.flush().await?;

        let reply = tokio::time::timeout(timeout, async {
            let mut header = [0u8; 3];
            port.read_exact(&mut header).await?;
            let mut rest = vec![0u8; RegisterCodec::remaining_len(&header, requested)];
            port.read_exact(&mut rest).await?;
            let mut full = header.to_vec();
            full.extend_from_slice(&rest);
            Ok::<_, std::io::Error>(full)
        })
        .await
        .map_err(|_| DeviceError::timeout(command, timeout))??;

        debug!(frame = ?reply, "register rx");
        codec.decode_reply(&reply, command)
    }

    #[instrument(skip(self, data), fields(len = data.len()), err)]
    async fn write(&self, register: u8, data: &[u8], command: &str) -> DeviceResult<()> {
        self.ensure_connected()?;
        let frame = self.codec.write_frame(register, data);
        let mut port = self.port.regular().await;
        Self::expect_written(
            Self::exchange(self.codec, &mut port, &frame, 0, command, self.timeout).await?,
            register,
        )
    }

    async fn read(&self, register: u8, count: u8, command: &str) -> DeviceResult<Vec<u8>> {
        self.ensure_connected()?;
        let frame = self.codec.read_frame(register, count);
        let mut port = self.port.regular().await;
        match Self::exchange(self.codec, &mut port, &frame, count, command, self.timeout).await? {
            RegisterReply::Read { register: r, data } if r == register => Ok(data),
            other => Err(DeviceError::Decode(format!(
                "expected read of {register:#04x}, got {other:?}"
            ))),
        }
    }

    fn expect_written(reply: RegisterReply, register: u8) -> DeviceResult<()> {
        match reply {
            RegisterReply::Written { register: r, .. } if r == register => Ok(()),
            other => Err(DeviceError::Decode(format!(
                "expected write ack for {register:#04x}, got {other:?}"
            ))),
        }
    }

    async fn control(&self, bits: u8, command: &str) -> DeviceResult<()> {
        self.write(REG_CONTROL, &[bits], command).await
    }

    fn ensure_connected(&self) -> DeviceResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DeviceError::NotConnected)
        }
    }
}

#[async_trait]
impl Device for RegisterBusBackend {
    fn platform_info(&self) -> PlatformInfo {
        PlatformInfo {
            name: format!("Register-bus controller @ {:#04x}", self.codec.address()),
            transport: TransportKind::RegisterBus,
            protocol_version: "1.0".into(),
            capabilities: CORE_CAPABILITIES.to_vec(),
        }
    }

    async fn connect(&self) -> DeviceResult<()> {
        let mut port = self.port.regular().await;
        if port.is_none() {
            *port = Some(open_serial(&self.bus, BRIDGE_BAUD, BACKEND).await?);
        }

        let frame = self.codec.read_frame(REG_STATUS, 1);
        match Self::exchange(self.codec, &mut port, &frame, 1, "STATUS", self.timeout).await {
            Ok(RegisterReply::Read { data, .. }) => {
                self.connected.store(true, Ordering::SeqCst);
                info!(
                    bus = %self.bus,
                    address = self.codec.address(),
                    status = ?data.first(),
                    "Register-bus controller connected"
                );
                Ok(())
            }
            Ok(other) => {
                *port = None;
                Err(DeviceError::connection(BACKEND, format!("unexpected status reply {other:?}")))
            }
            Err(e) => {
                *port = None;
                Err(DeviceError::connection(BACKEND, format!("status read failed: {e}")))
            }
        }
    }

    async fn disconnect(&self) -> DeviceResult<()> {
        if self.connected.swap(false, Ordering::SeqCst) {
            let mut port = self.port.regular().await;
            if let Some(mut p) = port.take() {
                if let Err(e) = p.shutdown().await {
                    warn!(error = %e, "Bus shutdown failed");
                }
            }
            info!(bus = %self.bus, "Register-bus controller disconnected");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn enable(&self) -> DeviceResult<()> {
        self.control(CTRL_ENABLE, "ENABLE").await
    }

    async fn disable(&self) -> DeviceResult<()> {
        self.control(CTRL_DISABLE, "DISABLE").await
    }

    async fn emergency_stop(&self) -> DeviceResult<()> {
        self.ensure_connected()?;
        let frame = self.codec.write_frame(REG_CONTROL, &[CTRL_ESTOP]);
        let mut port = self.port.priority().await;
        let reply =
            Self::exchange(self.codec, &mut port, &frame, 0, "ESTOP", self.timeout).await?;
        warn!("Emergency stop written");
        Self::expect_written(reply, REG_CONTROL)
    }

    async fn set_position(&self, counts: i32) -> DeviceResult<()> {
        self.write(REG_POSITION_CMD, &counts.to_le_bytes(), "SETPOS").await
    }

    async fn set_velocity(&self, rpm: i32) -> DeviceResult<()> {
        self.write(REG_VELOCITY_CMD, &rpm.to_le_bytes(), "SETVEL").await
    }

    async fn set_torque(&self, mnm: i32) -> DeviceResult<()> {
        self.write(REG_TORQUE_CMD, &mnm.to_le_bytes(), "SETTORQ").await
    }

    async fn set_current(&self, ma: i32) -> DeviceResult<()> {
        self.write(REG_CURRENT_CMD, &ma.to_le_bytes(), "SETCURR").await
    }

    async fn get_sensors(&self) -> DeviceResult<SensorSample> {
        let block = self.read(REG_SENSORS, SENSOR_BLOCK_LEN, "GETSENSORS").await?;
        decode_sensor_block(&block, &self.calibration.read())
    }

    async fn set_pid_params(&self, gains: PidGains) -> DeviceResult<()> {
        self.write(REG_PID, &encode_pid(gains), "SETPID").await
    }

    async fn get_pid_params(&self) -> DeviceResult<PidGains> {
        decode_pid(&self.read(REG_PID, 12, "GETPID").await?)
    }

    async fn set_motion_profile(&self, profile: MotionProfile) -> DeviceResult<()> {
        self.write(REG_PROFILE, &encode_profile(profile), "SETPROFILE")
            .await
    }

    async fn get_motion_profile(&self) -> DeviceResult<MotionProfile> {
        decode_profile(&self.read(REG_PROFILE, 16, "GETPROFILE").await?)
    }

    async fn set_limit(&self, limit: LimitType, value: i32) -> DeviceResult<()> {
        self.write(limit_register(limit), &value.to_le_bytes(), "SETLIMIT")
            .await
    }

    async fn zero_sensors(&self) -> DeviceResult<()> {
        self.control(CTRL_ZERO_SENSORS, "ZERO").await
    }

    fn apply_calibration(&self, calibration: &CalibrationSet) {
        *self.calibration.write() = calibration.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::register::{encode_sensor_block, EXCEPTION_FLAG, FUNC_READ, FUNC_WRITE};
    use crc::{Crc, CRC_16_MODBUS};
    use tendon_core::{CalibrationRecord, SensorChannel};
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;

    const ADDRESS: u8 = 0x60;

    fn append_crc(frame: &mut Vec<u8>) {
        let sum = Crc::<u16>::new(&CRC_16_MODBUS).checksum(frame);
        frame.extend_from_slice(&sum.to_le_bytes());
    }

    /// Register-file device. Control writes are reported on `controls`.
    fn fake_board(mut device: DuplexStream, controls: mpsc::UnboundedSender<u8>) {
        tokio::spawn(async move {
            let mut regs = [0u8; 256];
            let block = encode_sensor_block(3_000, [500, 12, 150, 2_000, 1_400, 4_096]);
            regs[0x20..0x20 + block.len()].copy_from_slice(&block);
            loop {
                let mut head = [0u8; 4];
                if device.read_exact(&mut head).await.is_err() {
                    return;
                }
                let [addr, func, reg, count] = head;
                let data_len = if func == FUNC_WRITE { usize::from(count) } else { 0 };
                let mut rest = vec![0u8; data_len + 2];
                device.read_exact(&mut rest).await.unwrap();
                let r = usize::from(reg);

                let mut reply = if func == FUNC_WRITE && reg == REG_POSITION_CMD
                    && i32::from_le_bytes(rest[..4].try_into().unwrap()) > 10_000
                {
                    vec![addr, func | EXCEPTION_FLAG, 0x03]
                } else if func == FUNC_WRITE {
                    regs[r..r + data_len].copy_from_slice(&rest[..data_len]);
                    if reg == REG_CONTROL {
                        let _ = controls.send(rest[0]);
                    }
                    vec![addr, func, reg, count]
                } else {
                    let mut out = vec![addr, FUNC_READ, reg, count];
                    out.extend_from_slice(&regs[r..r + usize::from(count)]);
                    out
                };
                append_crc(&mut reply);
                device.write_all(&reply).await.unwrap();
            }
        });
    }

    async fn connected() -> (RegisterBusBackend, mpsc::UnboundedReceiver<u8>) {
        let (host, device) = tokio::io::duplex(1024);
        let (tx, rx) = mpsc::unbounded_channel();
        fake_board(device, tx);
        let backend = RegisterBusBackend::with_port(Box::new(host), ADDRESS, Duration::from_secs(1));
        backend.connect().await.unwrap();
        (backend, rx)
    }

    #[tokio::test]
    async fn sensor_block_is_one_transaction() {
        let (backend, _) = connected().await;
        let sample = backend.get_sensors().await.unwrap();
        assert_eq!(sample.timestamp, 3.0);
        assert_eq!(sample.position, 500);
        assert_eq!(sample.current, 150);
        assert_eq!(sample.force_tendon, 2_000);
        assert_eq!(sample.angle_joint, 4_096);
    }

    #[tokio::test]
    async fn calibration_applies_to_raw_words() {
        let (backend, _) = connected().await;
        let mut set = CalibrationSet::new();
        set.insert(CalibrationRecord::encoder(0, 4_096).unwrap());
        set.insert(CalibrationRecord {
            zero_offset: 400.0,
            scale_factor: 0.005,
            ..CalibrationRecord::identity(SensorChannel::TipLoadCell)
        });
        backend.apply_calibration(&set);

        let sample = backend.get_sensors().await.unwrap();
        // one full revolution wraps to zero
        assert_eq!(sample.angle_joint, 0);
        // (1400 - 400) * 0.005 N
        assert_eq!(sample.force_tip, 5_000);
    }

    #[tokio::test]
    async fn writes_round_trip_through_registers() {
        let (backend, mut controls) = connected().await;
        backend.enable().await.unwrap();
        backend.emergency_stop().await.unwrap();
        assert_eq!(controls.recv().await, Some(CTRL_ENABLE));
        assert_eq!(controls.recv().await, Some(CTRL_ESTOP));

        let gains = PidGains { kp: 2.0, ki: 0.25, kd: 0.125 };
        backend.set_pid_params(gains).await.unwrap();
        assert_eq!(backend.get_pid_params().await.unwrap(), gains);

        let profile = MotionProfile::default();
        backend.set_motion_profile(profile).await.unwrap();
        assert_eq!(backend.get_motion_profile().await.unwrap(), profile);
    }

    #[tokio::test]
    async fn exception_reply_is_rejection() {
        let (backend, _) = connected().await;
        let err = backend.set_position(20_000).await.unwrap_err();
        assert!(matches!(err, DeviceError::CommandRejected { .. }));
        backend.set_position(2_000).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn silent_bus_fails_connect() {
        let (host, _device) = tokio::io::duplex(64);
        let backend =
            RegisterBusBackend::with_port(Box::new(host), ADDRESS, Duration::from_millis(100));
        assert!(matches!(
            backend.connect().await,
            Err(DeviceError::Connection { .. })
        ));
    }

    /// Bridge whose link cannot be shut down cleanly.
    struct BrokenClose(DuplexStream);

    impl tokio::io::AsyncRead for BrokenClose {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::pin::Pin::new(&mut self.0).poll_read(cx, buf)
        }
    }

    impl tokio::io::AsyncWrite for BrokenClose {
        fn poll_write(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            std::pin::Pin::new(&mut self.0).poll_write(cx, buf)
        }

        fn poll_flush(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::pin::Pin::new(&mut self.0).poll_flush(cx)
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "bridge gone",
            )))
        }
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn failed_bus_shutdown_is_logged() {
        let (host, device) = tokio::io::duplex(1024);
        let (tx, _rx) = mpsc::unbounded_channel();
        fake_board(device, tx);
        let backend = RegisterBusBackend::with_port(
            Box::new(BrokenClose(host)),
            ADDRESS,
            Duration::from_secs(1),
        );
        backend.connect().await.unwrap();

        backend.disconnect().await.unwrap();
        assert!(!backend.is_connected());
        assert!(logs_contain("Bus shutdown failed"));
        assert!(logs_contain("bridge gone"));
    }
}
