//! The capability contract every backend satisfies.
//!
//! A backend is one transport to one actuator: a line-protocol controller on a
//! serial port, a JSON-line controller on a TCP socket, a register-bus board,
//! or the physics simulator. Callers only ever see `dyn Device`.
//!
//! # Contract
//!
//! - Every call returns a [`DeviceResult`]; transport faults never panic.
//! - `get_sensors` is bounded by a transport-specific timeout and fails with
//!   [`DeviceError::Timeout`](crate::DeviceError::Timeout) rather than hanging.
//! - `connect` performs a liveness handshake before reporting success.
//! - `disconnect` is idempotent.
//! - `emergency_stop` must take priority over regular commands waiting for
//!   the transport (see [`CommandGate`](crate::CommandGate)).

use crate::calibration::CalibrationSet;
use crate::error::{DeviceError, DeviceResult};
use crate::sample::SensorSample;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

// =============================================================================
// Descriptors
// =============================================================================

/// Physical transport behind a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Newline-delimited ASCII over a serial port.
    LineSerial,
    /// JSON objects, one per line, over TCP.
    JsonLine,
    /// Little-endian registers over a framed bus.
    RegisterBus,
    /// In-process physics model.
    Simulated,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TransportKind::LineSerial => "line-serial",
            TransportKind::JsonLine => "json-line",
            TransportKind::RegisterBus => "register-bus",
            TransportKind::Simulated => "simulated",
        };
        write!(f, "{}", label)
    }
}

/// Runtime capability flags for introspection and compliance checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Position setpoints.
    Position,
    /// Velocity setpoints.
    Velocity,
    /// Torque setpoints.
    Torque,
    /// Current setpoints.
    Current,
    /// Streaming by host-side polling of `get_sensors`.
    PolledStreaming,
    /// Device-pushed sample stream on a dedicated channel.
    PushStreaming,
    /// PID gain read/write.
    Pid,
    /// Motion profile read/write.
    MotionProfile,
    /// Remote limit configuration.
    Limits,
    /// Sensor zeroing.
    ZeroSensors,
    /// Emergency stop.
    EmergencyStop,
}

/// Capabilities every backend in this workspace offers.
pub const CORE_CAPABILITIES: &[Capability] = &[
    Capability::Position,
    Capability::Velocity,
    Capability::Torque,
    Capability::Current,
    Capability::PolledStreaming,
    Capability::Pid,
    Capability::MotionProfile,
    Capability::Limits,
    Capability::ZeroSensors,
    Capability::EmergencyStop,
];

/// Static descriptor produced once per backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformInfo {
    /// Human-readable platform name.
    pub name: String,
    /// Transport in use.
    pub transport: TransportKind,
    /// Wire protocol version string.
    pub protocol_version: String,
    /// Offered capabilities.
    pub capabilities: Vec<Capability>,
}

impl PlatformInfo {
    /// True if the backend advertises `capability`.
    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

// =============================================================================
// Command Parameters
// =============================================================================

/// Position loop PID gains.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidGains {
    /// Proportional gain.
    pub kp: f64,
    /// Integral gain.
    pub ki: f64,
    /// Derivative gain.
    pub kd: f64,
}

impl Default for PidGains {
    fn default() -> Self {
        Self {
            kp: 1.0,
            ki: 0.1,
            kd: 0.05,
        }
    }
}

/// Trajectory limits used by the controller's motion planner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionProfile {
    /// Peak velocity in RPM.
    pub max_velocity_rpm: f64,
    /// Peak acceleration in RPM/s.
    pub max_acceleration: f64,
    /// Peak deceleration in RPM/s.
    pub max_deceleration: f64,
    /// Jerk limit in RPM/s².
    pub jerk: f64,
}

impl Default for MotionProfile {
    fn default() -> Self {
        Self {
            max_velocity_rpm: 3_000.0,
            max_acceleration: 1_000.0,
            max_deceleration: 1_000.0,
            jerk: 5_000.0,
        }
    }
}

/// Limit kinds understood by remote controllers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitType {
    /// Current ceiling in mA.
    Current,
    /// Lower position bound in counts.
    PositionMin,
    /// Upper position bound in counts.
    PositionMax,
    /// Tendon force ceiling in mN.
    Force,
}

impl LimitType {
    /// Name used on the wire.
    pub fn wire_name(&self) -> &'static str {
        match self {
            LimitType::Current => "current",
            LimitType::PositionMin => "position_min",
            LimitType::PositionMax => "position_max",
            LimitType::Force => "force",
        }
    }
}

impl std::str::FromStr for LimitType {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "current" => Ok(LimitType::Current),
            "position_min" => Ok(LimitType::PositionMin),
            "position_max" => Ok(LimitType::PositionMax),
            "force" => Ok(LimitType::Force),
            other => Err(DeviceError::Decode(format!("unknown limit type '{other}'"))),
        }
    }
}

/// Device-pushed sample stream returned by [`Device::open_feed`].
///
/// The sender side closes when the backend's stream reader exits.
pub type SampleFeed = mpsc::Receiver<DeviceResult<SensorSample>>;

// =============================================================================
// Device Trait
// =============================================================================

/// Uniform actuator capability contract.
///
/// Implementations use interior mutability; every method takes `&self` so a
/// single `Arc<dyn Device>` can be shared between the streaming engine, the
/// safety monitor and the test engine.
#[async_trait]
pub trait Device: Send + Sync {
    /// Static descriptor for this backend.
    fn platform_info(&self) -> PlatformInfo;

    /// Open the transport and verify the remote end is alive.
    async fn connect(&self) -> DeviceResult<()>;

    /// Close the transport. Calling this on a closed backend is a no-op.
    async fn disconnect(&self) -> DeviceResult<()>;

    /// True between a successful `connect` and the next `disconnect`.
    fn is_connected(&self) -> bool;

    /// Enable the motor driver.
    async fn enable(&self) -> DeviceResult<()>;

    /// Disable the motor driver.
    async fn disable(&self) -> DeviceResult<()>;

    /// Halt actuation immediately. Jumps ahead of queued regular commands.
    async fn emergency_stop(&self) -> DeviceResult<()>;

    /// Position setpoint in encoder counts.
    async fn set_position(&self, counts: i32) -> DeviceResult<()>;

    /// Velocity setpoint in RPM.
    async fn set_velocity(&self, rpm: i32) -> DeviceResult<()>;

    /// Torque setpoint in mNm.
    async fn set_torque(&self, mnm: i32) -> DeviceResult<()>;

    /// Current setpoint in mA.
    async fn set_current(&self, ma: i32) -> DeviceResult<()>;

    /// Read one fresh sample, bounded by the backend's read timeout.
    async fn get_sensors(&self) -> DeviceResult<SensorSample>;

    /// Write position loop gains.
    async fn set_pid_params(&self, gains: PidGains) -> DeviceResult<()>;

    /// Read position loop gains.
    async fn get_pid_params(&self) -> DeviceResult<PidGains>;

    /// Write the motion profile.
    async fn set_motion_profile(&self, profile: MotionProfile) -> DeviceResult<()>;

    /// Read the motion profile.
    async fn get_motion_profile(&self) -> DeviceResult<MotionProfile>;

    /// Configure a limit on the remote controller.
    async fn set_limit(&self, limit: LimitType, value: i32) -> DeviceResult<()>;

    /// Capture present force readings as the new zero.
    async fn zero_sensors(&self) -> DeviceResult<()>;

    /// Start a device-pushed sample stream.
    ///
    /// Backends without a dedicated stream channel return `Ok(None)` and the
    /// streaming engine polls `get_sensors` instead.
    async fn open_feed(&self, _rate_hz: f64) -> DeviceResult<Option<SampleFeed>> {
        Ok(None)
    }

    /// Stop a stream started by [`Device::open_feed`].
    async fn close_feed(&self) -> DeviceResult<()> {
        Ok(())
    }

    /// Install calibration used while decoding raw sensor values.
    ///
    /// Backends whose firmware reports calibrated units ignore this.
    fn apply_calibration(&self, _calibration: &CalibrationSet) {}
}
