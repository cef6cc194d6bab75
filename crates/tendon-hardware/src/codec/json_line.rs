//! JSON-line protocol used by networked controllers.
//!
//! One JSON object per line. Requests carry `{"cmd": ..., "data": {...}}` and
//! replies carry `{"status": "ok" | "error", "data": {...}, "error": "..."}`.
//! Sensor samples on the stream socket are bare sample objects, one per line.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tendon_core::{DeviceError, DeviceResult, LimitType, MotionProfile, PidGains, SensorSample};

/// A command request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRequest {
    /// Command name, e.g. `SET_POSITION`.
    pub cmd: String,
    /// Optional argument object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRequest {
    /// Request without arguments.
    pub fn bare(cmd: &str) -> Self {
        Self {
            cmd: cmd.to_string(),
            data: None,
        }
    }

    /// Request with an argument object.
    pub fn with(cmd: &str, data: Value) -> Self {
        Self {
            cmd: cmd.to_string(),
            data: Some(data),
        }
    }

    /// `{"value": v}` setpoint request.
    pub fn setpoint(cmd: &str, value: i32) -> Self {
        Self::with(cmd, json!({ "value": value }))
    }

    /// PID gains request.
    pub fn set_pid(gains: PidGains) -> Self {
        Self::with(
            "SET_PID",
            json!({ "kp": gains.kp, "ki": gains.ki, "kd": gains.kd }),
        )
    }

    /// Motion profile request.
    pub fn set_profile(profile: MotionProfile) -> Self {
        Self::with(
            "SET_PROFILE",
            json!({
                "max_velocity": profile.max_velocity_rpm,
                "acceleration": profile.max_acceleration,
                "deceleration": profile.max_deceleration,
                "jerk_limit": profile.jerk,
            }),
        )
    }

    /// Firmware limit request.
    pub fn set_limit(kind: LimitType, value: i32) -> Self {
        Self::with(
            "SET_LIMIT",
            json!({ "type": kind.wire_name(), "value": value }),
        )
    }

    /// Serialized line including the trailing newline.
    pub fn encode(&self) -> DeviceResult<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Reply status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsonStatus {
    /// Command succeeded.
    Ok,
    /// Command failed; see `error`.
    Error,
}

/// A command reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonReply {
    /// Outcome.
    pub status: JsonStatus,
    /// Payload, if any.
    #[serde(default)]
    pub data: Value,
    /// Error text when `status` is `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JsonReply {
    /// Decode one reply line.
    pub fn decode(line: &str) -> DeviceResult<Self> {
        serde_json::from_str(line.trim())
            .map_err(|e| DeviceError::Decode(format!("bad reply '{}': {e}", line.trim())))
    }

    /// Payload of a successful reply; an `error` status becomes a rejection of
    /// `cmd`.
    pub fn into_data(self, cmd: &str) -> DeviceResult<Value> {
        match self.status {
            JsonStatus::Ok => Ok(self.data),
            JsonStatus::Error => Err(DeviceError::rejected(
                cmd,
                self.error.unwrap_or_else(|| "unknown error".into()),
            )),
        }
    }
}

/// Sensor payload as sent by the controller. Every field is required.
#[derive(Debug, Clone, Copy, Deserialize)]
struct WireSample {
    timestamp: f64,
    position: i32,
    velocity: i32,
    current: u32,
    force_tendon: i32,
    force_tip: i32,
    angle_joint: i32,
}

impl From<WireSample> for SensorSample {
    fn from(w: WireSample) -> Self {
        SensorSample {
            timestamp: w.timestamp,
            position: w.position,
            velocity: w.velocity,
            current: w.current,
            force_tendon: w.force_tendon,
            force_tip: w.force_tip,
            angle_joint: w.angle_joint,
        }
    }
}

/// Decode a sensor payload from a `GET_SENSORS` reply.
pub fn sample_from_value(value: Value) -> DeviceResult<SensorSample> {
    let wire: WireSample = serde_json::from_value(value)
        .map_err(|e| DeviceError::Decode(format!("incomplete sensor payload: {e}")))?;
    Ok(wire.into())
}

/// Decode one line from the stream socket.
pub fn sample_from_line(line: &str) -> DeviceResult<SensorSample> {
    let wire: WireSample = serde_json::from_str(line.trim())
        .map_err(|e| DeviceError::Decode(format!("bad stream line: {e}")))?;
    Ok(wire.into())
}

/// Decode a `GET_PID` payload.
pub fn pid_from_value(value: Value) -> DeviceResult<PidGains> {
    serde_json::from_value(value).map_err(|e| DeviceError::Decode(format!("bad PID payload: {e}")))
}

#[derive(Deserialize)]
struct WireProfile {
    max_velocity: f64,
    acceleration: f64,
    deceleration: f64,
    jerk_limit: f64,
}

/// Decode a `GET_PROFILE` payload.
pub fn profile_from_value(value: Value) -> DeviceResult<MotionProfile> {
    let wire: WireProfile = serde_json::from_value(value)
        .map_err(|e| DeviceError::Decode(format!("bad profile payload: {e}")))?;
    Ok(MotionProfile {
        max_velocity_rpm: wire.max_velocity,
        max_acceleration: wire.acceleration,
        max_deceleration: wire.deceleration,
        jerk: wire.jerk_limit,
    })
}
