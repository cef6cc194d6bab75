//! ASCII line protocol used by serial-attached controllers.
//!
//! Commands are a verb followed by space-separated arguments and a newline.
//! Every reply is a single line starting with `ACK`, `NACK` or `DATA`:
//!
//! ```text
//! > SETPOS 2500
//! < ACK
//! > SETCURR 4000
//! < NACK LIMIT
//! > GETSENSORS
//! < DATA 120345 2500 0 112 4800 3360 2250
//! ```

use tendon_core::{DeviceError, DeviceResult, LimitType, MotionProfile, PidGains, SensorSample};

/// Line terminator appended to every command.
pub const LINE_TERMINATOR: &str = "\n";

/// Reply payload of a successful ping.
pub const PONG: &str = "PONG";

/// A command understood by line-protocol firmware.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LineCommand {
    /// Liveness check, answered with `ACK PONG`.
    Ping,
    /// Enable the motor driver.
    Enable,
    /// Disable the motor driver.
    Disable,
    /// Emergency stop.
    EmergencyStop,
    /// Position setpoint in counts.
    SetPosition(i32),
    /// Velocity setpoint in RPM.
    SetVelocity(i32),
    /// Torque setpoint in mNm.
    SetTorque(i32),
    /// Current setpoint in mA.
    SetCurrent(i32),
    /// Read all sensors.
    GetSensors,
    /// Write PID gains.
    SetPid(PidGains),
    /// Read PID gains.
    GetPid,
    /// Write the motion profile.
    SetProfile(MotionProfile),
    /// Read the motion profile.
    GetProfile,
    /// Write a firmware-side limit.
    SetLimit(LimitType, i32),
    /// Zero all sensors.
    Zero,
}

impl LineCommand {
    /// Command verb as sent on the wire.
    pub fn verb(&self) -> &'static str {
        match self {
            LineCommand::Ping => "PING",
            LineCommand::Enable => "ENABLE",
            LineCommand::Disable => "DISABLE",
            LineCommand::EmergencyStop => "ESTOP",
            LineCommand::SetPosition(_) => "SETPOS",
            LineCommand::SetVelocity(_) => "SETVEL",
            LineCommand::SetTorque(_) => "SETTORQ",
            LineCommand::SetCurrent(_) => "SETCURR",
            LineCommand::GetSensors => "GETSENSORS",
            LineCommand::SetPid(_) => "SETPID",
            LineCommand::GetPid => "GETPID",
            LineCommand::SetProfile(_) => "SETPROFILE",
            LineCommand::GetProfile => "GETPROFILE",
            LineCommand::SetLimit(..) => "SETLIMIT",
            LineCommand::Zero => "ZERO",
        }
    }

    /// Full command line including the terminator.
    pub fn encode(&self) -> String {
        let verb = self.verb();
        let body = match self {
            LineCommand::SetPosition(v)
            | LineCommand::SetVelocity(v)
            | LineCommand::SetTorque(v)
            | LineCommand::SetCurrent(v) => format!("{verb} {v}"),
            LineCommand::SetPid(g) => format!("{verb} {} {} {}", g.kp, g.ki, g.kd),
            LineCommand::SetProfile(p) => format!(
                "{verb} {} {} {} {}",
                p.max_velocity_rpm, p.max_acceleration, p.max_deceleration, p.jerk
            ),
            LineCommand::SetLimit(kind, v) => format!("{verb} {} {v}", kind.wire_name()),
            _ => verb.to_string(),
        };
        body + LINE_TERMINATOR
    }
}

/// A decoded reply line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineReply {
    /// Command accepted, with optional payload tokens.
    Ack(Vec<String>),
    /// Command refused, with the firmware's reason.
    Nack(String),
    /// Sensor data tokens.
    Data(Vec<String>),
}

/// Decode one reply line. Whitespace runs are collapsed; anything that does
/// not start with a known reply tag is a decode error.
pub fn parse_reply(line: &str) -> DeviceResult<LineReply> {
    let mut tokens = line.split_whitespace();
    let tag = tokens
        .next()
        .ok_or_else(|| DeviceError::Decode("empty reply line".into()))?;
    let rest: Vec<String> = tokens.map(str::to_string).collect();

    match tag {
        "ACK" => Ok(LineReply::Ack(rest)),
        "NACK" => Ok(LineReply::Nack(if rest.is_empty() {
            "unspecified".into()
        } else {
            rest.join(" ")
        })),
        "DATA" => Ok(LineReply::Data(rest)),
        other => Err(DeviceError::Decode(format!(
            "unexpected reply tag '{other}' in '{line}'"
        ))),
    }
}

fn parse_token<T: std::str::FromStr>(token: &str, what: &str) -> DeviceResult<T> {
    token
        .parse()
        .map_err(|_| DeviceError::Decode(format!("invalid {what} '{token}'")))
}

fn expect_len(tokens: &[String], n: usize, what: &str) -> DeviceResult<()> {
    if tokens.len() < n {
        return Err(DeviceError::Decode(format!(
            "{what} needs {n} fields, got {}",
            tokens.len()
        )));
    }
    Ok(())
}

/// Decode `DATA` tokens into a sample. The firmware timestamp is in
/// milliseconds.
pub fn parse_sensor_fields(tokens: &[String]) -> DeviceResult<SensorSample> {
    expect_len(tokens, 7, "sensor data")?;
    let timestamp_ms: u64 = parse_token(&tokens[0], "timestamp")?;
    Ok(SensorSample {
        timestamp: timestamp_ms as f64 / 1_000.0,
        position: parse_token(&tokens[1], "position")?,
        velocity: parse_token(&tokens[2], "velocity")?,
        current: parse_token(&tokens[3], "current")?,
        force_tendon: parse_token(&tokens[4], "tendon force")?,
        force_tip: parse_token(&tokens[5], "tip force")?,
        angle_joint: parse_token(&tokens[6], "joint angle")?,
    })
}

/// Decode `ACK kp ki kd`.
pub fn parse_pid(tokens: &[String]) -> DeviceResult<PidGains> {
    expect_len(tokens, 3, "PID reply")?;
    Ok(PidGains {
        kp: parse_token(&tokens[0], "kp")?,
        ki: parse_token(&tokens[1], "ki")?,
        kd: parse_token(&tokens[2], "kd")?,
    })
}

/// Decode `ACK max_velocity acceleration deceleration jerk`.
pub fn parse_profile(tokens: &[String]) -> DeviceResult<MotionProfile> {
    expect_len(tokens, 4, "profile reply")?;
    Ok(MotionProfile {
        max_velocity_rpm: parse_token(&tokens[0], "max velocity")?,
        max_acceleration: parse_token(&tokens[1], "acceleration")?,
        max_deceleration: parse_token(&tokens[2], "deceleration")?,
        jerk: parse_token(&tokens[3], "jerk")?,
    })
}
