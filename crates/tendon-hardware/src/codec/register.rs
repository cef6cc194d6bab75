//! Binary register protocol.
//!
//! Registers hold fixed-width little-endian integers. Frames follow the
//! Modbus RTU layout with a CRC-16/MODBUS trailer (low byte first):
//!
//! ```text
//! write   [addr, 0x10, reg, n, data[n].., crc_lo, crc_hi]
//! ack     [addr, 0x10, reg, n, crc_lo, crc_hi]
//! read    [addr, 0x03, reg, n, crc_lo, crc_hi]
//! reply   [addr, 0x03, reg, n, data[n].., crc_lo, crc_hi]
//! error   [addr, func | 0x80, code, crc_lo, crc_hi]
//! ```
//!
//! The whole sensor block is read in one transaction so every field of a
//! sample comes from the same firmware tick.

use crc::{Crc, CRC_16_MODBUS};
use tendon_core::{
    CalibrationSet, DeviceError, DeviceResult, LimitType, MotionProfile, PidGains, SensorChannel,
    SensorSample,
};

const MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Read-registers function code.
pub const FUNC_READ: u8 = 0x03;
/// Write-registers function code.
pub const FUNC_WRITE: u8 = 0x10;
/// Set on the function code of an exception reply.
pub const EXCEPTION_FLAG: u8 = 0x80;

// =============================================================================
// Register map
// =============================================================================

/// Control register (one byte).
pub const REG_CONTROL: u8 = 0x00;
/// Status register (one byte).
pub const REG_STATUS: u8 = 0x01;
/// Position setpoint, i32 counts.
pub const REG_POSITION_CMD: u8 = 0x10;
/// Velocity setpoint, i32 RPM.
pub const REG_VELOCITY_CMD: u8 = 0x14;
/// Torque setpoint, i32 mNm.
pub const REG_TORQUE_CMD: u8 = 0x18;
/// Current setpoint, i32 mA.
pub const REG_CURRENT_CMD: u8 = 0x1C;
/// Start of the sensor block.
pub const REG_SENSORS: u8 = 0x20;
/// PID gains, three i32 in thousandths.
pub const REG_PID: u8 = 0x40;
/// Motion profile, four u32.
pub const REG_PROFILE: u8 = 0x50;
/// Firmware limits, four i32.
pub const REG_LIMITS: u8 = 0x60;

/// Control bits.
pub const CTRL_DISABLE: u8 = 0x00;
/// Enable the driver.
pub const CTRL_ENABLE: u8 = 0x01;
/// Zero all sensors.
pub const CTRL_ZERO_SENSORS: u8 = 0x40;
/// Emergency stop.
pub const CTRL_ESTOP: u8 = 0x80;

/// Sensor block length: seven 32-bit words.
pub const SENSOR_BLOCK_LEN: u8 = 28;
/// Fixed-point scale for PID gains.
pub const PID_SCALE: f64 = 1_000.0;

/// Register holding a firmware limit.
pub fn limit_register(kind: LimitType) -> u8 {
    REG_LIMITS
        + match kind {
            LimitType::Current => 0x00,
            LimitType::PositionMin => 0x04,
            LimitType::PositionMax => 0x08,
            LimitType::Force => 0x0C,
        }
}

/// Decoded reply frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterReply {
    /// Write acknowledged.
    Written {
        /// First register written.
        register: u8,
        /// Bytes written.
        count: u8,
    },
    /// Read result.
    Read {
        /// First register read.
        register: u8,
        /// Register bytes.
        data: Vec<u8>,
    },
}

/// Frame builder and parser for one device address.
#[derive(Debug, Clone, Copy)]
pub struct RegisterCodec {
    address: u8,
}

fn with_crc(mut frame: Vec<u8>) -> Vec<u8> {
    let crc = MODBUS.checksum(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

fn exception_text(code: u8) -> &'static str {
    match code {
        0x01 => "illegal function",
        0x02 => "illegal register",
        0x03 => "value out of range",
        0x04 => "device failure",
        _ => "unknown exception",
    }
}

impl RegisterCodec {
    /// Codec for the device at `address`.
    pub fn new(address: u8) -> Self {
        Self { address }
    }

    /// Device address.
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Frame writing `data` starting at `register`.
    pub fn write_frame(&self, register: u8, data: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(data.len() + 6);
        frame.extend_from_slice(&[self.address, FUNC_WRITE, register, data.len() as u8]);
        frame.extend_from_slice(data);
        with_crc(frame)
    }

    /// Frame reading `count` bytes starting at `register`.
    pub fn read_frame(&self, register: u8, count: u8) -> Vec<u8> {
        with_crc(vec![self.address, FUNC_READ, register, count])
    }

    /// Bytes still to read after the three-byte reply header.
    ///
    /// `requested` is the byte count of the read being answered; it is
    /// ignored for write acknowledgements and exceptions.
    pub fn remaining_len(header: &[u8; 3], requested: u8) -> usize {
        let func = header[1];
        if func & EXCEPTION_FLAG != 0 {
            2
        } else if func == FUNC_READ {
            1 + usize::from(requested) + 2
        } else {
            1 + 2
        }
    }

    /// Validate and decode a complete reply frame.
    ///
    /// CRC and address mismatches are decode errors; exception replies are
    /// command rejections.
    pub fn decode_reply(&self, frame: &[u8], command: &str) -> DeviceResult<RegisterReply> {
        if frame.len() < 5 {
            return Err(DeviceError::Decode(format!(
                "register frame too short: {} bytes",
                frame.len()
            )));
        }
        let (body, trailer) = frame.split_at(frame.len() - 2);
        let expected = MODBUS.checksum(body);
        let received = u16::from_le_bytes([trailer[0], trailer[1]]);
        if expected != received {
            return Err(DeviceError::Decode(format!(
                "CRC mismatch: expected {expected:#06x}, got {received:#06x}"
            )));
        }
        if body[0] != self.address {
            return Err(DeviceError::Decode(format!(
                "reply from address {:#04x}, expected {:#04x}",
                body[0], self.address
            )));
        }

        let func = body[1];
        if func & EXCEPTION_FLAG != 0 {
            return Err(DeviceError::rejected(command, exception_text(body[2])));
        }

        let register = body[2];
        let count = body[3];
        match func {
            FUNC_WRITE if body.len() == 4 => Ok(RegisterReply::Written { register, count }),
            FUNC_READ if body.len() == 4 + usize::from(count) => Ok(RegisterReply::Read {
                register,
                data: body[4..].to_vec(),
            }),
            _ => Err(DeviceError::Decode(format!(
                "malformed reply: function {func:#04x}, {} body bytes",
                body.len()
            ))),
        }
    }
}

// =============================================================================
// Payload encoding
// =============================================================================

fn word(data: &[u8], index: usize) -> [u8; 4] {
    let at = index * 4;
    [data[at], data[at + 1], data[at + 2], data[at + 3]]
}

fn require_len(data: &[u8], len: usize, what: &str) -> DeviceResult<()> {
    if data.len() != len {
        return Err(DeviceError::Decode(format!(
            "{what} block is {} bytes, expected {len}",
            data.len()
        )));
    }
    Ok(())
}

/// Decode the sensor block. Raw load-cell and encoder words go through
/// `calibration`; uncalibrated channels pass through unchanged.
pub fn decode_sensor_block(data: &[u8], calibration: &CalibrationSet) -> DeviceResult<SensorSample> {
    require_len(data, usize::from(SENSOR_BLOCK_LEN), "sensor")?;
    let timestamp_ms = u32::from_le_bytes(word(data, 0));
    let tendon_raw = i32::from_le_bytes(word(data, 4));
    let tip_raw = i32::from_le_bytes(word(data, 5));
    let angle_raw = i32::from_le_bytes(word(data, 6));

    Ok(SensorSample {
        timestamp: f64::from(timestamp_ms) / 1_000.0,
        position: i32::from_le_bytes(word(data, 1)),
        velocity: i32::from_le_bytes(word(data, 2)),
        current: u32::from_le_bytes(word(data, 3)),
        force_tendon: calibration.force_mn(SensorChannel::TendonLoadCell, tendon_raw),
        force_tip: calibration.force_mn(SensorChannel::TipLoadCell, tip_raw),
        angle_joint: calibration.angle(angle_raw),
    })
}

/// Raw register image of a sample, as firmware would lay it out.
pub fn encode_sensor_block(timestamp_ms: u32, raw: [i32; 6]) -> Vec<u8> {
    let mut out = Vec::with_capacity(usize::from(SENSOR_BLOCK_LEN));
    out.extend_from_slice(&timestamp_ms.to_le_bytes());
    for value in raw {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// PID gains as three fixed-point words.
pub fn encode_pid(gains: PidGains) -> Vec<u8> {
    [gains.kp, gains.ki, gains.kd]
        .iter()
        .flat_map(|g| ((g * PID_SCALE).round() as i32).to_le_bytes())
        .collect()
}

/// Inverse of [`encode_pid`].
pub fn decode_pid(data: &[u8]) -> DeviceResult<PidGains> {
    require_len(data, 12, "PID")?;
    let gain = |i| f64::from(i32::from_le_bytes(word(data, i))) / PID_SCALE;
    Ok(PidGains {
        kp: gain(0),
        ki: gain(1),
        kd: gain(2),
    })
}

/// Motion profile as four unsigned words.
pub fn encode_profile(profile: MotionProfile) -> Vec<u8> {
    [
        profile.max_velocity_rpm,
        profile.max_acceleration,
        profile.max_deceleration,
        profile.jerk,
    ]
    .iter()
    .flat_map(|v| (v.max(0.0).round() as u32).to_le_bytes())
    .collect()
}

/// Inverse of [`encode_profile`].
pub fn decode_profile(data: &[u8]) -> DeviceResult<MotionProfile> {
    require_len(data, 16, "profile")?;
    let value = |i| f64::from(u32::from_le_bytes(word(data, i)));
    Ok(MotionProfile {
        max_velocity_rpm: value(0),
        max_acceleration: value(1),
        max_deceleration: value(2),
        jerk: value(3),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tendon_core::CalibrationRecord;

    #[test]
    fn read_frame_matches_modbus_vector() {
        // CRC-16/MODBUS of [01 03 00 00 00 01] is 0x0A84; frame layout differs
        // but the checksum must be appended little-endian.
        let codec = RegisterCodec::new(0x01);
        let frame = codec.read_frame(REG_SENSORS, SENSOR_BLOCK_LEN);
        assert_eq!(&frame[..4], &[0x01, FUNC_READ, REG_SENSORS, 28]);
        let crc = MODBUS.checksum(&frame[..4]).to_le_bytes();
        assert_eq!(&frame[4..], &crc);
        assert_eq!(MODBUS.checksum(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]), 0x0A84);
    }

    #[test]
    fn decodes_write_ack_and_read_reply() {
        let codec = RegisterCodec::new(0x60);
        let ack = with_crc(vec![0x60, FUNC_WRITE, REG_CONTROL, 1]);
        assert_eq!(
            codec.decode_reply(&ack, "ENABLE").unwrap(),
            RegisterReply::Written {
                register: REG_CONTROL,
                count: 1
            }
        );

        let reply = with_crc(vec![0x60, FUNC_READ, REG_STATUS, 1, 0x05]);
        assert_eq!(
            codec.decode_reply(&reply, "STATUS").unwrap(),
            RegisterReply::Read {
                register: REG_STATUS,
                data: vec![0x05]
            }
        );
    }

    #[test]
    fn corrupted_frames_are_decode_errors() {
        let codec = RegisterCodec::new(0x60);
        let mut frame = with_crc(vec![0x60, FUNC_READ, REG_STATUS, 1, 0x05]);
        frame[4] ^= 0xFF;
        assert!(matches!(
            codec.decode_reply(&frame, "STATUS"),
            Err(DeviceError::Decode(_))
        ));

        let wrong_addr = with_crc(vec![0x61, FUNC_WRITE, REG_CONTROL, 1]);
        assert!(codec.decode_reply(&wrong_addr, "ENABLE").is_err());
        assert!(codec.decode_reply(&[0x60, 0x03], "x").is_err());
    }

    #[test]
    fn exception_is_rejection() {
        let codec = RegisterCodec::new(0x60);
        let frame = with_crc(vec![0x60, FUNC_WRITE | EXCEPTION_FLAG, 0x03]);
        let header = [frame[0], frame[1], frame[2]];
        assert_eq!(RegisterCodec::remaining_len(&header, 0), 2);
        assert!(matches!(
            codec.decode_reply(&frame, "SETPOS"),
            Err(DeviceError::CommandRejected { .. })
        ));
    }

    #[test]
    fn sensor_block_applies_calibration() {
        let block = encode_sensor_block(2_500, [100, -20, 350, 1_000, 600, 1_024]);
        let mut calibration = CalibrationSet::new();
        let raw = decode_sensor_block(&block, &calibration).unwrap();
        assert_eq!(raw.timestamp, 2.5);
        assert_eq!(raw.velocity, -20);
        assert_eq!(raw.force_tendon, 1_000);

        calibration.insert(CalibrationRecord {
            zero_offset: 100.0,
            scale_factor: 0.01,
            ..CalibrationRecord::identity(SensorChannel::TipLoadCell)
        });
        let calibrated = decode_sensor_block(&block, &calibration).unwrap();
        // (600 - 100) * 0.01 N = 5 N
        assert_eq!(calibrated.force_tip, 5_000);

        assert!(decode_sensor_block(&block[..20], &calibration).is_err());
    }

    #[test]
    fn pid_fixed_point() {
        let gains = PidGains {
            kp: 1.25,
            ki: 0.1,
            kd: 0.005,
        };
        let decoded = decode_pid(&encode_pid(gains)).unwrap();
        assert_eq!(decoded, gains);
    }

    #[test]
    fn limit_registers_are_distinct() {
        assert_eq!(limit_register(LimitType::Current), 0x60);
        assert_eq!(limit_register(LimitType::Force), 0x6C);
    }
}
