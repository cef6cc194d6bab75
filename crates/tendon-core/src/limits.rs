//! Safety envelope, local command ranges and shared timing constants.
//!
//! [`DeviceLimits`] is the envelope the safety monitor enforces on every
//! sample. [`CommandBounds`] is the cheaper, local range check a device handle
//! applies before any command reaches the wire.

use crate::error::{DeviceError, DeviceResult};
use crate::sample::SensorSample;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// =============================================================================
// Timing Constants
// =============================================================================

/// Default bound on a single sensor read before it fails as a timeout.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Timeout for stopping background tasks before they are aborted.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Consecutive acquisition failures after which streaming stops itself.
pub const DEFAULT_STREAM_FAILURE_THRESHOLD: u32 = 3;

/// Minimum rate at which the safety monitor evaluates a sample.
pub const DEFAULT_SAFETY_RATE_HZ: f64 = 10.0;

/// Fraction of a limit a channel must return below before a violation clears.
pub const DEFAULT_CLEAR_FRACTION: f64 = 0.9;

// =============================================================================
// Safety Envelope
// =============================================================================

/// Channel a limit applies to, in the order the safety monitor checks them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitChannel {
    /// Motor current.
    Current,
    /// Tendon load cell.
    TendonForce,
    /// Fingertip load cell.
    TipForce,
    /// Encoder position.
    Position,
}

impl std::fmt::Display for LimitChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            LimitChannel::Current => "current",
            LimitChannel::TendonForce => "tendon force",
            LimitChannel::TipForce => "tip force",
            LimitChannel::Position => "position",
        };
        write!(f, "{}", label)
    }
}

/// A limit breach together with the sample that caused it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    /// Channel that exceeded its limit.
    pub channel: LimitChannel,
    /// Measured value, in the channel's native unit.
    pub value: i64,
    /// The limit that was exceeded.
    pub limit: i64,
    /// The offending sample.
    pub sample: SensorSample,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} exceeds limit {} at t={:.3}s",
            self.channel, self.value, self.limit, self.sample.timestamp
        )
    }
}

/// Safety envelope, owned by the safety monitor.
///
/// Each force channel carries its own maximum and both are enforced
/// independently. Forces are compared by magnitude.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceLimits {
    /// Maximum motor current in milliamps.
    pub current_max: u32,
    /// Minimum allowed encoder position.
    pub position_min: i32,
    /// Maximum allowed encoder position.
    pub position_max: i32,
    /// Maximum tendon force in millinewtons.
    pub force_tendon_max: i32,
    /// Maximum tip force in millinewtons.
    pub force_tip_max: i32,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            current_max: 1_000,
            position_min: 0,
            position_max: 10_000,
            force_tendon_max: 200_000,
            force_tip_max: 20_000,
        }
    }
}

impl DeviceLimits {
    /// Check a sample against the envelope.
    ///
    /// Channels are checked in a fixed order (current, tendon force, tip
    /// force, position) and the first breach is returned.
    pub fn check(&self, sample: &SensorSample) -> Option<Violation> {
        let violation = |channel, value: i64, limit: i64| {
            Some(Violation {
                channel,
                value,
                limit,
                sample: *sample,
            })
        };

        if sample.current > self.current_max {
            return violation(
                LimitChannel::Current,
                i64::from(sample.current),
                i64::from(self.current_max),
            );
        }
        if sample.force_tendon.unsigned_abs() > self.force_tendon_max.unsigned_abs() {
            return violation(
                LimitChannel::TendonForce,
                i64::from(sample.force_tendon),
                i64::from(self.force_tendon_max),
            );
        }
        if sample.force_tip.unsigned_abs() > self.force_tip_max.unsigned_abs() {
            return violation(
                LimitChannel::TipForce,
                i64::from(sample.force_tip),
                i64::from(self.force_tip_max),
            );
        }
        if sample.position < self.position_min {
            return violation(
                LimitChannel::Position,
                i64::from(sample.position),
                i64::from(self.position_min),
            );
        }
        if sample.position > self.position_max {
            return violation(
                LimitChannel::Position,
                i64::from(sample.position),
                i64::from(self.position_max),
            );
        }
        None
    }

    /// True when every channel sits inside the hysteresis clear band.
    ///
    /// Magnitude channels must drop to `fraction` of their limit. Position must
    /// move back inside the span by `(1 - fraction)` of the span width.
    pub fn is_clear(&self, sample: &SensorSample, fraction: f64) -> bool {
        let within = |value: f64, limit: f64| value.abs() <= limit.abs() * fraction;
        let margin = f64::from(self.position_max - self.position_min) * (1.0 - fraction) / 2.0;
        let position = f64::from(sample.position);

        within(f64::from(sample.current), f64::from(self.current_max))
            && within(
                f64::from(sample.force_tendon),
                f64::from(self.force_tendon_max),
            )
            && within(f64::from(sample.force_tip), f64::from(self.force_tip_max))
            && position >= f64::from(self.position_min) + margin
            && position <= f64::from(self.position_max) - margin
    }

    /// Highest value/limit ratio over all channels.
    ///
    /// Position is expressed as distance from the span centre relative to half
    /// the span, so sitting on either end stop is a ratio of 1.0.
    pub fn worst_ratio(&self, sample: &SensorSample) -> (LimitChannel, f64) {
        let ratio = |value: f64, limit: f64| {
            if limit == 0.0 {
                f64::INFINITY
            } else {
                value.abs() / limit.abs()
            }
        };
        let half_span = f64::from(self.position_max - self.position_min) / 2.0;
        let centre = f64::from(self.position_min) + half_span;

        [
            (
                LimitChannel::Current,
                ratio(f64::from(sample.current), f64::from(self.current_max)),
            ),
            (
                LimitChannel::TendonForce,
                ratio(
                    f64::from(sample.force_tendon),
                    f64::from(self.force_tendon_max),
                ),
            ),
            (
                LimitChannel::TipForce,
                ratio(f64::from(sample.force_tip), f64::from(self.force_tip_max)),
            ),
            (
                LimitChannel::Position,
                ratio(f64::from(sample.position) - centre, half_span),
            ),
        ]
        .into_iter()
        .fold((LimitChannel::Current, f64::MIN), |worst, next| {
            if next.1 > worst.1 {
                next
            } else {
                worst
            }
        })
    }
}

// =============================================================================
// Local Command Ranges
// =============================================================================

/// Ranges a device handle checks before sending a setpoint to the wire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandBounds {
    /// Lowest position setpoint in counts.
    pub position_min: i32,
    /// Highest position setpoint in counts.
    pub position_max: i32,
    /// Largest velocity setpoint magnitude in RPM.
    pub velocity_max_rpm: i32,
    /// Largest torque setpoint magnitude in mNm (gearbox rating).
    pub torque_max_mnm: i32,
    /// Largest current setpoint magnitude in mA.
    pub current_max_ma: i32,
}

impl Default for CommandBounds {
    fn default() -> Self {
        Self::from_limits(&DeviceLimits::default())
    }
}

impl CommandBounds {
    /// Derive command ranges from a safety envelope.
    pub fn from_limits(limits: &DeviceLimits) -> Self {
        Self {
            position_min: limits.position_min,
            position_max: limits.position_max,
            velocity_max_rpm: 3_000,
            torque_max_mnm: 3_300,
            current_max_ma: i32::try_from(limits.current_max).unwrap_or(i32::MAX),
        }
    }

    /// Reject a position outside `[position_min, position_max]`.
    pub fn check_position(&self, counts: i32) -> DeviceResult<()> {
        if counts < self.position_min || counts > self.position_max {
            return Err(DeviceError::rejected(
                "set_position",
                format!(
                    "{} outside [{}, {}] counts",
                    counts, self.position_min, self.position_max
                ),
            ));
        }
        Ok(())
    }

    /// Reject a velocity whose magnitude exceeds `velocity_max_rpm`.
    pub fn check_velocity(&self, rpm: i32) -> DeviceResult<()> {
        check_magnitude("set_velocity", rpm, self.velocity_max_rpm, "RPM")
    }

    /// Reject a torque whose magnitude exceeds `torque_max_mnm`.
    pub fn check_torque(&self, mnm: i32) -> DeviceResult<()> {
        check_magnitude("set_torque", mnm, self.torque_max_mnm, "mNm")
    }

    /// Reject a current whose magnitude exceeds `current_max_ma`.
    pub fn check_current(&self, ma: i32) -> DeviceResult<()> {
        check_magnitude("set_current", ma, self.current_max_ma, "mA")
    }
}

fn check_magnitude(command: &str, value: i32, max: i32, unit: &str) -> DeviceResult<()> {
    if value.unsigned_abs() > max.unsigned_abs() {
        return Err(DeviceError::rejected(
            command,
            format!("|{}| exceeds {} {}", value, max, unit),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SensorSample {
        SensorSample {
            timestamp: 1.0,
            position: 5_000,
            velocity: 0,
            current: 100,
            force_tendon: 1_000,
            force_tip: 700,
            angle_joint: 0,
        }
    }

    #[test]
    fn nominal_sample_passes() {
        assert!(DeviceLimits::default().check(&sample()).is_none());
    }

    #[test]
    fn current_is_checked_before_position() {
        let limits = DeviceLimits::default();
        let mut s = sample();
        s.current = 1_500;
        s.position = 20_000;
        let v = limits.check(&s).unwrap();
        assert_eq!(v.channel, LimitChannel::Current);
        assert_eq!(v.limit, 1_000);
    }

    #[test]
    fn force_channels_enforced_independently() {
        let limits = DeviceLimits::default();
        let mut s = sample();
        s.force_tip = -25_000;
        assert_eq!(limits.check(&s).unwrap().channel, LimitChannel::TipForce);

        let mut s = sample();
        s.force_tendon = 250_000;
        assert_eq!(limits.check(&s).unwrap().channel, LimitChannel::TendonForce);
    }

    #[test]
    fn position_below_minimum() {
        let mut s = sample();
        s.position = -1;
        let v = DeviceLimits::default().check(&s).unwrap();
        assert_eq!(v.channel, LimitChannel::Position);
        assert_eq!(v.limit, 0);
    }

    #[test]
    fn clear_band_is_tighter_than_limit() {
        let limits = DeviceLimits::default();
        let mut s = sample();
        s.current = 950;
        assert!(limits.check(&s).is_none());
        assert!(!limits.is_clear(&s, 0.9));
        s.current = 900;
        assert!(limits.is_clear(&s, 0.9));

        let mut s = sample();
        s.position = 9_700;
        assert!(!limits.is_clear(&s, 0.9));
        s.position = 9_400;
        assert!(limits.is_clear(&s, 0.9));
    }

    #[test]
    fn worst_ratio_picks_highest_channel() {
        let limits = DeviceLimits::default();
        let mut s = sample();
        s.force_tip = 18_000;
        let (channel, ratio) = limits.worst_ratio(&s);
        assert_eq!(channel, LimitChannel::TipForce);
        assert!((ratio - 0.9).abs() < 1e-9);
    }

    #[test]
    fn command_bounds_reject_out_of_range() {
        let bounds = CommandBounds::default();
        assert!(bounds.check_position(10_000).is_ok());
        assert!(bounds.check_position(10_001).is_err());
        assert!(bounds.check_current(-1_000).is_ok());
        assert!(bounds.check_current(1_001).is_err());
        assert!(bounds.check_torque(3_301).is_err());
        assert!(bounds.check_velocity(-3_000).is_ok());
    }
}
