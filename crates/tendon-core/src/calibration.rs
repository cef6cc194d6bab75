//! Load-cell and encoder calibration records.
//!
//! A load cell is calibrated in two steps: capture the raw reading with no load
//! (`zero_offset`), then hang a reference weight and derive `scale_factor` in
//! newtons per raw count. The encoder channel stores a zero offset and a
//! centidegrees-per-count scale.

use crate::mechanics::GRAVITY;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Default encoder resolution for the joint encoder.
pub const DEFAULT_ENCODER_COUNTS_PER_REV: u32 = 4096;

/// Calibration failures.
#[derive(Error, Debug)]
pub enum CalibrationError {
    /// Reference reading equals the zero reading, so no scale can be derived.
    #[error("reference reading equals zero offset ({0}); is the weight attached?")]
    ZeroDelta(f64),

    /// Reference weight must be positive.
    #[error("reference weight must be positive, got {0} kg")]
    InvalidWeight(f64),

    /// Encoder resolution must be positive.
    #[error("encoder counts per revolution must be positive")]
    InvalidResolution,

    /// The channel kind does not match the requested operation.
    #[error("channel {0} is not a {1}")]
    WrongChannel(SensorChannel, &'static str),

    /// Persistence failed.
    #[error("calibration I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored record could not be parsed.
    #[error("calibration record is malformed: {0}")]
    Format(#[from] serde_json::Error),
}

/// Sensor channel a record applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorChannel {
    /// Load cell in series with the tendon.
    TendonLoadCell,
    /// Load cell under the fingertip.
    TipLoadCell,
    /// Joint angle encoder.
    JointEncoder,
}

impl SensorChannel {
    /// Stable identifier, used as the stored file stem.
    pub fn id(&self) -> &'static str {
        match self {
            SensorChannel::TendonLoadCell => "tendon_load_cell",
            SensorChannel::TipLoadCell => "tip_load_cell",
            SensorChannel::JointEncoder => "joint_encoder",
        }
    }

    fn is_load_cell(&self) -> bool {
        matches!(
            self,
            SensorChannel::TendonLoadCell | SensorChannel::TipLoadCell
        )
    }
}

impl std::fmt::Display for SensorChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// Scale and offset for one sensor channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    /// Channel this record calibrates.
    pub channel: SensorChannel,
    /// Raw reading that corresponds to zero.
    pub zero_offset: f64,
    /// Engineering units per raw count (N/count or centidegrees/count).
    pub scale_factor: f64,
    /// When the calibration was performed.
    pub timestamp: DateTime<Utc>,
    /// Reference weight used for a load cell, in kilograms.
    pub reference_weight_kg: Option<f64>,
}

impl CalibrationRecord {
    /// Derive a load-cell calibration from a zero reading and a reading taken
    /// with `weight_kg` hanging from the cell.
    pub fn load_cell(
        channel: SensorChannel,
        zero_raw: f64,
        reference_raw: f64,
        weight_kg: f64,
    ) -> Result<Self, CalibrationError> {
        if !channel.is_load_cell() {
            return Err(CalibrationError::WrongChannel(channel, "load cell"));
        }
        if weight_kg <= 0.0 {
            return Err(CalibrationError::InvalidWeight(weight_kg));
        }
        let delta = reference_raw - zero_raw;
        if delta == 0.0 {
            return Err(CalibrationError::ZeroDelta(zero_raw));
        }

        Ok(Self {
            channel,
            zero_offset: zero_raw,
            scale_factor: weight_kg * GRAVITY / delta,
            timestamp: Utc::now(),
            reference_weight_kg: Some(weight_kg),
        })
    }

    /// Encoder calibration with the given zero and resolution.
    pub fn encoder(zero_counts: i64, counts_per_rev: u32) -> Result<Self, CalibrationError> {
        if counts_per_rev == 0 {
            return Err(CalibrationError::InvalidResolution);
        }
        Ok(Self {
            channel: SensorChannel::JointEncoder,
            zero_offset: zero_counts as f64,
            scale_factor: 36_000.0 / f64::from(counts_per_rev),
            timestamp: Utc::now(),
            reference_weight_kg: None,
        })
    }

    /// Identity record: raw counts are already in engineering units.
    pub fn identity(channel: SensorChannel) -> Self {
        Self {
            channel,
            zero_offset: 0.0,
            scale_factor: 1.0,
            timestamp: Utc::now(),
            reference_weight_kg: None,
        }
    }

    /// Apply the record to a raw reading.
    pub fn apply(&self, raw: f64) -> f64 {
        (raw - self.zero_offset) * self.scale_factor
    }

    /// Load-cell force in newtons for a raw reading.
    pub fn force_newtons(&self, raw: f64) -> f64 {
        self.apply(raw)
    }

    /// Mass equivalent in kilograms for a raw load-cell reading.
    pub fn weight_kg(&self, raw: f64) -> f64 {
        self.apply(raw) / GRAVITY
    }

    /// Joint angle in centidegrees, wrapped into one revolution.
    pub fn angle_centidegrees(&self, raw_counts: i64) -> f64 {
        self.apply(raw_counts as f64).rem_euclid(36_000.0)
    }
}

/// All calibration records for a rig, keyed by channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSet {
    records: BTreeMap<SensorChannel, CalibrationRecord>,
}

impl CalibrationSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the record for its channel.
    pub fn insert(&mut self, record: CalibrationRecord) {
        self.records.insert(record.channel, record);
    }

    /// Record for `channel`, if calibrated.
    pub fn get(&self, channel: SensorChannel) -> Option<&CalibrationRecord> {
        self.records.get(&channel)
    }

    /// Number of calibrated channels.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True if no channel is calibrated.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Convert a raw load-cell reading to millinewtons.
    ///
    /// Uncalibrated channels pass the raw value through unchanged.
    pub fn force_mn(&self, channel: SensorChannel, raw: i32) -> i32 {
        match self.get(channel) {
            Some(record) => (record.force_newtons(f64::from(raw)) * 1_000.0).round() as i32,
            None => raw,
        }
    }

    /// Convert a raw encoder reading to centidegrees.
    ///
    /// An uncalibrated encoder passes the raw value through unchanged.
    pub fn angle(&self, raw: i32) -> i32 {
        match self.get(SensorChannel::JointEncoder) {
            Some(record) => record.angle_centidegrees(i64::from(raw)).round() as i32,
            None => raw,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_reading_reproduces_reference_weight() {
        let record =
            CalibrationRecord::load_cell(SensorChannel::TipLoadCell, 812.0, 41_377.0, 1.2)
                .unwrap();
        assert!((record.weight_kg(41_377.0) - 1.2).abs() < 1e-9);
        assert!(record.force_newtons(812.0).abs() < 1e-12);
    }

    #[test]
    fn zero_delta_is_rejected() {
        let err = CalibrationRecord::load_cell(SensorChannel::TipLoadCell, 500.0, 500.0, 1.0)
            .unwrap_err();
        assert!(matches!(err, CalibrationError::ZeroDelta(_)));
    }

    #[test]
    fn encoder_is_not_a_load_cell() {
        let err = CalibrationRecord::load_cell(SensorChannel::JointEncoder, 0.0, 1.0, 1.0)
            .unwrap_err();
        assert!(matches!(err, CalibrationError::WrongChannel(..)));
    }

    #[test]
    fn encoder_wraps_negative_counts() {
        let record = CalibrationRecord::encoder(0, 4096).unwrap();
        assert!((record.angle_centidegrees(1024) - 9_000.0).abs() < 1e-9);
        assert!((record.angle_centidegrees(-1024) - 27_000.0).abs() < 1e-9);
        assert!((record.angle_centidegrees(4096 + 2048) - 18_000.0).abs() < 1e-9);
    }

    #[test]
    fn set_passes_through_uncalibrated_channels() {
        let mut set = CalibrationSet::new();
        assert_eq!(set.force_mn(SensorChannel::TendonLoadCell, 1234), 1234);

        set.insert(
            CalibrationRecord::load_cell(SensorChannel::TendonLoadCell, 100.0, 1_100.0, 1.0)
                .unwrap(),
        );
        // 1000 counts per 9.81 N
        assert_eq!(set.force_mn(SensorChannel::TendonLoadCell, 1_100), 9_810);
        assert_eq!(set.force_mn(SensorChannel::TipLoadCell, 77), 77);
    }
}
