//! Sensor sample type shared by every backend and consumer.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One reading of every sensor on the rig, taken in a single transaction.
///
/// Backends must fill every field in the declared units. Samples are `Copy`,
/// so each consumer owns its own value and nothing downstream shares a
/// mutable buffer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    /// Monotonic device time in seconds.
    pub timestamp: f64,
    /// Encoder position in counts.
    pub position: i32,
    /// Motor velocity in RPM.
    pub velocity: i32,
    /// Motor current in milliamps.
    pub current: u32,
    /// Tendon load cell force in millinewtons.
    pub force_tendon: i32,
    /// Fingertip load cell force in millinewtons.
    pub force_tip: i32,
    /// Joint angle in centidegrees.
    pub angle_joint: i32,
}

impl SensorSample {
    /// Motor current in amps.
    pub fn current_amps(&self) -> f64 {
        f64::from(self.current) / 1000.0
    }

    /// Tip force in newtons.
    pub fn force_tip_newtons(&self) -> f64 {
        f64::from(self.force_tip) / 1000.0
    }

    /// Tendon force in newtons.
    pub fn force_tendon_newtons(&self) -> f64 {
        f64::from(self.force_tendon) / 1000.0
    }

    /// Field-wise mean of a batch of samples, rounded to the integer units.
    ///
    /// The timestamp of the result is the timestamp of the last sample.
    /// Returns `None` for an empty batch.
    pub fn mean(samples: &[SensorSample]) -> Option<SensorSample> {
        let last = samples.last()?;
        let n = samples.len() as f64;
        let avg = |f: fn(&SensorSample) -> f64| samples.iter().map(f).sum::<f64>() / n;

        Some(SensorSample {
            timestamp: last.timestamp,
            position: avg(|s| f64::from(s.position)).round() as i32,
            velocity: avg(|s| f64::from(s.velocity)).round() as i32,
            current: avg(|s| f64::from(s.current)).round() as u32,
            force_tendon: avg(|s| f64::from(s.force_tendon)).round() as i32,
            force_tip: avg(|s| f64::from(s.force_tip)).round() as i32,
            angle_joint: avg(|s| f64::from(s.angle_joint)).round() as i32,
        })
    }
}

/// A sample as delivered to logging sinks, tagged with the active run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaggedSample {
    /// Identifier of the test run active when the sample was taken, if any.
    pub run_id: Option<Uuid>,
    /// The sample itself.
    pub sample: SensorSample,
}
