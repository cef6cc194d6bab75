//! Tip stiffness from force/displacement pairs at a held position.

use super::{position_within, secs, Protocol, TestResult};
use crate::analysis::{linear_fit, max, LinearFit};
use crate::context::{RunContext, RunError};
use crate::params::{ConfigValidationError, ParamSpec, TestConfig};
use crate::state::WarningKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tendon_core::DeviceLimits;
use tracing::info;

/// Fits below this coefficient of determination are flagged.
const POOR_FIT_R_SQUARED: f64 = 0.9;

pub(super) const SCHEMA: &[ParamSpec] = &[
    ParamSpec::int("test_position", 0, 100_000, 5_000, Some("counts"), "Position held during the test"),
    ParamSpec::float("settle_s", 0.5, 10.0, 2.0, "s", "Wait after reaching the position"),
    ParamSpec::float("hold_s", 1.0, 120.0, 10.0, "s", "Recording time"),
    ParamSpec::float("sample_rate_hz", 1.0, 100.0, 10.0, "Hz", "Recording rate"),
];

/// Typed stiffness configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StiffnessConfig {
    /// Held position.
    pub test_position: i32,
    /// Wait after reaching the position.
    pub settle: Duration,
    /// Recording time.
    pub hold: Duration,
    /// Recording rate in Hz.
    pub sample_rate_hz: f64,
}

impl StiffnessConfig {
    /// Build from a validated parameter map, checking against the rig limits.
    pub fn from_params(
        params: &TestConfig,
        limits: &DeviceLimits,
    ) -> Result<Self, ConfigValidationError> {
        Ok(Self {
            test_position: position_within("test_position", params.int("test_position")?, limits)?,
            settle: secs(params.float("settle_s")?),
            hold: secs(params.float("hold_s")?),
            sample_rate_hz: params.float("sample_rate_hz")?,
        })
    }

    fn readings(&self) -> usize {
        ((self.hold.as_secs_f64() * self.sample_rate_hz).round() as usize).max(2)
    }

    /// Expected run time.
    pub fn estimate_duration(&self) -> Duration {
        self.settle + self.hold
    }
}

/// One recorded pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StiffnessPoint {
    /// Seconds since recording began.
    pub time_s: f64,
    /// Deflection from the settled position, in counts.
    pub displacement: i32,
    /// Tip force in N.
    pub force_n: f64,
}

/// Stiffness result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StiffnessResult {
    /// Recorded pairs.
    pub points: Vec<StiffnessPoint>,
    /// Force against displacement fit; `None` when no displacement was seen.
    pub fit: Option<LinearFit>,
    /// Fitted slope in N per count.
    pub stiffness_n_per_count: Option<f64>,
    /// Coefficient of determination of the fit.
    pub r_squared: Option<f64>,
    /// Largest deflection magnitude in counts.
    pub max_displacement: i32,
    /// Largest tip force in N.
    pub max_force_n: f64,
}

#[async_trait]
impl Protocol for StiffnessConfig {
    async fn execute(&self, ctx: &mut RunContext<'_>) -> Result<TestResult, RunError> {
        ctx.phase("positioning");
        ctx.set_position(self.test_position).await?;
        ctx.wait(self.settle).await?;
        ctx.checkpoint().await?;
        let baseline = ctx.read().await?;
        ctx.report(0.0, format!("holding at {} counts", baseline.position));

        ctx.phase("recording");
        let count = self.readings();
        let interval = Duration::from_secs_f64(1.0 / self.sample_rate_hz);
        let mut points = Vec::with_capacity(count);
        for i in 0..count {
            if i > 0 {
                ctx.wait(interval).await?;
            }
            let sample = ctx.read().await?;
            points.push(StiffnessPoint {
                time_s: sample.timestamp - baseline.timestamp,
                displacement: sample.position - baseline.position,
                force_n: sample.force_tip_newtons(),
            });
            if (i + 1) % 10 == 0 || i + 1 == count {
                ctx.report((i + 1) as f64 / count as f64, format!("{} points recorded", i + 1));
            }
        }

        let pairs: Vec<(f64, f64)> = points
            .iter()
            .map(|p| (f64::from(p.displacement), p.force_n))
            .collect();
        let fit = linear_fit(&pairs);
        match fit {
            None => ctx.warn(
                WarningKind::Measurement,
                "no displacement observed; stiffness is undefined",
                ctx.last_sample(),
            ),
            Some(f) if f.r_squared < POOR_FIT_R_SQUARED => ctx.warn(
                WarningKind::Measurement,
                format!("poor stiffness fit (R² = {:.3})", f.r_squared),
                None,
            ),
            Some(_) => {}
        }

        let displacements: Vec<f64> = points.iter().map(|p| f64::from(p.displacement.abs())).collect();
        let forces: Vec<f64> = points.iter().map(|p| p.force_n).collect();
        let result = StiffnessResult {
            stiffness_n_per_count: fit.map(|f| f.slope),
            r_squared: fit.map(|f| f.r_squared),
            fit,
            max_displacement: max(&displacements).unwrap_or(0.0) as i32,
            max_force_n: max(&forces).unwrap_or(0.0),
            points,
        };
        info!(
            run_id = %ctx.run_id(),
            stiffness = ?result.stiffness_n_per_count,
            r_squared = ?result.r_squared,
            "Stiffness test complete"
        );
        Ok(TestResult::Stiffness(result))
    }
}
