//! Static force hold with closed-loop current correction.

use super::{secs, Protocol, TestResult};
use crate::analysis::{max, mean, std_dev};
use crate::context::{RunContext, RunError};
use crate::params::{ConfigValidationError, ParamSpec, TestConfig};
use crate::state::WarningKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tendon_core::mechanics::{current_for_tip_force_ma, tip_force_per_ma_mn, TIP_FORCE_RATIO};
use tendon_core::DeviceLimits;
use tracing::info;

/// Highest tip force the hold test will target, in N.
pub const MAX_TARGET_FORCE_N: f64 = 20.0;

pub(super) const SCHEMA: &[ParamSpec] = &[
    ParamSpec::float("target_force_n", 0.5, MAX_TARGET_FORCE_N, 8.0, "N", "Tip force to hold"),
    ParamSpec::float("duration_min", 0.1, 120.0, 30.0, "min", "Hold duration"),
    ParamSpec::float("sample_interval_s", 0.1, 10.0, 1.0, "s", "Spacing of readings"),
    ParamSpec::float("force_tolerance_pct", 1.0, 50.0, 10.0, "%", "Force error that raises a warning"),
    ParamSpec::int("max_drift_counts", 10, 5_000, 100, Some("counts"), "Position drift that raises a warning"),
    ParamSpec::float("correction_gain", 0.0, 1.0, 0.5, "", "Fraction of the force error corrected per reading"),
    ParamSpec::float("settle_s", 0.5, 10.0, 2.0, "s", "Wait after applying the initial current"),
];

/// Typed static hold configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoldConfig {
    /// Target tip force in N.
    pub target_force_n: f64,
    /// Open-loop current for the target force, in mA.
    pub target_current_ma: f64,
    /// Hold duration.
    pub duration: Duration,
    /// Reading spacing.
    pub sample_interval: Duration,
    /// Warning threshold on relative force error, in percent.
    pub force_tolerance_pct: f64,
    /// Warning threshold on position drift, in counts.
    pub max_drift_counts: i32,
    /// Correction gain.
    pub correction_gain: f64,
    /// Wait after the initial current.
    pub settle: Duration,
    /// Ceiling on any current command, in mA.
    pub current_ceiling_ma: f64,
}

impl HoldConfig {
    /// Build from a validated parameter map, checking against the rig limits.
    pub fn from_params(
        params: &TestConfig,
        limits: &DeviceLimits,
    ) -> Result<Self, ConfigValidationError> {
        let target_force_n = params.float("target_force_n")?.min(MAX_TARGET_FORCE_N);
        let target_current_ma = current_for_tip_force_ma(target_force_n);
        if target_current_ma > f64::from(limits.current_max) {
            return Err(ConfigValidationError::Inconsistent(format!(
                "{target_force_n} N needs {target_current_ma:.0} mA, above the {} mA current limit",
                limits.current_max
            )));
        }
        if target_force_n * 1_000.0 >= f64::from(limits.force_tip_max) {
            return Err(ConfigValidationError::Inconsistent(format!(
                "{target_force_n} N is at or above the {} mN tip force limit",
                limits.force_tip_max
            )));
        }
        if target_force_n / TIP_FORCE_RATIO * 1_000.0 >= f64::from(limits.force_tendon_max) {
            return Err(ConfigValidationError::Inconsistent(format!(
                "{target_force_n} N needs a tendon force at or above the {} mN limit",
                limits.force_tendon_max
            )));
        }
        Ok(Self {
            target_force_n,
            target_current_ma,
            duration: secs(params.float("duration_min")? * 60.0),
            sample_interval: secs(params.float("sample_interval_s")?),
            force_tolerance_pct: params.float("force_tolerance_pct")?,
            max_drift_counts: params.int("max_drift_counts")? as i32,
            correction_gain: params.float("correction_gain")?,
            settle: secs(params.float("settle_s")?),
            current_ceiling_ma: f64::from(limits.current_max),
        })
    }

    fn readings(&self) -> usize {
        let ratio = self.duration.as_secs_f64() / self.sample_interval.as_secs_f64();
        (ratio.round() as usize).max(1)
    }

    /// Next current command after measuring `force_n`.
    pub fn corrected_current(&self, command_ma: f64, force_n: f64) -> f64 {
        let error_mn = (self.target_force_n - force_n) * 1_000.0;
        let step = self.correction_gain * error_mn / tip_force_per_ma_mn();
        (command_ma + step).clamp(0.0, self.current_ceiling_ma)
    }

    /// Expected run time.
    pub fn estimate_duration(&self) -> Duration {
        self.settle + self.duration
    }
}

/// One reading during the hold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HoldSample {
    /// Seconds since the hold began.
    pub time_s: f64,
    /// Tip force in N.
    pub force_n: f64,
    /// Relative force error in percent.
    pub force_error_pct: f64,
    /// Position change since the hold began, in counts.
    pub drift: i32,
    /// Measured current in mA.
    pub current_ma: f64,
    /// Current commanded after this reading, in mA.
    pub command_ma: i32,
}

/// Aggregate figures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoldSummary {
    /// Mean tip force in N.
    pub mean_force_n: f64,
    /// Standard deviation of tip force in N.
    pub force_std_n: f64,
    /// Largest relative force error in percent.
    pub max_force_error_pct: f64,
    /// Largest drift magnitude in counts.
    pub max_drift: i32,
    /// Mean measured current in mA.
    pub mean_current_ma: f64,
    /// Readings outside the force tolerance.
    pub force_warnings: usize,
    /// Readings beyond the drift bound.
    pub drift_warnings: usize,
}

/// Static hold result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoldResult {
    /// Target tip force in N.
    pub target_force_n: f64,
    /// Open-loop current for the target, in mA.
    pub target_current_ma: f64,
    /// Readings in order.
    pub samples: Vec<HoldSample>,
    /// Aggregates.
    pub summary: HoldSummary,
}

fn summarize(samples: &[HoldSample], force_warnings: usize, drift_warnings: usize) -> HoldSummary {
    let forces: Vec<f64> = samples.iter().map(|s| s.force_n).collect();
    let errors: Vec<f64> = samples.iter().map(|s| s.force_error_pct).collect();
    let drifts: Vec<f64> = samples.iter().map(|s| f64::from(s.drift.abs())).collect();
    let currents: Vec<f64> = samples.iter().map(|s| s.current_ma).collect();
    HoldSummary {
        mean_force_n: mean(&forces).unwrap_or(0.0),
        force_std_n: std_dev(&forces).unwrap_or(0.0),
        max_force_error_pct: max(&errors).unwrap_or(0.0),
        max_drift: max(&drifts).unwrap_or(0.0) as i32,
        mean_current_ma: mean(&currents).unwrap_or(0.0),
        force_warnings,
        drift_warnings,
    }
}

#[async_trait]
impl Protocol for HoldConfig {
    async fn execute(&self, ctx: &mut RunContext<'_>) -> Result<TestResult, RunError> {
        ctx.phase("loading");
        let mut command_ma = self.target_current_ma.min(self.current_ceiling_ma);
        let mut sent = command_ma.round() as i32;
        ctx.set_current(sent).await?;
        ctx.wait(self.settle).await?;
        let origin = ctx.read().await?;
        ctx.report(
            0.0,
            format!(
                "holding {:.2} N at {sent} mA (measured {:.2} N)",
                self.target_force_n,
                origin.force_tip_newtons()
            ),
        );

        ctx.phase("holding");
        let count = self.readings();
        let mut samples = Vec::with_capacity(count);
        let (mut force_warnings, mut drift_warnings) = (0, 0);
        for i in 0..count {
            ctx.checkpoint().await?;
            if i > 0 {
                ctx.wait(self.sample_interval).await?;
            }
            let sample = ctx.read().await?;
            let force_n = sample.force_tip_newtons();
            let force_error_pct = (force_n - self.target_force_n).abs() / self.target_force_n * 100.0;
            let drift = sample.position - origin.position;

            if force_error_pct > self.force_tolerance_pct {
                force_warnings += 1;
                ctx.warn(
                    WarningKind::ForceTolerance,
                    format!(
                        "force {force_n:.2} N is {force_error_pct:.1}% from target {:.2} N",
                        self.target_force_n
                    ),
                    Some(sample),
                );
            }
            if drift.abs() > self.max_drift_counts {
                drift_warnings += 1;
                ctx.warn(
                    WarningKind::PositionDrift,
                    format!("position drifted {drift} counts"),
                    Some(sample),
                );
            }

            command_ma = self.corrected_current(command_ma, force_n);
            let next = command_ma.round() as i32;
            if next != sent {
                ctx.set_current(next).await?;
                sent = next;
            }

            samples.push(HoldSample {
                time_s: sample.timestamp - origin.timestamp,
                force_n,
                force_error_pct,
                drift,
                current_ma: f64::from(sample.current),
                command_ma: sent,
            });
            ctx.report(
                (i + 1) as f64 / count as f64,
                format!("{force_n:.2} N, drift {drift} counts"),
            );
        }

        ctx.phase("unloading");
        ctx.set_current(0).await?;
        ctx.wait(self.settle).await?;

        let summary = summarize(&samples, force_warnings, drift_warnings);
        info!(
            run_id = %ctx.run_id(),
            mean_force_n = summary.mean_force_n,
            max_error_pct = summary.max_force_error_pct,
            max_drift = summary.max_drift,
            "Static hold complete"
        );
        Ok(TestResult::StaticHold(HoldResult {
            target_force_n: self.target_force_n,
            target_current_ma: self.target_current_ma,
            samples,
            summary,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::validate;

    fn config(raw: TestConfig) -> Result<HoldConfig, ConfigValidationError> {
        HoldConfig::from_params(&validate(SCHEMA, &raw)?, &DeviceLimits::default())
    }

    #[test]
    fn target_current_follows_the_mechanics() {
        let c = config(TestConfig::new().with("target_force_n", 7.0)).unwrap();
        // 7 N at the tip is 10 N of tendon, 100 mNm at the spool, 666.7 mA.
        assert!((c.target_current_ma - 666.666_666).abs() < 1e-3);
    }

    #[test]
    fn force_needing_more_than_the_current_limit_is_rejected() {
        // 11.8 N needs about 1124 mA.
        assert!(config(TestConfig::new().with("target_force_n", 11.8)).is_err());
        assert!(config(TestConfig::new().with("target_force_n", 25.0)).is_err());
    }

    #[test]
    fn correction_moves_toward_target_and_respects_the_ceiling() {
        let c = config(TestConfig::new().with("target_force_n", 7.0)).unwrap();
        let low = c.corrected_current(600.0, 6.0);
        assert!(low > 600.0);
        let high = c.corrected_current(700.0, 8.0);
        assert!(high < 700.0);
        assert_eq!(c.corrected_current(990.0, 0.0), 1_000.0);
        assert_eq!(c.corrected_current(10.0, 20.0), 0.0);
    }
}
