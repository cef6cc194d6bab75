//! Backlash sweep: every target is approached from both sides.

use super::{position_within, secs, Protocol, TestResult};
use crate::analysis::{linspace, max, mean, min};
use crate::context::{RunContext, RunError};
use crate::params::{ConfigValidationError, ParamSpec, TestConfig};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tendon_core::DeviceLimits;
use tracing::info;

pub(super) const SCHEMA: &[ParamSpec] = &[
    ParamSpec::int("position_min", 0, 100_000, 1_000, Some("counts"), "Lowest target"),
    ParamSpec::int("position_max", 0, 100_000, 9_000, Some("counts"), "Highest target"),
    ParamSpec::int("test_points", 3, 50, 10, None, "Number of targets"),
    ParamSpec::int("approach_offset", 10, 2_000, 500, Some("counts"), "Distance of each approach start from the target"),
    ParamSpec::float("settle_s", 0.1, 10.0, 1.0, "s", "Wait after every move"),
];

/// Typed hysteresis configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HysteresisConfig {
    /// Targets in visiting order.
    pub targets: Vec<i32>,
    /// Approach distance.
    pub approach_offset: i32,
    /// Wait after every move.
    pub settle: Duration,
    /// Lowest commandable position.
    pub floor: i32,
    /// Highest commandable position.
    pub ceiling: i32,
}

impl HysteresisConfig {
    /// Build from a validated parameter map, checking against the rig limits.
    pub fn from_params(
        params: &TestConfig,
        limits: &DeviceLimits,
    ) -> Result<Self, ConfigValidationError> {
        let low = position_within("position_min", params.int("position_min")?, limits)?;
        let high = position_within("position_max", params.int("position_max")?, limits)?;
        if high <= low {
            return Err(ConfigValidationError::Inconsistent(
                "position_max must be greater than position_min".into(),
            ));
        }
        let points = params.int("test_points")? as usize;
        Ok(Self {
            targets: linspace(f64::from(low), f64::from(high), points)
                .into_iter()
                .map(|p| p.round() as i32)
                .collect(),
            approach_offset: params.int("approach_offset")? as i32,
            settle: secs(params.float("settle_s")?),
            floor: limits.position_min,
            ceiling: limits.position_max,
        })
    }

    /// Start positions for the two approaches to `target`, clamped to the limits.
    pub fn approaches(&self, target: i32) -> (i32, i32) {
        let below = target.saturating_sub(self.approach_offset).max(self.floor);
        let above = target.saturating_add(self.approach_offset).min(self.ceiling);
        (below, above)
    }

    /// Expected run time: four settled moves per target.
    pub fn estimate_duration(&self) -> Duration {
        self.settle * 4 * self.targets.len() as u32
    }
}

/// Measurements at one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HysteresisPoint {
    /// Commanded target.
    pub target: i32,
    /// Position reached when approaching from below.
    pub from_below: i32,
    /// Position reached when approaching from above.
    pub from_above: i32,
    /// `|from_above - from_below|` in counts.
    pub backlash: i32,
    /// Tendon force after the approach from below, in N.
    pub force_from_below_n: f64,
    /// Tendon force after the approach from above, in N.
    pub force_from_above_n: f64,
}

/// Backlash sweep result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HysteresisResult {
    /// Per-target series.
    pub points: Vec<HysteresisPoint>,
    /// Mean backlash in counts.
    pub mean_backlash: f64,
    /// Largest backlash in counts.
    pub max_backlash: i32,
    /// Smallest backlash in counts.
    pub min_backlash: i32,
}

impl HysteresisResult {
    fn from_points(points: Vec<HysteresisPoint>) -> Self {
        let backlash: Vec<f64> = points.iter().map(|p| f64::from(p.backlash)).collect();
        Self {
            mean_backlash: mean(&backlash).unwrap_or(0.0),
            max_backlash: max(&backlash).unwrap_or(0.0) as i32,
            min_backlash: min(&backlash).unwrap_or(0.0) as i32,
            points,
        }
    }
}

#[async_trait]
impl Protocol for HysteresisConfig {
    async fn execute(&self, ctx: &mut RunContext<'_>) -> Result<TestResult, RunError> {
        let total = self.targets.len();
        let mut points = Vec::with_capacity(total);

        for (i, &target) in self.targets.iter().enumerate() {
            ctx.checkpoint().await?;
            let (below, above) = self.approaches(target);

            ctx.phase(&format!("target {target} from below"));
            ctx.set_position(below).await?;
            ctx.wait(self.settle).await?;
            ctx.set_position(target).await?;
            ctx.wait(self.settle).await?;
            let low = ctx.read().await?;

            ctx.phase(&format!("target {target} from above"));
            ctx.set_position(above).await?;
            ctx.wait(self.settle).await?;
            ctx.set_position(target).await?;
            ctx.wait(self.settle).await?;
            let high = ctx.read().await?;

            let backlash = (high.position - low.position).abs();
            points.push(HysteresisPoint {
                target,
                from_below: low.position,
                from_above: high.position,
                backlash,
                force_from_below_n: low.force_tendon_newtons(),
                force_from_above_n: high.force_tendon_newtons(),
            });
            ctx.report(
                (i + 1) as f64 / total as f64,
                format!("target {target}: backlash {backlash} counts"),
            );
        }

        let result = HysteresisResult::from_points(points);
        info!(
            run_id = %ctx.run_id(),
            mean = result.mean_backlash,
            max = result.max_backlash,
            "Hysteresis sweep complete"
        );
        Ok(TestResult::Hysteresis(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::validate;

    fn config(raw: TestConfig, limits: &DeviceLimits) -> Result<HysteresisConfig, ConfigValidationError> {
        HysteresisConfig::from_params(&validate(SCHEMA, &raw)?, limits)
    }

    #[test]
    fn approaches_are_clamped_to_limits() {
        let raw = TestConfig::new()
            .with("position_min", 0_i64)
            .with("position_max", 10_000_i64)
            .with("test_points", 3_i64);
        let c = config(raw, &DeviceLimits::default()).unwrap();
        assert_eq!(c.targets, vec![0, 5_000, 10_000]);
        assert_eq!(c.approaches(0), (0, 500));
        assert_eq!(c.approaches(5_000), (4_500, 5_500));
        assert_eq!(c.approaches(10_000), (9_500, 10_000));
    }

    #[test]
    fn targets_outside_limits_are_rejected() {
        let limits = DeviceLimits {
            position_max: 5_000,
            ..DeviceLimits::default()
        };
        assert!(config(TestConfig::new(), &limits).is_err());
        let raw = TestConfig::new().with("position_min", 3_000_i64).with("position_max", 2_000_i64);
        assert!(config(raw, &DeviceLimits::default()).is_err());
    }

    #[test]
    fn summary_over_points() {
        let point = |target, backlash| HysteresisPoint {
            target,
            from_below: target - backlash / 2,
            from_above: target + backlash / 2,
            backlash,
            force_from_below_n: 0.0,
            force_from_above_n: 0.0,
        };
        let r = HysteresisResult::from_points(vec![point(1_000, 10), point(2_000, 30), point(3_000, 20)]);
        assert_eq!(r.max_backlash, 30);
        assert_eq!(r.min_backlash, 10);
        assert!((r.mean_backlash - 20.0).abs() < 1e-12);
    }
}
