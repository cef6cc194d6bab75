//! Torque/efficiency ramp.

use super::{position_within, secs, Protocol, TestResult};
use crate::analysis::{linspace, max, mean};
use crate::context::{RunContext, RunError};
use crate::params::{ConfigValidationError, ParamSpec, TestConfig};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tendon_core::mechanics::{
    current_for_torque_ma, newtons_to_kg, tendon_force_for_torque_n, tip_velocity_m_s,
    SUPPLY_VOLTAGE_V, TIP_FORCE_RATIO,
};
use tendon_core::{DeviceLimits, SensorSample};
use tracing::info;

/// Settle allowance for the initial move to the start position.
const POSITIONING_TIME: Duration = Duration::from_secs(2);

pub(super) const SCHEMA: &[ParamSpec] = &[
    ParamSpec::float("torque_min_mnm", 0.0, 3_300.0, 0.0, "mNm", "First torque step"),
    ParamSpec::float("torque_max_mnm", 1.0, 3_300.0, 120.0, "mNm", "Peak torque step"),
    ParamSpec::int("steps", 2, 100, 10, None, "Number of torque steps"),
    ParamSpec::float("hold_s", 0.1, 30.0, 2.0, "s", "Measurement time at each step"),
    ParamSpec::float("settle_s", 0.0, 10.0, 0.5, "s", "Wait after each torque change"),
    ParamSpec::int("sample_interval_ms", 5, 1_000, 20, Some("ms"), "Spacing of readings during a hold"),
    ParamSpec::int("start_position", 0, 100_000, 0, Some("counts"), "Position taken before the ramp"),
    ParamSpec::flag("measure_efficiency", true, "Compute transmission efficiency"),
    ParamSpec::flag("ramp_down", false, "Repeat the steps in reverse after the peak"),
    ParamSpec::float("noise_floor_ma", 0.0, 100.0, 5.0, "mA", "Currents below this leave efficiency undefined"),
];

/// Typed torque ramp configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TorqueConfig {
    /// First step in mNm.
    pub torque_min_mnm: f64,
    /// Peak step in mNm.
    pub torque_max_mnm: f64,
    /// Steps on the way up.
    pub steps: usize,
    /// Measurement time per step.
    pub hold: Duration,
    /// Wait after each torque change.
    pub settle: Duration,
    /// Reading spacing during a hold.
    pub sample_interval: Duration,
    /// Position taken before the ramp.
    pub start_position: i32,
    /// Whether to compute efficiency.
    pub measure_efficiency: bool,
    /// Whether to ramp back down.
    pub ramp_down: bool,
    /// Current below which efficiency is undefined, in mA.
    pub noise_floor_ma: f64,
}

impl TorqueConfig {
    /// Build from a validated parameter map, checking against the rig limits.
    pub fn from_params(
        params: &TestConfig,
        limits: &DeviceLimits,
    ) -> Result<Self, ConfigValidationError> {
        let config = Self {
            torque_min_mnm: params.float("torque_min_mnm")?,
            torque_max_mnm: params.float("torque_max_mnm")?,
            steps: params.int("steps")? as usize,
            hold: secs(params.float("hold_s")?),
            settle: secs(params.float("settle_s")?),
            sample_interval: Duration::from_millis(params.int("sample_interval_ms")? as u64),
            start_position: position_within("start_position", params.int("start_position")?, limits)?,
            measure_efficiency: params.flag("measure_efficiency")?,
            ramp_down: params.flag("ramp_down")?,
            noise_floor_ma: params.float("noise_floor_ma")?,
        };

        if config.torque_max_mnm <= config.torque_min_mnm {
            return Err(ConfigValidationError::Inconsistent(
                "torque_max_mnm must be greater than torque_min_mnm".into(),
            ));
        }
        let peak_ma = current_for_torque_ma(config.torque_max_mnm);
        if peak_ma > f64::from(limits.current_max) {
            return Err(ConfigValidationError::Inconsistent(format!(
                "peak torque {:.0} mNm needs {:.0} mA, above the {} mA current limit",
                config.torque_max_mnm, peak_ma, limits.current_max
            )));
        }
        let tendon_mn = tendon_force_for_torque_n(config.torque_max_mnm) * 1_000.0;
        if tendon_mn >= f64::from(limits.force_tendon_max) {
            return Err(ConfigValidationError::Inconsistent(format!(
                "peak torque produces {:.0} mN tendon force, at or above the {} mN limit",
                tendon_mn, limits.force_tendon_max
            )));
        }
        if tendon_mn * TIP_FORCE_RATIO >= f64::from(limits.force_tip_max) {
            return Err(ConfigValidationError::Inconsistent(format!(
                "peak torque produces {:.0} mN tip force, at or above the {} mN limit",
                tendon_mn * TIP_FORCE_RATIO,
                limits.force_tip_max
            )));
        }
        Ok(config)
    }

    fn readings_per_step(&self) -> usize {
        let ratio = self.hold.as_secs_f64() / self.sample_interval.as_secs_f64();
        (ratio.round() as usize).max(1)
    }

    /// Every step in execution order.
    pub fn schedule(&self) -> Vec<(f64, RampDirection)> {
        let up = linspace(self.torque_min_mnm, self.torque_max_mnm, self.steps);
        let mut schedule: Vec<_> = up.iter().map(|&t| (t, RampDirection::Up)).collect();
        if self.ramp_down {
            schedule.extend(up.iter().rev().skip(1).map(|&t| (t, RampDirection::Down)));
        }
        schedule
    }

    /// Expected run time.
    pub fn estimate_duration(&self) -> Duration {
        let per_step = self.hold + self.settle;
        POSITIONING_TIME + per_step * self.schedule().len() as u32 + self.settle
    }
}

/// Which leg of the ramp a step belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RampDirection {
    /// Increasing torque.
    Up,
    /// Decreasing torque.
    Down,
}

/// Measurements at one torque step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TorqueStep {
    /// Zero-based step index in execution order.
    pub index: usize,
    /// Ramp leg.
    pub direction: RampDirection,
    /// Commanded torque in mNm.
    pub torque_mnm: i32,
    /// Current the commanded torque should draw, in mA.
    pub expected_current_ma: f64,
    /// Mean measured current in mA.
    pub current_ma: f64,
    /// Mean tip force in N.
    pub tip_force_n: f64,
    /// Tip force as a mass, in kg.
    pub tip_force_kg: f64,
    /// Mean tendon force in N.
    pub tendon_force_n: f64,
    /// Mean motor speed in RPM.
    pub velocity_rpm: f64,
    /// Mean position in counts.
    pub position: i32,
    /// Mechanical output over electrical input. `None` when undefined.
    pub efficiency: Option<f64>,
}

/// Aggregate figures over all steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TorqueSummary {
    /// Mean of the defined efficiencies.
    pub mean_efficiency: Option<f64>,
    /// Largest defined efficiency.
    pub max_efficiency: Option<f64>,
    /// Steps where efficiency was defined.
    pub efficiency_points: usize,
    /// Largest tip force in N.
    pub max_tip_force_n: f64,
    /// Largest tip force as a mass, in kg.
    pub max_tip_force_kg: f64,
    /// Largest measured current in mA.
    pub max_current_ma: f64,
    /// Largest tip force difference between the up and down legs at the same
    /// torque, when ramping down.
    pub ramp_hysteresis_n: Option<f64>,
}

/// Torque ramp result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TorqueResult {
    /// Per-step measurements.
    pub steps: Vec<TorqueStep>,
    /// Aggregates.
    pub summary: TorqueSummary,
}

/// Efficiency of a steady-state sample, or `None` below the current noise floor.
pub(crate) fn efficiency(sample: &SensorSample, noise_floor_ma: f64) -> Option<f64> {
    if f64::from(sample.current) < noise_floor_ma || sample.current == 0 {
        return None;
    }
    let output_w = sample.force_tip_newtons().abs() * tip_velocity_m_s(f64::from(sample.velocity)).abs();
    let input_w = SUPPLY_VOLTAGE_V * sample.current_amps();
    Some(output_w / input_w)
}

fn summarize(steps: &[TorqueStep]) -> TorqueSummary {
    let efficiencies: Vec<f64> = steps.iter().filter_map(|s| s.efficiency).collect();
    let forces: Vec<f64> = steps.iter().map(|s| s.tip_force_n).collect();
    let currents: Vec<f64> = steps.iter().map(|s| s.current_ma).collect();
    let max_tip_force_n = max(&forces).unwrap_or(0.0);

    let ramp_hysteresis_n = steps
        .iter()
        .filter(|s| s.direction == RampDirection::Down)
        .filter_map(|down| {
            steps
                .iter()
                .find(|up| up.direction == RampDirection::Up && up.torque_mnm == down.torque_mnm)
                .map(|up| (up.tip_force_n - down.tip_force_n).abs())
        })
        .reduce(f64::max);

    TorqueSummary {
        mean_efficiency: mean(&efficiencies),
        max_efficiency: max(&efficiencies),
        efficiency_points: efficiencies.len(),
        max_tip_force_n,
        max_tip_force_kg: newtons_to_kg(max_tip_force_n),
        max_current_ma: max(&currents).unwrap_or(0.0),
        ramp_hysteresis_n,
    }
}

#[async_trait]
impl Protocol for TorqueConfig {
    async fn execute(&self, ctx: &mut RunContext<'_>) -> Result<TestResult, RunError> {
        ctx.phase("positioning");
        ctx.set_position(self.start_position).await?;
        ctx.wait(POSITIONING_TIME).await?;

        let schedule = self.schedule();
        let total = schedule.len();
        let mut steps = Vec::with_capacity(total);

        for (index, (torque, direction)) in schedule.into_iter().enumerate() {
            ctx.checkpoint().await?;
            let torque_mnm = torque.round() as i32;
            ctx.phase(&format!("step {}/{total}", index + 1));
            ctx.set_torque(torque_mnm).await?;
            ctx.wait(self.settle).await?;

            let readings = ctx
                .sample(self.readings_per_step(), self.sample_interval)
                .await?;
            let Some(avg) = SensorSample::mean(&readings) else {
                continue;
            };
            let efficiency = if self.measure_efficiency {
                efficiency(&avg, self.noise_floor_ma)
            } else {
                None
            };
            let tip_force_n = avg.force_tip_newtons();
            steps.push(TorqueStep {
                index,
                direction,
                torque_mnm,
                expected_current_ma: current_for_torque_ma(f64::from(torque_mnm)),
                current_ma: f64::from(avg.current),
                tip_force_n,
                tip_force_kg: newtons_to_kg(tip_force_n),
                tendon_force_n: avg.force_tendon_newtons(),
                velocity_rpm: f64::from(avg.velocity),
                position: avg.position,
                efficiency,
            });
            ctx.report(
                (index + 1) as f64 / total as f64,
                format!(
                    "{torque_mnm} mNm: tip force {tip_force_n:.2} N, current {} mA",
                    avg.current
                ),
            );
        }

        ctx.phase("unloading");
        ctx.set_torque(0).await?;
        ctx.wait(self.settle).await?;

        let summary = summarize(&steps);
        info!(
            run_id = %ctx.run_id(),
            steps = steps.len(),
            max_tip_force_n = summary.max_tip_force_n,
            "Torque ramp complete"
        );
        Ok(TestResult::TorqueEfficiency(TorqueResult { steps, summary }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::validate;

    fn config(raw: TestConfig) -> Result<TorqueConfig, ConfigValidationError> {
        TorqueConfig::from_params(&validate(SCHEMA, &raw)?, &DeviceLimits::default())
    }

    #[test]
    fn rejects_peak_torque_beyond_current_limit() {
        // 200 mNm needs 1333 mA against a 1000 mA limit.
        let err = config(TestConfig::new().with("torque_max_mnm", 200.0)).unwrap_err();
        assert!(matches!(err, ConfigValidationError::Inconsistent(msg) if msg.contains("current limit")));
        assert!(config(TestConfig::new().with("torque_max_mnm", 150.0)).is_ok());
    }

    #[test]
    fn rejects_inverted_range() {
        let raw = TestConfig::new()
            .with("torque_min_mnm", 100.0)
            .with("torque_max_mnm", 50.0);
        assert!(config(raw).is_err());
    }

    #[test]
    fn ramp_down_revisits_steps_without_repeating_the_peak() {
        let c = config(
            TestConfig::new()
                .with("torque_max_mnm", 90.0)
                .with("steps", 4_i64)
                .with("ramp_down", true),
        )
        .unwrap();
        let torques: Vec<_> = c.schedule().iter().map(|(t, _)| *t).collect();
        assert_eq!(torques, vec![0.0, 30.0, 60.0, 90.0, 60.0, 30.0, 0.0]);
        assert_eq!(c.schedule()[4].1, RampDirection::Down);
    }

    #[test]
    fn efficiency_undefined_below_noise_floor() {
        let mut sample = SensorSample {
            timestamp: 0.0,
            position: 0,
            velocity: 600,
            current: 3,
            force_tendon: 0,
            force_tip: 2_000,
            angle_joint: 0,
        };
        assert_eq!(efficiency(&sample, 5.0), None);

        sample.current = 500;
        let eff = efficiency(&sample, 5.0).unwrap();
        let expected = 2.0 * tip_velocity_m_s(600.0) / (24.0 * 0.5);
        assert!((eff - expected).abs() < 1e-12);
        assert!(eff.is_finite() && eff > 0.0);
    }

    #[test]
    fn estimate_counts_every_step() {
        let c = config(TestConfig::new().with("steps", 5_i64).with("hold_s", 1.0).with("settle_s", 0.5))
            .unwrap();
        assert_eq!(c.estimate_duration(), Duration::from_millis(2_000 + 5 * 1_500 + 500));
    }
}
