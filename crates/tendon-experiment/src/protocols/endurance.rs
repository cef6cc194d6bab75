//! Endurance cycling with periodic checkpoints.
//!
//! Each cycle starts from the flexed-out start position, so every cycle
//! boundary is a valid resume point: a resumed run repeats the start move
//! and dwell and then behaves exactly like the uninterrupted run would have.

use super::{position_within, secs, Protocol, TestResult};
use crate::analysis::mean;
use crate::context::{RunContext, RunError};
use crate::params::{ConfigValidationError, ParamSpec, TestConfig};
use crate::state::WarningKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::time::Duration;
use tendon_core::mechanics::{
    MOTOR_COUNTS_PER_REV, SPOOL_RADIUS_MM, SUPPLY_VOLTAGE_V, TIP_FORCE_RATIO,
};
use tendon_core::{DeviceLimits, SensorSample};
use tracing::info;

/// Electrical energy below which efficiency is undefined, in joules.
const ENERGY_FLOOR_J: f64 = 1e-6;

pub(super) const SCHEMA: &[ParamSpec] = &[
    ParamSpec::int("position_start", 0, 100_000, 1_000, Some("counts"), "Extended position"),
    ParamSpec::int("position_end", 0, 100_000, 8_000, Some("counts"), "Flexed position"),
    ParamSpec::int("num_cycles", 1, 1_000_000, 10_000, None, "Cycles to run"),
    ParamSpec::float("dwell_start_s", 0.0, 60.0, 1.0, "s", "Dwell at the start position"),
    ParamSpec::float("dwell_end_s", 0.0, 60.0, 1.0, "s", "Dwell at the end position"),
    ParamSpec::float("move_time_s", 0.2, 30.0, 2.0, "s", "Time allowed for the flexing move"),
    ParamSpec::int("sample_interval_ms", 10, 1_000, 50, Some("ms"), "Reading spacing during the move"),
    ParamSpec::int("log_interval", 1, 100_000, 100, None, "Keep full sensor data every k-th cycle"),
    ParamSpec::int("checkpoint_interval", 1, 1_000_000, 1_000, None, "Persist progress every n cycles"),
    ParamSpec::float("max_current_a", 0.01, 10.0, 0.8, "A", "Peak current that ends cycling early"),
    ParamSpec::int("position_error_warn", 1, 10_000, 200, Some("counts"), "Stroke error that raises a warning"),
];

/// Typed endurance configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnduranceConfig {
    /// Extended position.
    pub position_start: i32,
    /// Flexed position.
    pub position_end: i32,
    /// Cycles to run.
    pub num_cycles: u32,
    /// Dwell at the start position.
    pub dwell_start: Duration,
    /// Dwell at the end position.
    pub dwell_end: Duration,
    /// Time allowed for the flexing move.
    pub move_time: Duration,
    /// Reading spacing during the move.
    pub sample_interval: Duration,
    /// Keep full sensor data every k-th cycle.
    pub log_interval: u32,
    /// Persist progress every n cycles.
    pub checkpoint_interval: u32,
    /// Peak current that ends cycling, in A.
    pub max_current_a: f64,
    /// Stroke error that raises a warning, in counts.
    pub position_error_warn: i32,
}

impl EnduranceConfig {
    /// Build from a validated parameter map, checking against the rig limits.
    pub fn from_params(
        params: &TestConfig,
        limits: &DeviceLimits,
    ) -> Result<Self, ConfigValidationError> {
        let position_start = position_within("position_start", params.int("position_start")?, limits)?;
        let position_end = position_within("position_end", params.int("position_end")?, limits)?;
        if position_start == position_end {
            return Err(ConfigValidationError::Inconsistent(
                "position_start and position_end must differ".into(),
            ));
        }
        Ok(Self {
            position_start,
            position_end,
            num_cycles: params.int("num_cycles")? as u32,
            dwell_start: secs(params.float("dwell_start_s")?),
            dwell_end: secs(params.float("dwell_end_s")?),
            move_time: secs(params.float("move_time_s")?),
            sample_interval: Duration::from_millis(params.int("sample_interval_ms")? as u64),
            log_interval: params.int("log_interval")? as u32,
            checkpoint_interval: params.int("checkpoint_interval")? as u32,
            max_current_a: params.float("max_current_a")?,
            position_error_warn: params.int("position_error_warn")? as i32,
        })
    }

    fn move_readings(&self) -> usize {
        let ratio = self.move_time.as_secs_f64() / self.sample_interval.as_secs_f64();
        (ratio.round() as usize).max(1)
    }

    fn stroke(&self) -> i32 {
        self.position_end - self.position_start
    }

    /// Expected run time.
    pub fn estimate_duration(&self) -> Duration {
        (self.dwell_start + self.move_time + self.dwell_end) * self.num_cycles
    }

    /// Metrics of one cycle from its boundary readings and move samples.
    pub fn cycle_metrics(
        &self,
        cycle: u32,
        at_start: &SensorSample,
        at_end: &SensorSample,
        during_move: &[SensorSample],
    ) -> CycleMetrics {
        let travel = at_end.position - at_start.position;
        let currents: Vec<f64> = during_move.iter().map(SensorSample::current_amps).collect();
        let current_mean_a = mean(&currents).unwrap_or(0.0);
        let current_max_a = currents.iter().copied().fold(0.0, f64::max);
        let power_mean_w = current_mean_a * SUPPLY_VOLTAGE_V;

        let force_start_n = at_start.force_tip_newtons();
        let force_end_n = at_end.force_tip_newtons();
        let tip_travel_m = f64::from(travel.abs()) / MOTOR_COUNTS_PER_REV * 2.0 * PI
            * SPOOL_RADIUS_MM
            / 1_000.0
            / TIP_FORCE_RATIO;
        let mechanical_j = (force_start_n + force_end_n).abs() / 2.0 * tip_travel_m;
        let electrical_j = power_mean_w * self.move_time.as_secs_f64();
        let efficiency = (electrical_j > ENERGY_FLOOR_J).then(|| mechanical_j / electrical_j);

        CycleMetrics {
            cycle,
            position_start: at_start.position,
            position_end: at_end.position,
            position_error: (travel - self.stroke()).abs(),
            force_start_n,
            force_end_n,
            current_mean_a,
            current_max_a,
            power_mean_w,
            efficiency,
        }
    }

    async fn run_cycle(
        &self,
        ctx: &mut RunContext<'_>,
        cycle: u32,
    ) -> Result<(CycleMetrics, Vec<SensorSample>), RunError> {
        ctx.set_position(self.position_start).await?;
        ctx.wait(self.dwell_start).await?;
        let at_start = ctx.read().await?;

        ctx.set_position(self.position_end).await?;
        let during_move = ctx.sample(self.move_readings(), self.sample_interval).await?;
        ctx.wait(self.dwell_end).await?;
        let at_end = ctx.read().await?;

        let metrics = self.cycle_metrics(cycle, &at_start, &at_end, &during_move);
        Ok((metrics, during_move))
    }
}

/// Metrics of one flex/extend cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleMetrics {
    /// One-based cycle number.
    pub cycle: u32,
    /// Position after the start dwell.
    pub position_start: i32,
    /// Position after the end dwell.
    pub position_end: i32,
    /// Measured stroke minus commanded stroke, magnitude in counts.
    pub position_error: i32,
    /// Tip force at the start position, in N.
    pub force_start_n: f64,
    /// Tip force at the end position, in N.
    pub force_end_n: f64,
    /// Mean current during the move, in A.
    pub current_mean_a: f64,
    /// Peak current during the move, in A.
    pub current_max_a: f64,
    /// Mean electrical power during the move, in W.
    pub power_mean_w: f64,
    /// Mechanical work over electrical energy. `None` when undefined.
    pub efficiency: Option<f64>,
}

/// A cycle kept with its full sensor data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedCycle {
    /// Cycle metrics.
    pub metrics: CycleMetrics,
    /// Readings taken during the move.
    pub samples: Vec<SensorSample>,
}

/// Running metrics carried across checkpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnduranceTotals {
    /// Cycles finished.
    pub cycles_completed: u32,
    /// Metrics of the first cycle.
    pub first: Option<CycleMetrics>,
    /// Metrics of the most recent cycle.
    pub last: Option<CycleMetrics>,
    /// Sum of defined efficiencies.
    pub efficiency_sum: f64,
    /// Cycles with a defined efficiency.
    pub efficiency_count: u32,
    /// Sum of mean powers, in W.
    pub power_sum_w: f64,
    /// Largest stroke error, in counts.
    pub max_position_error: i32,
    /// Largest peak current, in A.
    pub max_current_a: f64,
    /// Every k-th cycle with its sensor data.
    pub logged: Vec<LoggedCycle>,
}

impl EnduranceTotals {
    fn record(&mut self, metrics: &CycleMetrics) {
        self.cycles_completed += 1;
        if self.first.is_none() {
            self.first = Some(metrics.clone());
        }
        self.last = Some(metrics.clone());
        if let Some(e) = metrics.efficiency {
            self.efficiency_sum += e;
            self.efficiency_count += 1;
        }
        self.power_sum_w += metrics.power_mean_w;
        self.max_position_error = self.max_position_error.max(metrics.position_error);
        self.max_current_a = self.max_current_a.max(metrics.current_max_a);
    }

    /// Summary of everything recorded so far.
    pub fn summary(&self) -> EnduranceSummary {
        let pct_drop = |first: f64, last: f64| {
            (first.abs() > f64::EPSILON).then(|| (first - last) / first * 100.0)
        };
        let tip_force = |m: &CycleMetrics| (m.force_start_n + m.force_end_n) / 2.0;

        let (efficiency_drop_pct, force_loss_pct) = match (&self.first, &self.last) {
            (Some(first), Some(last)) => (
                first
                    .efficiency
                    .zip(last.efficiency)
                    .and_then(|(f, l)| pct_drop(f, l)),
                pct_drop(tip_force(first), tip_force(last)),
            ),
            _ => (None, None),
        };

        EnduranceSummary {
            cycles_completed: self.cycles_completed,
            mean_efficiency: (self.efficiency_count > 0)
                .then(|| self.efficiency_sum / f64::from(self.efficiency_count)),
            efficiency_drop_pct,
            force_loss_pct,
            max_position_error: self.max_position_error,
            max_current_a: self.max_current_a,
            mean_power_w: if self.cycles_completed > 0 {
                self.power_sum_w / f64::from(self.cycles_completed)
            } else {
                0.0
            },
        }
    }
}

/// Resume point: the next cycle to run and everything accumulated before it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnduranceCursor {
    /// One-based number of the next cycle.
    pub next_cycle: u32,
    /// Accumulated metrics.
    pub totals: EnduranceTotals,
}

/// Aggregate endurance figures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnduranceSummary {
    /// Cycles finished.
    pub cycles_completed: u32,
    /// Mean defined efficiency.
    pub mean_efficiency: Option<f64>,
    /// Relative efficiency drop from the first to the final cycle, in percent.
    pub efficiency_drop_pct: Option<f64>,
    /// Relative tip force loss from the first to the final cycle, in percent.
    pub force_loss_pct: Option<f64>,
    /// Largest stroke error, in counts.
    pub max_position_error: i32,
    /// Largest peak current, in A.
    pub max_current_a: f64,
    /// Mean electrical power, in W.
    pub mean_power_w: f64,
}

/// Why cycling ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum EndReason {
    /// All configured cycles ran.
    AllCycles,
    /// A cycle drew more than `max_current_a`.
    CurrentLimit {
        /// Offending cycle.
        cycle: u32,
        /// Peak current in that cycle, in A.
        current_a: f64,
    },
}

/// Endurance result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnduranceResult {
    /// Why cycling ended.
    pub end_reason: EndReason,
    /// Aggregates.
    pub summary: EnduranceSummary,
    /// First cycle metrics.
    pub first_cycle: Option<CycleMetrics>,
    /// Final cycle metrics.
    pub final_cycle: Option<CycleMetrics>,
    /// Logged cycles with sensor data.
    pub logged: Vec<LoggedCycle>,
    /// Cycle the run was resumed at, if it was resumed.
    pub resumed_at: Option<u32>,
}

#[async_trait]
impl Protocol for EnduranceConfig {
    async fn execute(&self, ctx: &mut RunContext<'_>) -> Result<TestResult, RunError> {
        let (first_cycle, mut totals, resumed_at) = match ctx.take_resume() {
            Some(cursor) => {
                info!(
                    run_id = %ctx.run_id(),
                    cycle = cursor.next_cycle,
                    "Resuming endurance run"
                );
                (cursor.next_cycle, cursor.totals, Some(cursor.next_cycle))
            }
            None => (1, EnduranceTotals::default(), None),
        };
        let total = f64::from(self.num_cycles);
        let mut end_reason = EndReason::AllCycles;

        for cycle in first_cycle..=self.num_cycles {
            ctx.checkpoint().await?;
            ctx.phase(&format!("cycle {cycle}/{}", self.num_cycles));
            let (metrics, samples) = self.run_cycle(ctx, cycle).await?;
            totals.record(&metrics);

            if cycle % self.log_interval == 0 {
                info!(
                    run_id = %ctx.run_id(),
                    cycle,
                    position_error = metrics.position_error,
                    current_max_a = metrics.current_max_a,
                    efficiency = ?metrics.efficiency,
                    "Endurance cycle"
                );
                totals.logged.push(LoggedCycle {
                    metrics: metrics.clone(),
                    samples,
                });
            }
            if metrics.position_error > self.position_error_warn {
                ctx.warn(
                    WarningKind::PositionError,
                    format!("cycle {cycle}: stroke off by {} counts", metrics.position_error),
                    ctx.last_sample(),
                );
            }
            if metrics.current_max_a > self.max_current_a {
                ctx.warn(
                    WarningKind::Measurement,
                    format!(
                        "cycle {cycle}: peak current {:.3} A above {:.3} A, ending early",
                        metrics.current_max_a, self.max_current_a
                    ),
                    ctx.last_sample(),
                );
                end_reason = EndReason::CurrentLimit {
                    cycle,
                    current_a: metrics.current_max_a,
                };
                break;
            }

            ctx.report(
                f64::from(cycle) / total,
                format!("cycle {cycle}/{} complete", self.num_cycles),
            );
            if cycle % self.checkpoint_interval == 0 && cycle < self.num_cycles {
                ctx.save_checkpoint(EnduranceCursor {
                    next_cycle: cycle + 1,
                    totals: totals.clone(),
                })
                .await?;
            }
        }

        ctx.phase("returning");
        ctx.set_position(self.position_start).await?;
        ctx.wait(self.dwell_start).await?;

        let summary = totals.summary();
        info!(
            run_id = %ctx.run_id(),
            cycles = summary.cycles_completed,
            mean_efficiency = ?summary.mean_efficiency,
            "Endurance run complete"
        );
        Ok(TestResult::Endurance(EnduranceResult {
            end_reason,
            summary,
            first_cycle: totals.first,
            final_cycle: totals.last,
            logged: totals.logged,
            resumed_at,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::validate;

    fn config(raw: TestConfig) -> EnduranceConfig {
        EnduranceConfig::from_params(&validate(SCHEMA, &raw).unwrap(), &DeviceLimits::default())
            .unwrap()
    }

    fn sample(position: i32, current: u32, force_tip: i32) -> SensorSample {
        SensorSample {
            timestamp: 0.0,
            position,
            velocity: 0,
            current,
            force_tendon: 0,
            force_tip,
            angle_joint: 0,
        }
    }

    #[test]
    fn cycle_metrics_from_readings() {
        let c = config(TestConfig::new());
        let m = c.cycle_metrics(
            3,
            &sample(1_000, 20, 2_000),
            &sample(7_950, 20, 2_000),
            &[sample(2_000, 400, 0), sample(5_000, 600, 0)],
        );
        assert_eq!(m.position_error, 50);
        assert!((m.current_mean_a - 0.5).abs() < 1e-12);
        assert!((m.current_max_a - 0.6).abs() < 1e-12);
        assert!((m.power_mean_w - 12.0).abs() < 1e-12);
        let tip_travel = 6.95 * 2.0 * PI * 0.01 / 0.7;
        let expected = 2.0 * tip_travel / (12.0 * 2.0);
        assert!((m.efficiency.unwrap() - expected).abs() < 1e-9);
    }

    #[test]
    fn efficiency_undefined_without_current() {
        let c = config(TestConfig::new());
        let idle = sample(1_000, 0, 0);
        assert_eq!(c.cycle_metrics(1, &idle, &idle, &[idle]).efficiency, None);
    }

    #[test]
    fn degradation_compares_first_and_final_cycle() {
        let c = config(TestConfig::new());
        let mut totals = EnduranceTotals::default();
        let m1 = c.cycle_metrics(1, &sample(1_000, 20, 2_000), &sample(8_000, 20, 2_000), &[sample(4_000, 500, 0)]);
        let m2 = c.cycle_metrics(2, &sample(1_000, 20, 1_800), &sample(8_000, 20, 1_800), &[sample(4_000, 500, 0)]);
        totals.record(&m1);
        totals.record(&m2);
        let s = totals.summary();
        assert_eq!(s.cycles_completed, 2);
        assert!((s.force_loss_pct.unwrap() - 10.0).abs() < 1e-9);
        assert!((s.efficiency_drop_pct.unwrap() - 10.0).abs() < 1e-9);
        assert!((s.mean_power_w - 12.0).abs() < 1e-12);
    }

    #[test]
    fn identical_positions_are_rejected() {
        let raw = TestConfig::new()
            .with("position_start", 4_000_i64)
            .with("position_end", 4_000_i64);
        let resolved = validate(SCHEMA, &raw).unwrap();
        assert!(EnduranceConfig::from_params(&resolved, &DeviceLimits::default()).is_err());
    }
}
