//! Test catalogue and the five test algorithms.
//!
//! Each protocol module owns a strongly typed configuration built from a
//! validated [`TestConfig`], a result type and the algorithm itself. This
//! module ties them together behind [`TestKind`] and [`TestPlan`].

mod endurance;
mod hold;
mod hysteresis;
mod stiffness;
mod torque;

pub use endurance::{
    CycleMetrics, EndReason, EnduranceConfig, EnduranceCursor, EnduranceResult, EnduranceSummary,
    EnduranceTotals, LoggedCycle,
};
pub use hold::{HoldConfig, HoldResult, HoldSample, HoldSummary, MAX_TARGET_FORCE_N};
pub use hysteresis::{HysteresisConfig, HysteresisPoint, HysteresisResult};
pub use stiffness::{StiffnessConfig, StiffnessPoint, StiffnessResult};
pub use torque::{RampDirection, TorqueConfig, TorqueResult, TorqueStep, TorqueSummary};

use crate::context::{RunContext, RunError};
use crate::params::{validate, ConfigValidationError, ParamSpec, TestConfig};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tendon_core::DeviceLimits;

/// The algorithm half of a test.
#[async_trait]
pub(crate) trait Protocol: Send + Sync {
    /// Drive the rig through every phase and produce the result.
    async fn execute(&self, ctx: &mut RunContext<'_>) -> Result<TestResult, RunError>;
}

/// Every test the engine can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestKind {
    /// Torque ramp with efficiency at each step.
    TorqueEfficiency,
    /// Direction-dependent positioning error.
    Hysteresis,
    /// Force against displacement at a held position.
    Stiffness,
    /// Constant tip force held over time.
    StaticHold,
    /// Repeated flex/extend cycling.
    Endurance,
}

impl TestKind {
    /// All kinds in catalogue order.
    pub const ALL: [TestKind; 5] = [
        TestKind::TorqueEfficiency,
        TestKind::Hysteresis,
        TestKind::Stiffness,
        TestKind::StaticHold,
        TestKind::Endurance,
    ];

    /// Identifier used in configs and on the command line.
    pub fn id(self) -> &'static str {
        match self {
            TestKind::TorqueEfficiency => "torque_efficiency",
            TestKind::Hysteresis => "hysteresis",
            TestKind::Stiffness => "stiffness",
            TestKind::StaticHold => "static_hold",
            TestKind::Endurance => "endurance",
        }
    }

    /// Display name.
    pub fn name(self) -> &'static str {
        match self {
            TestKind::TorqueEfficiency => "Torque/Efficiency",
            TestKind::Hysteresis => "Hysteresis",
            TestKind::Stiffness => "Stiffness",
            TestKind::StaticHold => "Static Hold",
            TestKind::Endurance => "Endurance",
        }
    }

    /// One-paragraph description.
    pub fn description(self) -> &'static str {
        match self {
            TestKind::TorqueEfficiency => {
                "Ramps motor torque through evenly spaced steps and measures tip force, \
                 current and transmission efficiency at each step."
            }
            TestKind::Hysteresis => {
                "Approaches a series of positions from below and from above and reports \
                 the direction-dependent error (backlash) at each."
            }
            TestKind::Stiffness => {
                "Holds a fixed position while external force is applied and fits force \
                 against displacement to obtain the tip stiffness."
            }
            TestKind::StaticHold => {
                "Holds a target tip force under closed-loop current correction and \
                 tracks force error and position drift (creep) over time."
            }
            TestKind::Endurance => {
                "Cycles between two positions many times, logging every k-th cycle and \
                 checkpointing so an interrupted run can resume."
            }
        }
    }

    /// Parameter schema.
    pub fn schema(self) -> &'static [ParamSpec] {
        match self {
            TestKind::TorqueEfficiency => torque::SCHEMA,
            TestKind::Hysteresis => hysteresis::SCHEMA,
            TestKind::Stiffness => stiffness::SCHEMA,
            TestKind::StaticHold => hold::SCHEMA,
            TestKind::Endurance => endurance::SCHEMA,
        }
    }

    /// Whether an interrupted run can be resumed from a checkpoint.
    pub fn is_resumable(self) -> bool {
        self == TestKind::Endurance
    }

    /// Expected run time for `config` under `limits`.
    pub fn estimate_duration(
        self,
        config: &TestConfig,
        limits: &DeviceLimits,
    ) -> Result<Duration, ConfigValidationError> {
        Ok(TestPlan::configure(self, config, limits)?.estimate_duration())
    }
}

impl std::fmt::Display for TestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for TestKind {
    type Err = ConfigValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        match wanted.as_str() {
            "torque" | "torque_efficiency" => Ok(TestKind::TorqueEfficiency),
            "hysteresis" => Ok(TestKind::Hysteresis),
            "stiffness" => Ok(TestKind::Stiffness),
            "hold" | "static_hold" => Ok(TestKind::StaticHold),
            "endurance" => Ok(TestKind::Endurance),
            _ => Err(ConfigValidationError::Inconsistent(format!(
                "unknown test kind `{s}`"
            ))),
        }
    }
}

/// A validated, strongly typed test ready to run.
#[derive(Debug, Clone, PartialEq)]
pub enum TestPlan {
    /// Torque/efficiency ramp.
    TorqueEfficiency(TorqueConfig),
    /// Backlash sweep.
    Hysteresis(HysteresisConfig),
    /// Stiffness fit.
    Stiffness(StiffnessConfig),
    /// Static force hold.
    StaticHold(HoldConfig),
    /// Endurance cycling.
    Endurance(EnduranceConfig),
}

impl TestPlan {
    /// Validate `raw` against the schema of `kind` and the rig limits.
    pub fn configure(
        kind: TestKind,
        raw: &TestConfig,
        limits: &DeviceLimits,
    ) -> Result<Self, ConfigValidationError> {
        let resolved = validate(kind.schema(), raw)?;
        Ok(match kind {
            TestKind::TorqueEfficiency => {
                TestPlan::TorqueEfficiency(TorqueConfig::from_params(&resolved, limits)?)
            }
            TestKind::Hysteresis => {
                TestPlan::Hysteresis(HysteresisConfig::from_params(&resolved, limits)?)
            }
            TestKind::Stiffness => {
                TestPlan::Stiffness(StiffnessConfig::from_params(&resolved, limits)?)
            }
            TestKind::StaticHold => {
                TestPlan::StaticHold(HoldConfig::from_params(&resolved, limits)?)
            }
            TestKind::Endurance => {
                TestPlan::Endurance(EnduranceConfig::from_params(&resolved, limits)?)
            }
        })
    }

    /// Test kind.
    pub fn kind(&self) -> TestKind {
        match self {
            TestPlan::TorqueEfficiency(_) => TestKind::TorqueEfficiency,
            TestPlan::Hysteresis(_) => TestKind::Hysteresis,
            TestPlan::Stiffness(_) => TestKind::Stiffness,
            TestPlan::StaticHold(_) => TestKind::StaticHold,
            TestPlan::Endurance(_) => TestKind::Endurance,
        }
    }

    /// Expected run time.
    pub fn estimate_duration(&self) -> Duration {
        match self {
            TestPlan::TorqueEfficiency(c) => c.estimate_duration(),
            TestPlan::Hysteresis(c) => c.estimate_duration(),
            TestPlan::Stiffness(c) => c.estimate_duration(),
            TestPlan::StaticHold(c) => c.estimate_duration(),
            TestPlan::Endurance(c) => c.estimate_duration(),
        }
    }

    pub(crate) fn protocol(&self) -> &dyn Protocol {
        match self {
            TestPlan::TorqueEfficiency(c) => c,
            TestPlan::Hysteresis(c) => c,
            TestPlan::Stiffness(c) => c,
            TestPlan::StaticHold(c) => c,
            TestPlan::Endurance(c) => c,
        }
    }
}

/// Final result of a completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TestResult {
    /// Torque/efficiency ramp.
    TorqueEfficiency(TorqueResult),
    /// Backlash sweep.
    Hysteresis(HysteresisResult),
    /// Stiffness fit.
    Stiffness(StiffnessResult),
    /// Static force hold.
    StaticHold(HoldResult),
    /// Endurance cycling.
    Endurance(EnduranceResult),
}

/// Catalogue entry for one test kind.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogueEntry {
    /// Test kind.
    pub kind: TestKind,
    /// Display name.
    pub name: &'static str,
    /// Description.
    pub description: &'static str,
    /// Parameter schema with defaults and units.
    pub parameters: &'static [ParamSpec],
    /// Estimated duration of the default configuration, if it is valid
    /// under the given limits.
    pub default_duration: Option<String>,
}

/// Describe every test kind.
pub fn catalogue(limits: &DeviceLimits) -> Vec<CatalogueEntry> {
    TestKind::ALL
        .iter()
        .map(|&kind| CatalogueEntry {
            kind,
            name: kind.name(),
            description: kind.description(),
            parameters: kind.schema(),
            default_duration: kind
                .estimate_duration(&TestConfig::new(), limits)
                .ok()
                .map(format_duration),
        })
        .collect()
}

/// Render a duration as seconds, minutes or hours.
pub fn format_duration(duration: Duration) -> String {
    let seconds = duration.as_secs_f64();
    if seconds < 60.0 {
        format!("{seconds:.1} seconds")
    } else if seconds < 3_600.0 {
        format!("{:.1} minutes", seconds / 60.0)
    } else {
        format!("{:.1} hours", seconds / 3_600.0)
    }
}

/// Seconds from a validated float parameter.
fn secs(seconds: f64) -> Duration {
    Duration::from_secs_f64(seconds.max(0.0))
}

/// Checks shared by position-based protocols.
fn position_within(
    name: &str,
    position: i64,
    limits: &DeviceLimits,
) -> Result<i32, ConfigValidationError> {
    let min = i64::from(limits.position_min);
    let max = i64::from(limits.position_max);
    if position < min || position > max {
        return Err(ConfigValidationError::Inconsistent(format!(
            "{name} = {position} lies outside the position limits {min}..={max}"
        )));
    }
    i32::try_from(position)
        .map_err(|_| ConfigValidationError::Inconsistent(format!("{name} out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_pick_a_readable_unit() {
        assert_eq!(format_duration(Duration::from_secs(45)), "45.0 seconds");
        assert_eq!(format_duration(Duration::from_secs(90)), "1.5 minutes");
        assert_eq!(format_duration(Duration::from_secs(5_400)), "1.5 hours");
    }

    #[test]
    fn kinds_parse_from_ids_and_short_names() {
        for kind in TestKind::ALL {
            assert_eq!(kind.id().parse::<TestKind>().unwrap(), kind);
        }
        assert_eq!("hold".parse::<TestKind>().unwrap(), TestKind::StaticHold);
        assert_eq!("Torque-Efficiency".parse::<TestKind>().unwrap(), TestKind::TorqueEfficiency);
        assert!("sweep".parse::<TestKind>().is_err());
    }

    #[test]
    fn default_configs_are_valid_for_default_limits() {
        let limits = DeviceLimits::default();
        for entry in catalogue(&limits) {
            assert!(entry.default_duration.is_some(), "{} default rejected", entry.kind);
            assert!(!entry.parameters.is_empty());
        }
    }

    #[test]
    fn catalogue_serializes_schema_with_units() {
        let json = serde_json::to_value(catalogue(&DeviceLimits::default())).unwrap();
        let torque = &json[0];
        assert_eq!(torque["kind"], "torque_efficiency");
        let first = &torque["parameters"][0];
        assert!(first["type"].is_string());
        assert!(first.get("default").is_some());
    }
}
