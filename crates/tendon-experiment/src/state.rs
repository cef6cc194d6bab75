//! Run lifecycle, snapshots and progress reporting.

use crate::params::TestConfig;
use crate::protocols::{EnduranceCursor, TestKind, TestResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tendon_core::{DeviceError, ErrorKind, SensorSample, Violation};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Where a run is in its lifecycle.
///
/// ```text
/// Idle -> Configuring -> Running <-> Paused
///                          |
///                          +-> Completed | Aborted | Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// No run in progress.
    Idle,
    /// Validating the configuration.
    Configuring,
    /// Executing phases.
    Running,
    /// Suspended at a phase boundary.
    Paused,
    /// Finished normally.
    Completed,
    /// Stopped by request or by an operator emergency stop.
    Aborted,
    /// Ended by a safety violation or a streaming failure.
    Failed,
}

impl RunStatus {
    /// True for `Completed`, `Aborted` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Aborted | RunStatus::Failed
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Idle => "idle",
            RunStatus::Configuring => "configuring",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Aborted => "aborted",
            RunStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Category of a non-fatal warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// Measured force outside the configured tolerance.
    ForceTolerance,
    /// Position drifted beyond the configured bound.
    PositionDrift,
    /// Position did not reach its target.
    PositionError,
    /// A measurement could not be evaluated.
    Measurement,
}

/// A warning recorded during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunWarning {
    /// Category.
    pub kind: WarningKind,
    /// Description.
    pub message: String,
    /// Sample that prompted the warning, if any.
    pub sample: Option<SensorSample>,
}

/// Why a run ended early.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    /// Error category.
    pub kind: ErrorKind,
    /// Error description.
    pub message: String,
    /// The limit breach, for safety failures.
    pub violation: Option<Violation>,
    /// Most recent good sample before the failure.
    pub last_sample: Option<SensorSample>,
}

impl RunFailure {
    /// Describe `error`, preferring the sample carried by a violation.
    pub fn from_error(error: &DeviceError, last_sample: Option<SensorSample>) -> Self {
        let violation = match error {
            DeviceError::SafetyViolation(v) => Some((**v).clone()),
            _ => None,
        };
        Self {
            kind: error.kind(),
            message: error.to_string(),
            last_sample: violation.as_ref().map(|v| v.sample).or(last_sample),
            violation,
        }
    }
}

/// Serializable snapshot of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRunState {
    /// Run identifier; also tags streamed samples.
    pub run_id: Uuid,
    /// Test kind.
    pub kind: TestKind,
    /// Resolved configuration.
    pub config: TestConfig,
    /// Lifecycle status.
    pub status: RunStatus,
    /// Current phase name.
    pub phase: String,
    /// Completed fraction, never decreasing.
    pub progress: f64,
    /// Latest status text.
    pub message: String,
    /// Streamed samples received while the run was active.
    pub samples_seen: u64,
    /// Non-fatal warnings.
    pub warnings: Vec<RunWarning>,
    /// Result, once completed.
    pub result: Option<TestResult>,
    /// Failure details for aborted and failed runs.
    pub failure: Option<RunFailure>,
    /// Last persisted resume point, for resumable tests.
    pub checkpoint: Option<EnduranceCursor>,
    /// Wall-clock start.
    pub started_at: Option<DateTime<Utc>>,
    /// Wall-clock end.
    pub finished_at: Option<DateTime<Utc>>,
}

impl TestRunState {
    pub(crate) fn new(run_id: Uuid, kind: TestKind, config: TestConfig) -> Self {
        Self {
            run_id,
            kind,
            config,
            status: RunStatus::Configuring,
            phase: "configuring".into(),
            progress: 0.0,
            message: String::new(),
            samples_seen: 0,
            warnings: Vec::new(),
            result: None,
            failure: None,
            checkpoint: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Number of warnings of `kind`.
    pub fn warning_count(&self, kind: WarningKind) -> usize {
        self.warnings.iter().filter(|w| w.kind == kind).count()
    }
}

/// One progress report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressUpdate {
    /// Run being reported.
    pub run_id: Uuid,
    /// Status at the time of the report.
    pub status: RunStatus,
    /// Completed fraction in `0.0..=1.0`, never decreasing within a run.
    pub fraction: f64,
    /// Status text.
    pub message: String,
    /// True when the message is a warning.
    pub warning: bool,
}

/// Receives progress reports from a running test.
///
/// Called inline from the run, so implementations must return quickly.
pub trait ProgressSink: Send + Sync {
    /// Handle one report.
    fn report(&self, update: &ProgressUpdate);
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressUpdate) + Send + Sync,
{
    fn report(&self, update: &ProgressUpdate) {
        self(update)
    }
}

impl ProgressSink for mpsc::UnboundedSender<ProgressUpdate> {
    fn report(&self, update: &ProgressUpdate) {
        // A dropped receiver only means nobody is listening.
        let _ = self.send(update.clone());
    }
}

/// Sink that discards every report.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _update: &ProgressUpdate) {}
}
