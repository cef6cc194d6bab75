//! TestEngine - state machine for test execution.
//!
//! The engine validates a configuration, tags the stream with a fresh run
//! identifier, enables the actuator, runs the protocol and always disables
//! actuation again before returning, whatever the outcome.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐ run_test() ┌─────────────┐ valid ┌─────────┐ pause() ┌────────┐
//! │ Idle │───────────▶│ Configuring │──────▶│ Running │────────▶│ Paused │
//! └──────┘            └─────────────┘       └────┬────┘◀────────└────────┘
//!    ▲                      │ invalid            │       resume()
//!    └──────────────────────┘                    ▼
//!                              Completed | Aborted | Failed
//! ```
//!
//! Stop requests and operator emergency stops end a run as `Aborted`; safety
//! monitor trips and streaming failures end it as `Failed`.

use crate::checkpoint::{CheckpointError, CheckpointStore, RunCheckpoint};
use crate::context::{ContextParts, Control, RunContext, RunError};
use crate::params::{validate, ConfigValidationError, TestConfig};
use crate::protocols::{format_duration, EnduranceCursor, TestKind, TestPlan};
use crate::state::{NoProgress, ProgressSink, ProgressUpdate, RunFailure, RunStatus, TestRunState};
use chrono::Utc;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tendon_core::{DeviceError, DeviceLimits};
use tendon_hardware::{DeviceHandle, SafetyMonitor};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Why the engine refused a request.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Another run is in progress.
    #[error("a test is already running")]
    Busy,

    /// Configuration rejected during `Configuring`.
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigValidationError),

    /// Control request that makes no sense in the current state.
    #[error("cannot {action} while {status}")]
    InvalidState {
        /// Requested action.
        action: &'static str,
        /// Status at the time.
        status: RunStatus,
    },

    /// Emergency stop must be acknowledged before a run can start.
    #[error("emergency stop is latched; acknowledge it before starting a test")]
    EmergencyStopLatched,

    /// Device could not be used.
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// Checkpoint could not be read.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    /// Test kind has no resume support.
    #[error("{0} runs cannot be resumed")]
    NotResumable(TestKind),
}

/// Clears the running flag however the run ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Runs one test at a time against a device handle.
pub struct TestEngine {
    handle: DeviceHandle,
    limits: DeviceLimits,
    safety: Option<SafetyMonitor>,
    checkpoints: Option<CheckpointStore>,
    control: watch::Sender<Control>,
    state: Arc<RwLock<Option<TestRunState>>>,
    running: AtomicBool,
}

impl TestEngine {
    /// Engine validating against `limits`.
    pub fn new(handle: DeviceHandle, limits: DeviceLimits) -> Self {
        let (control, _) = watch::channel(Control::default());
        Self {
            handle,
            limits,
            safety: None,
            checkpoints: None,
            control,
            state: Arc::new(RwLock::new(None)),
            running: AtomicBool::new(false),
        }
    }

    /// Attach the safety monitor; its limits replace the engine's own and its
    /// trips are reported as run failures.
    pub fn with_safety(mut self, monitor: SafetyMonitor) -> Self {
        self.limits = monitor.limits();
        self.safety = Some(monitor);
        self
    }

    /// Persist checkpoints of resumable tests to `store`.
    pub fn with_checkpoints(mut self, store: CheckpointStore) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// Device handle in use.
    pub fn handle(&self) -> &DeviceHandle {
        &self.handle
    }

    /// Envelope configurations are validated against.
    pub fn limits(&self) -> DeviceLimits {
        self.safety
            .as_ref()
            .map(SafetyMonitor::limits)
            .unwrap_or(self.limits)
    }

    /// Snapshot of the current or most recent run.
    pub fn snapshot(&self) -> Option<TestRunState> {
        self.state.read().clone()
    }

    /// Status of the current or most recent run.
    pub fn status(&self) -> RunStatus {
        self.state
            .read()
            .as_ref()
            .map(|s| s.status)
            .unwrap_or(RunStatus::Idle)
    }

    /// Validate `raw` for `kind` without running anything.
    pub fn configure(&self, kind: TestKind, raw: &TestConfig) -> Result<TestPlan, EngineError> {
        Ok(TestPlan::configure(kind, raw, &self.limits())?)
    }

    // =========================================================================
    // Controls
    // =========================================================================

    /// Suspend the run at its next phase boundary.
    pub fn pause(&self) -> Result<(), EngineError> {
        match self.status() {
            RunStatus::Running | RunStatus::Paused if self.running.load(Ordering::SeqCst) => {
                self.control.send_modify(|c| c.pause = true);
                info!("Pause requested");
                Ok(())
            }
            status => Err(EngineError::InvalidState {
                action: "pause",
                status,
            }),
        }
    }

    /// Continue a paused run.
    pub fn resume(&self) -> Result<(), EngineError> {
        if !self.running.load(Ordering::SeqCst) || !self.control.borrow().pause {
            return Err(EngineError::InvalidState {
                action: "resume",
                status: self.status(),
            });
        }
        self.control.send_modify(|c| c.pause = false);
        info!("Resume requested");
        Ok(())
    }

    /// End the run at its next suspension point.
    pub fn stop(&self) -> Result<(), EngineError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(EngineError::InvalidState {
                action: "stop",
                status: self.status(),
            });
        }
        self.control.send_modify(|c| {
            c.stop = true;
            c.pause = false;
        });
        info!("Stop requested");
        Ok(())
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Run a test to completion.
    ///
    /// Returns `Err` only when the run never started (busy engine, invalid
    /// configuration, disconnected device, latched emergency stop). Every run
    /// that started returns its final state, whose status tells how it ended.
    pub async fn run_test(
        &self,
        kind: TestKind,
        raw: &TestConfig,
        progress: &dyn ProgressSink,
    ) -> Result<TestRunState, EngineError> {
        self.execute(Uuid::new_v4(), kind, raw, None, progress).await
    }

    /// Continue an interrupted run from its checkpoint, keeping its run id.
    pub async fn resume_test(
        &self,
        checkpoint: &RunCheckpoint,
        progress: &dyn ProgressSink,
    ) -> Result<TestRunState, EngineError> {
        if !checkpoint.kind.is_resumable() {
            return Err(EngineError::NotResumable(checkpoint.kind));
        }
        self.execute(
            checkpoint.run_id,
            checkpoint.kind,
            &checkpoint.config,
            Some(checkpoint.cursor.clone()),
            progress,
        )
        .await
    }

    /// [`run_test`](Self::run_test) without a progress sink.
    pub async fn run_quiet(
        &self,
        kind: TestKind,
        raw: &TestConfig,
    ) -> Result<TestRunState, EngineError> {
        self.run_test(kind, raw, &NoProgress).await
    }

    fn set_state(&self, state: TestRunState, progress: &dyn ProgressSink) {
        progress.report(&ProgressUpdate {
            run_id: state.run_id,
            status: state.status,
            fraction: state.progress,
            message: state.message.clone(),
            warning: false,
        });
        *self.state.write() = Some(state);
    }

    async fn execute(
        &self,
        run_id: Uuid,
        kind: TestKind,
        raw: &TestConfig,
        resume: Option<EnduranceCursor>,
        progress: &dyn ProgressSink,
    ) -> Result<TestRunState, EngineError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(EngineError::Busy);
        }
        let _running = RunningGuard(&self.running);

        let mut state = TestRunState::new(run_id, kind, raw.clone());
        state.message = format!("validating {kind} configuration");
        self.set_state(state.clone(), progress);

        let limits = self.limits();
        let configured = validate(kind.schema(), raw)
            .and_then(|resolved| Ok((TestPlan::configure(kind, &resolved, &limits)?, resolved)));
        let (plan, resolved) = match configured {
            Ok(ok) => ok,
            Err(err) => {
                warn!(%run_id, %kind, error = %err, "Configuration rejected");
                state.status = RunStatus::Idle;
                state.message = err.to_string();
                self.set_state(state, progress);
                return Err(err.into());
            }
        };
        let refusal = if !self.handle.is_connected() {
            Some(EngineError::Device(DeviceError::NotConnected))
        } else if self.handle.is_estopped() {
            Some(EngineError::EmergencyStopLatched)
        } else {
            None
        };
        if let Some(err) = refusal {
            state.status = RunStatus::Idle;
            state.message = err.to_string();
            self.set_state(state, progress);
            return Err(err);
        }

        self.control.send_replace(Control::default());
        state.config = resolved;
        state.status = RunStatus::Running;
        state.phase = "starting".into();
        state.started_at = Some(Utc::now());
        if let Some(cursor) = &resume {
            state.progress = f64::from(cursor.next_cycle.saturating_sub(1))
                / f64::from(match &plan {
                    TestPlan::Endurance(c) => c.num_cycles.max(1),
                    _ => 1,
                });
            state.checkpoint = Some(cursor.clone());
        }
        state.message = format!("estimated {}", format_duration(plan.estimate_duration()));
        self.set_state(state, progress);
        self.handle.set_run_id(Some(run_id));
        info!(
            %run_id,
            %kind,
            estimated = %format_duration(plan.estimate_duration()),
            resumed = resume.is_some(),
            "Test run started"
        );

        let mut ctx = RunContext::new(ContextParts {
            run_id,
            handle: &self.handle,
            safety: self.safety.as_ref(),
            control: self.control.subscribe(),
            state: self.state.clone(),
            progress,
            checkpoints: self.checkpoints.as_ref(),
            resume,
        });
        let outcome = match self.handle.enable().await {
            Ok(()) => plan.protocol().execute(&mut ctx).await,
            Err(err) => Err(RunError::Device(err)),
        };
        let last_sample = ctx.last_sample();
        drop(ctx);

        if let Err(err) = self.handle.disable().await {
            warn!(%run_id, error = %err, "Could not disable actuation after the run");
        }
        self.handle.set_run_id(None);
        self.control.send_replace(Control::default());

        let mut state = self.snapshot().unwrap_or_else(|| TestRunState::new(run_id, kind, raw.clone()));
        state.finished_at = Some(Utc::now());
        match outcome {
            Ok(result) => {
                state.status = RunStatus::Completed;
                state.progress = 1.0;
                state.message = "completed".into();
                state.result = Some(result);
                info!(%run_id, %kind, warnings = state.warnings.len(), "Test run completed");
            }
            Err(RunError::Stopped) => {
                state.status = RunStatus::Aborted;
                state.message = "stopped by request".into();
                info!(%run_id, %kind, "Test run stopped");
            }
            Err(RunError::EmergencyStop) => {
                let err = DeviceError::rejected("run", "emergency stop latched");
                state.status = RunStatus::Aborted;
                state.message = "aborted by emergency stop".into();
                state.failure = Some(RunFailure::from_error(&err, last_sample));
                warn!(%run_id, %kind, "Test run aborted by emergency stop");
            }
            Err(RunError::Device(err)) if err.is_run_ending() => {
                state.status = RunStatus::Failed;
                state.message = err.to_string();
                state.failure = Some(RunFailure::from_error(&err, last_sample));
                error!(%run_id, %kind, error = %err, "Test run failed");
            }
            Err(RunError::Device(err)) => {
                state.status = RunStatus::Aborted;
                state.message = err.to_string();
                state.failure = Some(RunFailure::from_error(&err, last_sample));
                warn!(%run_id, %kind, error = %err, "Test run aborted by device error");
            }
            Err(RunError::Checkpoint(err)) => {
                let err = DeviceError::Io(err.to_string());
                state.status = RunStatus::Aborted;
                state.message = err.to_string();
                state.failure = Some(RunFailure::from_error(&err, last_sample));
                warn!(%run_id, %kind, error = %err, "Test run aborted: checkpoint write failed");
            }
        }
        self.set_state(state.clone(), progress);
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tendon_core::{BackendKind, CommandBounds, ErrorKind};
    use tendon_driver_sim::{SimConfig, SimulatedRig};
    use tendon_hardware::StreamSettings;
    use tracing_test::traced_test;

    async fn engine() -> TestEngine {
        let limits = DeviceLimits::default();
        let handle = DeviceHandle::new(
            Arc::new(SimulatedRig::new(SimConfig::deterministic(1))),
            BackendKind::Simulated,
            CommandBounds::from_limits(&limits),
            StreamSettings::default(),
        );
        handle.connect().await.unwrap();
        TestEngine::new(handle, limits)
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn rejected_configuration_returns_to_idle() {
        let engine = engine().await;
        let raw = TestConfig::new().with("steps", 1_i64);
        let outcome = engine.run_quiet(TestKind::TorqueEfficiency, &raw).await;
        assert!(matches!(outcome, Err(EngineError::InvalidConfig(_))));
        assert_eq!(engine.status(), RunStatus::Idle);
        assert!(logs_contain("Configuration rejected"));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn operator_emergency_stop_aborts_the_run() {
        let engine = engine().await;
        let raw = TestConfig::new().with("num_cycles", 20_i64);
        let operator = async {
            tokio::time::sleep(Duration::from_secs(3)).await;
            engine.handle().emergency_stop().await.unwrap();
        };
        let (state, ()) = tokio::join!(engine.run_quiet(TestKind::Endurance, &raw), operator);
        let state = state.unwrap();
        assert_eq!(state.status, RunStatus::Aborted);
        assert_eq!(state.failure.map(|f| f.kind), Some(ErrorKind::CommandRejected));
        assert!(logs_contain("aborted by emergency stop"));

        let refused = engine.run_quiet(TestKind::Endurance, &raw).await;
        assert!(matches!(refused, Err(EngineError::EmergencyStopLatched)));
    }

    #[tokio::test(start_paused = true)]
    async fn resuming_a_non_resumable_kind_is_refused() {
        let engine = engine().await;
        let checkpoint = RunCheckpoint {
            version: crate::checkpoint::CHECKPOINT_VERSION,
            run_id: Uuid::new_v4(),
            kind: TestKind::Stiffness,
            config: TestConfig::new(),
            saved_at: Utc::now(),
            cursor: EnduranceCursor::default(),
        };
        let outcome = engine.resume_test(&checkpoint, &NoProgress).await;
        assert!(matches!(outcome, Err(EngineError::NotResumable(TestKind::Stiffness))));
    }
}
