//! The view of the rig a protocol gets while it runs.
//!
//! Protocols never hold the engine. They issue commands, wait and sample
//! through [`RunContext`], which turns every wait into a suspension point
//! where stop requests, safety trips and streaming failures are noticed.
//! Pause is honoured only at [`RunContext::checkpoint`], between phases.

use crate::checkpoint::{CheckpointError, CheckpointStore, RunCheckpoint, CHECKPOINT_VERSION};
use crate::protocols::EnduranceCursor;
use crate::state::{ProgressSink, ProgressUpdate, RunStatus, RunWarning, TestRunState, WarningKind};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tendon_core::{DeviceError, DeviceResult, SensorSample, Violation};
use tendon_hardware::{DeviceHandle, SafetyEvent, SafetyMonitor, SampleReceiver, StreamStatus};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Longest uninterrupted sleep inside a wait.
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Capacity of the engine's own streaming sink.
const ACCUMULATOR_CAPACITY: usize = 1_024;

/// Pause/stop flags shared between the engine and a running protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Control {
    pub pause: bool,
    pub stop: bool,
}

/// Why a protocol stopped before finishing.
#[derive(Debug)]
pub(crate) enum RunError {
    /// Stop was requested.
    Stopped,
    /// Emergency stop latched without a monitor violation (operator stop).
    EmergencyStop,
    /// Device or streaming failure.
    Device(DeviceError),
    /// Checkpoint could not be written.
    Checkpoint(CheckpointError),
}

impl From<DeviceError> for RunError {
    fn from(err: DeviceError) -> Self {
        RunError::Device(err)
    }
}

impl From<CheckpointError> for RunError {
    fn from(err: CheckpointError) -> Self {
        RunError::Checkpoint(err)
    }
}

/// Handles a protocol needs while it runs.
pub(crate) struct RunContext<'a> {
    run_id: Uuid,
    handle: &'a DeviceHandle,
    safety: Option<&'a SafetyMonitor>,
    safety_events: Option<broadcast::Receiver<SafetyEvent>>,
    trip: Option<Violation>,
    control: watch::Receiver<Control>,
    stream: watch::Receiver<StreamStatus>,
    accumulator: SampleReceiver,
    state: Arc<RwLock<Option<TestRunState>>>,
    progress: &'a dyn ProgressSink,
    last_fraction: f64,
    last_sample: Option<SensorSample>,
    checkpoints: Option<&'a CheckpointStore>,
    resume: Option<EnduranceCursor>,
}

pub(crate) struct ContextParts<'a> {
    pub run_id: Uuid,
    pub handle: &'a DeviceHandle,
    pub safety: Option<&'a SafetyMonitor>,
    pub control: watch::Receiver<Control>,
    pub state: Arc<RwLock<Option<TestRunState>>>,
    pub progress: &'a dyn ProgressSink,
    pub checkpoints: Option<&'a CheckpointStore>,
    pub resume: Option<EnduranceCursor>,
}

impl<'a> RunContext<'a> {
    pub(crate) fn new(parts: ContextParts<'a>) -> Self {
        let last_fraction = parts
            .state
            .read()
            .as_ref()
            .map(|s| s.progress)
            .unwrap_or(0.0);
        Self {
            run_id: parts.run_id,
            handle: parts.handle,
            safety: parts.safety,
            safety_events: parts.safety.map(SafetyMonitor::subscribe),
            trip: None,
            control: parts.control,
            stream: parts.handle.stream_status(),
            accumulator: parts.handle.subscribe("test-engine", ACCUMULATOR_CAPACITY),
            state: parts.state,
            progress: parts.progress,
            last_fraction,
            last_sample: parts.handle.last_sample(),
            checkpoints: parts.checkpoints,
            resume: parts.resume,
        }
    }

    /// Run identifier.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Most recent good sample, streamed or read directly.
    pub fn last_sample(&self) -> Option<SensorSample> {
        self.last_sample
    }

    pub(crate) fn take_resume(&mut self) -> Option<EnduranceCursor> {
        self.resume.take()
    }

    // =========================================================================
    // Suspension points
    // =========================================================================

    /// The reason the run must end now, if any.
    fn interruption(&mut self) -> Option<RunError> {
        if let Some(events) = self.safety_events.as_mut() {
            loop {
                match events.try_recv() {
                    Ok(SafetyEvent::Tripped(v)) => self.trip = Some(v),
                    Ok(_) => {}
                    Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                    Err(_) => break,
                }
            }
        }

        if self.control.borrow().stop {
            return Some(RunError::Stopped);
        }
        if self.handle.is_estopped() {
            let violation = self
                .trip
                .clone()
                .or_else(|| self.safety.and_then(|m| m.status().active));
            return Some(match violation {
                Some(v) => RunError::Device(DeviceError::SafetyViolation(Box::new(v))),
                None => RunError::EmergencyStop,
            });
        }
        if let StreamStatus::Failed(report) = &*self.stream.borrow() {
            if self.last_sample.is_none() {
                self.last_sample = report.last_sample;
            }
            return Some(RunError::Device(report.error.clone()));
        }
        None
    }

    fn check(&mut self) -> Result<(), RunError> {
        match self.interruption() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Phase boundary: honours stop, and blocks here while paused.
    pub async fn checkpoint(&mut self) -> Result<(), RunError> {
        self.check()?;
        if !self.control.borrow().pause {
            return Ok(());
        }

        self.set_status(RunStatus::Paused);
        info!(run_id = %self.run_id, "Run paused");
        self.notify(false);
        loop {
            self.check()?;
            if !self.control.borrow().pause {
                break;
            }
            let _ = tokio::time::timeout(WAIT_SLICE, self.control.changed()).await;
        }
        self.set_status(RunStatus::Running);
        info!(run_id = %self.run_id, "Run resumed");
        self.notify(false);
        Ok(())
    }

    /// Settle wait that ends early on stop, safety trip or streaming failure.
    pub async fn wait(&mut self, duration: Duration) -> Result<(), RunError> {
        let deadline = Instant::now() + duration;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            tokio::time::sleep((deadline - now).min(WAIT_SLICE)).await;
        }
    }

    // =========================================================================
    // Device access
    // =========================================================================

    /// Convert a device error, preferring the run-ending cause behind it.
    fn fail(&mut self, err: DeviceError) -> RunError {
        match self.interruption() {
            Some(RunError::Stopped) | None => RunError::Device(err),
            Some(cause) => cause,
        }
    }

    fn settle<T>(&mut self, result: DeviceResult<T>) -> Result<T, RunError> {
        result.map_err(|err| self.fail(err))
    }

    /// Read the sensors directly.
    pub async fn read(&mut self) -> Result<SensorSample, RunError> {
        self.check()?;
        let result = self.handle.get_sensors().await;
        let sample = self.settle(result)?;
        self.last_sample = Some(sample);
        Ok(sample)
    }

    /// Take `count` readings spaced `interval` apart.
    pub async fn sample(
        &mut self,
        count: usize,
        interval: Duration,
    ) -> Result<Vec<SensorSample>, RunError> {
        let mut samples = Vec::with_capacity(count);
        for i in 0..count {
            if i > 0 {
                self.wait(interval).await?;
            }
            samples.push(self.read().await?);
        }
        Ok(samples)
    }

    /// Position setpoint.
    pub async fn set_position(&mut self, counts: i32) -> Result<(), RunError> {
        self.check()?;
        let result = self.handle.set_position(counts).await;
        self.settle(result)
    }

    /// Torque setpoint.
    pub async fn set_torque(&mut self, mnm: i32) -> Result<(), RunError> {
        self.check()?;
        let result = self.handle.set_torque(mnm).await;
        self.settle(result)
    }

    /// Current setpoint.
    pub async fn set_current(&mut self, ma: i32) -> Result<(), RunError> {
        self.check()?;
        let result = self.handle.set_current(ma).await;
        self.settle(result)
    }

    // =========================================================================
    // Reporting
    // =========================================================================

    fn update(&self, f: impl FnOnce(&mut TestRunState)) {
        if let Some(state) = self.state.write().as_mut() {
            f(state);
        }
    }

    fn set_status(&self, status: RunStatus) {
        self.update(|s| s.status = status);
    }

    fn drain_accumulator(&mut self) {
        let streamed = self.accumulator.drain();
        if let Some(last) = streamed.last() {
            self.last_sample = Some(last.sample);
        }
        let count = streamed.len() as u64;
        self.update(|s| s.samples_seen += count);
    }

    fn notify(&self, warning: bool) {
        let update = match self.state.read().as_ref() {
            Some(s) => ProgressUpdate {
                run_id: s.run_id,
                status: s.status,
                fraction: s.progress,
                message: s.message.clone(),
                warning,
            },
            None => return,
        };
        self.progress.report(&update);
    }

    /// Name the phase now executing.
    pub fn phase(&mut self, name: &str) {
        debug!(run_id = %self.run_id, phase = name, "Phase");
        let name = name.to_string();
        self.update(|s| s.phase = name);
    }

    /// Report progress. Fractions below the last reported one are raised to it.
    pub fn report(&mut self, fraction: f64, message: impl Into<String>) {
        self.drain_accumulator();
        let fraction = fraction.clamp(0.0, 1.0).max(self.last_fraction);
        self.last_fraction = fraction;
        let message = message.into();
        debug!(run_id = %self.run_id, fraction, %message, "Progress");
        self.update(|s| {
            s.progress = fraction;
            s.message = message;
        });
        self.notify(false);
    }

    /// Record a non-fatal warning.
    pub fn warn(&mut self, kind: WarningKind, message: impl Into<String>, sample: Option<SensorSample>) {
        let message = message.into();
        warn!(run_id = %self.run_id, ?kind, %message, "Test warning");
        self.update(|s| {
            s.message = message.clone();
            s.warnings.push(RunWarning {
                kind,
                message,
                sample,
            });
        });
        self.notify(true);
    }

    /// Persist a resume point. Without a store the cursor is only kept in
    /// the run snapshot.
    pub async fn save_checkpoint(&mut self, cursor: EnduranceCursor) -> Result<(), RunError> {
        let (kind, config) = match self.state.read().as_ref() {
            Some(s) => (s.kind, s.config.clone()),
            None => return Ok(()),
        };
        if let Some(store) = self.checkpoints {
            store
                .save(&RunCheckpoint {
                    version: CHECKPOINT_VERSION,
                    run_id: self.run_id,
                    kind,
                    config,
                    saved_at: chrono::Utc::now(),
                    cursor: cursor.clone(),
                })
                .await?;
        }
        info!(run_id = %self.run_id, next_cycle = cursor.next_cycle, "Checkpoint taken");
        self.update(|s| s.checkpoint = Some(cursor));
        Ok(())
    }
}
