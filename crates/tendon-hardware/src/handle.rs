//! Owned handle over one backend.
//!
//! `DeviceHandle` is what the rest of the rig talks to. It wraps the backend
//! behind the [`Device`] contract and adds what every backend shares: local
//! fast-fail ranges, the emergency-stop interlock, installed calibration and
//! the streaming engine. Clones share the same underlying device.

use crate::sink::{SamplePredicate, SampleReceiver};
use crate::streaming::{StreamSettings, StreamStats, StreamStatus, StreamingEngine};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tendon_core::{
    BackendKind, CalibrationSet, CommandBounds, Device, DeviceError, DeviceResult, LimitType,
    MotionProfile, PidGains, PlatformInfo, SensorSample, TaggedSample, Violation,
};
use tokio::sync::{mpsc, watch};
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Emergency-stop latch shared by the handle and the safety monitor.
#[derive(Debug, Default)]
pub(crate) struct Interlock {
    latched: AtomicBool,
    unresolved: Mutex<Option<Violation>>,
}

impl Interlock {
    fn check(&self, command: &str) -> DeviceResult<()> {
        if self.latched.load(Ordering::SeqCst) {
            return Err(DeviceError::rejected(
                command,
                "emergency stop latched; acknowledge before resuming",
            ));
        }
        Ok(())
    }

    pub(crate) fn latch(&self) {
        self.latched.store(true, Ordering::SeqCst);
    }

    /// Record the violation that still blocks acknowledgement, or clear it.
    pub(crate) fn set_unresolved(&self, violation: Option<Violation>) {
        *self.unresolved.lock() = violation;
    }
}

struct HandleInner {
    device: Arc<dyn Device>,
    kind: BackendKind,
    bounds: RwLock<CommandBounds>,
    interlock: Interlock,
    calibration: RwLock<CalibrationSet>,
    streaming: StreamingEngine,
}

/// Shared handle to a connected (or connectable) rig backend.
#[derive(Clone)]
pub struct DeviceHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("kind", &self.inner.kind)
            .field("connected", &self.is_connected())
            .field("estopped", &self.is_estopped())
            .finish()
    }
}

impl DeviceHandle {
    /// Wrap a backend.
    pub fn new(
        device: Arc<dyn Device>,
        kind: BackendKind,
        bounds: CommandBounds,
        stream: StreamSettings,
    ) -> Self {
        let streaming = StreamingEngine::new(device.clone(), stream);
        Self {
            inner: Arc::new(HandleInner {
                device,
                kind,
                bounds: RwLock::new(bounds),
                interlock: Interlock::default(),
                calibration: RwLock::new(CalibrationSet::new()),
                streaming,
            }),
        }
    }

    /// Backend kind this handle was created for.
    pub fn kind(&self) -> BackendKind {
        self.inner.kind
    }

    /// The wrapped backend.
    pub fn device(&self) -> Arc<dyn Device> {
        self.inner.device.clone()
    }

    pub(crate) fn interlock(&self) -> &Interlock {
        &self.inner.interlock
    }

    /// Static descriptor of the backend.
    pub fn platform_info(&self) -> PlatformInfo {
        self.inner.device.platform_info()
    }

    /// Replace the local fast-fail ranges.
    pub fn set_bounds(&self, bounds: CommandBounds) {
        *self.inner.bounds.write() = bounds;
    }

    /// Current local fast-fail ranges.
    pub fn bounds(&self) -> CommandBounds {
        *self.inner.bounds.read()
    }

    /// Calibration applied at the next `connect`.
    ///
    /// Install only while streaming and tests are stopped.
    pub fn set_calibration(&self, calibration: CalibrationSet) {
        *self.inner.calibration.write() = calibration;
    }

    // =========================================================================
    // Connection
    // =========================================================================

    /// Connect the backend and install the current calibration.
    #[instrument(skip(self), fields(kind = %self.inner.kind), err)]
    pub async fn connect(&self) -> DeviceResult<()> {
        self.inner.device.connect().await?;
        let calibration = self.inner.calibration.read().clone();
        self.inner.device.apply_calibration(&calibration);
        info!(
            platform = %self.inner.device.platform_info().name,
            calibrated_channels = calibration.len(),
            "Device connected"
        );
        Ok(())
    }

    /// Stop streaming, then close the transport. Idempotent.
    #[instrument(skip(self), fields(kind = %self.inner.kind), err)]
    pub async fn disconnect(&self) -> DeviceResult<()> {
        if let Err(err) = self.inner.streaming.stop().await {
            warn!(error = %err, "Stopping stream before disconnect failed");
        }
        self.inner.device.disconnect().await
    }

    /// True while the transport is open.
    pub fn is_connected(&self) -> bool {
        self.inner.device.is_connected()
    }

    // =========================================================================
    // Actuation
    // =========================================================================

    /// Enable the motor driver. Refused while the emergency stop is latched.
    pub async fn enable(&self) -> DeviceResult<()> {
        self.inner.interlock.check("enable")?;
        self.inner.device.enable().await
    }

    /// Disable the motor driver. Always allowed.
    pub async fn disable(&self) -> DeviceResult<()> {
        self.inner.device.disable().await
    }

    /// Latch the interlock and halt actuation.
    ///
    /// The latch is set before any wire I/O, so a command racing with this
    /// call is refused even if the transport turn has not come yet.
    pub async fn emergency_stop(&self) -> DeviceResult<()> {
        self.inner.interlock.latch();
        warn!(kind = %self.inner.kind, "Emergency stop");
        self.inner.device.emergency_stop().await
    }

    /// True while the emergency stop is latched.
    pub fn is_estopped(&self) -> bool {
        self.inner.interlock.latched.load(Ordering::SeqCst)
    }

    /// Release the emergency-stop latch.
    ///
    /// Fails with `SafetyViolation` while the safety monitor still reports an
    /// unresolved violation. Motion stays disabled; the caller must `enable`.
    pub fn acknowledge_emergency_stop(&self) -> DeviceResult<()> {
        if let Some(violation) = self.inner.interlock.unresolved.lock().clone() {
            return Err(DeviceError::SafetyViolation(Box::new(violation)));
        }
        if self.inner.interlock.latched.swap(false, Ordering::SeqCst) {
            info!("Emergency stop acknowledged");
        }
        Ok(())
    }

    /// Position setpoint in encoder counts.
    pub async fn set_position(&self, counts: i32) -> DeviceResult<()> {
        self.inner.interlock.check("set_position")?;
        self.bounds().check_position(counts)?;
        self.inner.device.set_position(counts).await
    }

    /// Velocity setpoint in RPM.
    pub async fn set_velocity(&self, rpm: i32) -> DeviceResult<()> {
        self.inner.interlock.check("set_velocity")?;
        self.bounds().check_velocity(rpm)?;
        self.inner.device.set_velocity(rpm).await
    }

    /// Torque setpoint in mNm.
    pub async fn set_torque(&self, mnm: i32) -> DeviceResult<()> {
        self.inner.interlock.check("set_torque")?;
        self.bounds().check_torque(mnm)?;
        self.inner.device.set_torque(mnm).await
    }

    /// Current setpoint in mA.
    pub async fn set_current(&self, ma: i32) -> DeviceResult<()> {
        self.inner.interlock.check("set_current")?;
        self.bounds().check_current(ma)?;
        self.inner.device.set_current(ma).await
    }

    // =========================================================================
    // Sensors and Tuning
    // =========================================================================

    /// One fresh sample, read directly from the backend.
    pub async fn get_sensors(&self) -> DeviceResult<SensorSample> {
        self.inner.device.get_sensors().await
    }

    /// Write position loop gains.
    pub async fn set_pid_params(&self, gains: PidGains) -> DeviceResult<()> {
        self.inner.device.set_pid_params(gains).await
    }

    /// Read position loop gains.
    pub async fn get_pid_params(&self) -> DeviceResult<PidGains> {
        self.inner.device.get_pid_params().await
    }

    /// Write the motion profile.
    pub async fn set_motion_profile(&self, profile: MotionProfile) -> DeviceResult<()> {
        self.inner.device.set_motion_profile(profile).await
    }

    /// Read the motion profile.
    pub async fn get_motion_profile(&self) -> DeviceResult<MotionProfile> {
        self.inner.device.get_motion_profile().await
    }

    /// Configure a limit on the remote controller.
    pub async fn set_limit(&self, limit: LimitType, value: i32) -> DeviceResult<()> {
        self.inner.device.set_limit(limit, value).await
    }

    /// Capture present force readings as zero.
    pub async fn zero_sensors(&self) -> DeviceResult<()> {
        self.inner.device.zero_sensors().await
    }

    // =========================================================================
    // Streaming
    // =========================================================================

    /// Start background acquisition at `rate_hz`.
    pub async fn start_streaming(&self, rate_hz: f64) -> DeviceResult<()> {
        self.inner.streaming.start(rate_hz).await
    }

    /// Stop background acquisition; returns once the task has exited.
    pub async fn stop_streaming(&self) -> DeviceResult<()> {
        self.inner.streaming.stop().await
    }

    /// Register a sample sink with its own drop-oldest queue.
    pub fn subscribe(&self, name: &str, capacity: usize) -> SampleReceiver {
        self.inner.streaming.subscribe(name, capacity)
    }

    /// Lossless feed of the streamed samples `predicate` selects.
    pub fn subscribe_matching(
        &self,
        name: &str,
        predicate: SamplePredicate,
    ) -> mpsc::UnboundedReceiver<TaggedSample> {
        self.inner.streaming.subscribe_matching(name, predicate)
    }

    #[cfg(test)]
    pub(crate) fn streaming(&self) -> &StreamingEngine {
        &self.inner.streaming
    }

    /// Tag streamed samples with a run identifier.
    pub fn set_run_id(&self, run_id: Option<Uuid>) {
        self.inner.streaming.set_run_id(run_id);
    }

    /// Watch the streaming lifecycle.
    pub fn stream_status(&self) -> watch::Receiver<StreamStatus> {
        self.inner.streaming.status()
    }

    /// Streaming counters.
    pub fn stream_stats(&self) -> StreamStats {
        self.inner.streaming.stats()
    }

    /// True while background acquisition runs.
    pub fn is_streaming(&self) -> bool {
        self.inner.streaming.is_running()
    }

    /// Most recent streamed sample.
    pub fn last_sample(&self) -> Option<SensorSample> {
        self.inner.streaming.last_sample()
    }
}
