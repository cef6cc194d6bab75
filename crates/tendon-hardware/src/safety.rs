//! Real-time limit enforcement.
//!
//! The monitor consumes the streamed samples through its own sink and also
//! polls the device itself whenever no streamed sample arrived within one
//! check period, so limits are evaluated at `check_rate_hz` or faster no
//! matter what the test engine is doing. Streamed samples that breach a limit
//! also arrive on a lossless matching feed that is served first, so a breach
//! is never evicted from a lagging sink.
//!
//! Violations are edge-triggered: the first breach latches the handle's
//! interlock and sends the emergency stop. Further breaches are ignored until
//! every channel has dropped back inside the clear band
//! (`clear_fraction` of each limit). Clearing never re-enables motion; an
//! explicit [`SafetyMonitor::acknowledge`] is still required.

use crate::handle::DeviceHandle;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tendon_core::config::SafetySettings;
use tendon_core::limits::{DEFAULT_CLEAR_FRACTION, DEFAULT_READ_TIMEOUT, DEFAULT_SAFETY_RATE_HZ};
use tendon_core::{DeviceError, DeviceLimits, DeviceResult, LimitChannel, SensorSample, Violation};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Ratio of the worst channel above which the rig is reported as `Warning`.
pub const WARNING_RATIO: f64 = 0.8;

const SINK_CAPACITY: usize = 64;

/// Coarse safety state derived from the worst channel's value/limit ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyLevel {
    /// Every channel below 80 % of its limit.
    #[default]
    Safe,
    /// Some channel between 80 % and 100 %.
    Warning,
    /// Some channel at or beyond its limit.
    Danger,
}

impl SafetyLevel {
    /// Classify a value/limit ratio.
    pub fn from_ratio(ratio: f64) -> Self {
        if ratio < WARNING_RATIO {
            SafetyLevel::Safe
        } else if ratio < 1.0 {
            SafetyLevel::Warning
        } else {
            SafetyLevel::Danger
        }
    }
}

/// Notifications published to monitor subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum SafetyEvent {
    /// A limit was breached and the emergency stop was sent.
    Tripped(Violation),
    /// Every channel is back inside the clear band.
    Cleared(SensorSample),
    /// The operator acknowledged the emergency stop.
    Acknowledged,
}

/// Snapshot of the monitor's state.
#[derive(Debug, Clone, Default)]
pub struct SafetyStatus {
    /// Level for the most recent sample.
    pub level: SafetyLevel,
    /// Channel closest to its limit, with its ratio.
    pub worst: Option<(LimitChannel, f64)>,
    /// Violation that has not yet cleared.
    pub active: Option<Violation>,
    /// Most recent trip, kept after it clears for failure reports.
    pub last_trip: Option<Violation>,
    /// Number of trips since the monitor was created.
    pub trips: u64,
    /// Samples evaluated.
    pub checked: u64,
    /// Most recent sample evaluated.
    pub last_sample: Option<SensorSample>,
}

/// Monitor configuration.
#[derive(Debug, Clone, Copy)]
pub struct SafetyConfig {
    /// Minimum evaluation rate in Hz.
    pub check_rate_hz: f64,
    /// Fraction of each limit a channel must fall below to clear.
    pub clear_fraction: f64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            check_rate_hz: DEFAULT_SAFETY_RATE_HZ,
            clear_fraction: DEFAULT_CLEAR_FRACTION,
        }
    }
}

impl From<&SafetySettings> for SafetyConfig {
    fn from(settings: &SafetySettings) -> Self {
        Self {
            check_rate_hz: settings.check_rate_hz,
            clear_fraction: settings.clear_fraction,
        }
    }
}

struct Shared {
    handle: DeviceHandle,
    limits: Arc<RwLock<DeviceLimits>>,
    config: SafetyConfig,
    state: Mutex<SafetyStatus>,
    events: broadcast::Sender<SafetyEvent>,
}

struct Worker {
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Independent limit checker bound to one device handle.
#[derive(Clone)]
pub struct SafetyMonitor {
    shared: Arc<Shared>,
    worker: Arc<tokio::sync::Mutex<Option<Worker>>>,
}

impl SafetyMonitor {
    /// Monitor for `handle` enforcing `limits`.
    pub fn new(handle: DeviceHandle, limits: DeviceLimits, config: SafetyConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                handle,
                limits: Arc::new(RwLock::new(limits)),
                config,
                state: Mutex::new(SafetyStatus::default()),
                events,
            }),
            worker: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    /// Limits currently enforced.
    pub fn limits(&self) -> DeviceLimits {
        *self.shared.limits.read()
    }

    /// Replace the enforced limits. Takes effect on the next sample.
    pub fn set_limits(&self, limits: DeviceLimits) {
        info!(?limits, "Safety limits updated");
        *self.shared.limits.write() = limits;
    }

    /// Subscribe to trip/clear/acknowledge events.
    pub fn subscribe(&self) -> broadcast::Receiver<SafetyEvent> {
        self.shared.events.subscribe()
    }

    /// Snapshot of the monitor state.
    pub fn status(&self) -> SafetyStatus {
        self.shared.state.lock().clone()
    }

    /// True while a violation has not cleared.
    pub fn is_tripped(&self) -> bool {
        self.shared.state.lock().active.is_some()
    }

    /// Evaluate one sample.
    ///
    /// Returns the violation if this sample caused a new trip. The emergency
    /// stop has been sent by the time this returns.
    pub async fn process_sample(&self, sample: SensorSample) -> Option<Violation> {
        let limits = self.limits();
        let (channel, ratio) = limits.worst_ratio(&sample);

        let tripped = {
            let mut state = self.shared.state.lock();
            state.checked += 1;
            state.last_sample = Some(sample);
            state.worst = Some((channel, ratio));
            state.level = SafetyLevel::from_ratio(ratio);

            if state.active.is_some() {
                if limits.is_clear(&sample, self.shared.config.clear_fraction) {
                    state.active = None;
                    self.shared.handle.interlock().set_unresolved(None);
                    info!(t = sample.timestamp, "Safety violation cleared");
                    let _ = self.shared.events.send(SafetyEvent::Cleared(sample));
                }
                None
            } else if let Some(violation) = limits.check(&sample) {
                state.active = Some(violation.clone());
                state.last_trip = Some(violation.clone());
                state.trips += 1;
                // Latch before the wire call so racing commands are refused.
                self.shared.handle.interlock().latch();
                self.shared
                    .handle
                    .interlock()
                    .set_unresolved(Some(violation.clone()));
                Some(violation)
            } else {
                None
            }
        };

        let violation = tripped?;
        error!(
            channel = %violation.channel,
            value = violation.value,
            limit = violation.limit,
            t = violation.sample.timestamp,
            "Safety limit exceeded, sending emergency stop"
        );
        if let Err(err) = self.shared.handle.emergency_stop().await {
            error!(error = %err, "Emergency stop command failed");
        }
        let _ = self.shared.events.send(SafetyEvent::Tripped(violation.clone()));
        Some(violation)
    }

    /// Release the emergency stop once the violation has cleared.
    pub fn acknowledge(&self) -> DeviceResult<()> {
        if let Some(active) = self.shared.state.lock().active.clone() {
            return Err(DeviceError::SafetyViolation(Box::new(active)));
        }
        self.shared.handle.acknowledge_emergency_stop()?;
        let _ = self.shared.events.send(SafetyEvent::Acknowledged);
        Ok(())
    }

    /// Start the background checker. A running checker is left untouched.
    pub async fn start(&self) {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return;
        }
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(self.clone().run(shutdown_rx));
        *worker = Some(Worker { shutdown_tx, task });
        info!(
            rate_hz = self.shared.config.check_rate_hz,
            "Safety monitor started"
        );
    }

    /// Stop the background checker and wait for it to exit.
    pub async fn stop(&self) {
        let Some(Worker { shutdown_tx, task }) = self.worker.lock().await.take() else {
            return;
        };
        let _ = shutdown_tx.send(());
        if let Err(err) = task.await {
            warn!(error = %err, "Safety monitor task ended abnormally");
        }
        info!("Safety monitor stopped");
    }

    async fn run(self, mut shutdown_rx: oneshot::Receiver<()>) {
        let period = Duration::from_secs_f64(1.0 / self.shared.config.check_rate_hz.max(1.0));
        let limits = self.shared.limits.clone();
        let mut breaches = self.shared.handle.subscribe_matching(
            "safety-monitor-breaches",
            Arc::new(move |sample: &SensorSample| limits.read().check(sample).is_some()),
        );
        let mut sink = self.shared.handle.subscribe("safety-monitor", SINK_CAPACITY);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_checked = Instant::now();
        let mut newest = f64::NEG_INFINITY;

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown_rx => break,
                breach = breaches.recv() => {
                    let Some(tagged) = breach else { break };
                    last_checked = Instant::now();
                    newest = newest.max(tagged.sample.timestamp);
                    self.process_sample(tagged.sample).await;
                }
                streamed = sink.recv() => {
                    let Some(tagged) = streamed else { break };
                    last_checked = Instant::now();
                    // Older than a breach already handled.
                    if tagged.sample.timestamp <= newest {
                        continue;
                    }
                    newest = tagged.sample.timestamp;
                    self.process_sample(tagged.sample).await;
                }
                _ = ticker.tick() => {
                    if last_checked.elapsed() < period || !self.shared.handle.is_connected() {
                        continue;
                    }
                    let read = tokio::time::timeout(DEFAULT_READ_TIMEOUT, self.shared.handle.get_sensors()).await;
                    match read {
                        Ok(Ok(sample)) => {
                            last_checked = Instant::now();
                            newest = newest.max(sample.timestamp);
                            self.process_sample(sample).await;
                        }
                        Ok(Err(err)) => debug!(error = %err, "Safety poll failed"),
                        Err(_) => debug!("Safety poll timed out"),
                    }
                }
            }
        }
        debug!("Safety monitor loop exited");
    }
}
