//! Background sensor acquisition with fan-out to bounded sinks.
//!
//! The engine runs as one tokio task per streaming session. Each tick it reads
//! a sample (polled through `get_sensors`, or pulled from the backend's push
//! feed when it offers one) and hands a copy to every registered sink without
//! waiting on any of them. Matchers see each sample before the sinks do and
//! never lose one. After `failure_threshold` consecutive failed reads
//! the task stops itself and publishes [`StreamStatus::Failed`].

use crate::sink::{matcher, sample_channel, Matcher, SamplePredicate, SampleReceiver, SinkSender};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tendon_core::limits::{DEFAULT_READ_TIMEOUT, DEFAULT_STREAM_FAILURE_THRESHOLD, SHUTDOWN_TIMEOUT};
use tendon_core::{
    Device, DeviceError, DeviceResult, FailureReport, SampleFeed, SensorSample, TaggedSample,
};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lifecycle of the acquisition task.
#[derive(Debug, Clone, Default)]
pub enum StreamStatus {
    /// Not streaming.
    #[default]
    Idle,
    /// Acquiring at the given rate.
    Running {
        /// Requested sample rate.
        rate_hz: f64,
    },
    /// Stopped itself after repeated acquisition failures.
    Failed(FailureReport),
}

impl StreamStatus {
    /// True while the acquisition task is running.
    pub fn is_running(&self) -> bool {
        matches!(self, StreamStatus::Running { .. })
    }
}

/// Counters since the engine was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Samples acquired and fanned out.
    pub delivered: u64,
    /// Reads that failed or timed out.
    pub failed_reads: u64,
    /// Samples sinks reported lost by falling behind, over all sinks ever
    /// registered.
    pub dropped: u64,
}

/// Acquisition parameters.
#[derive(Debug, Clone, Copy)]
pub struct StreamSettings {
    /// Consecutive failures that stop the engine.
    pub failure_threshold: u32,
    /// Upper bound on one read.
    pub read_timeout: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_STREAM_FAILURE_THRESHOLD,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

#[derive(Debug, Default)]
struct StopSignal {
    requested: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

struct Shared {
    sinks: Mutex<Vec<SinkSender>>,
    matchers: Mutex<Vec<Matcher>>,
    run_id: RwLock<Option<Uuid>>,
    last_sample: Mutex<Option<SensorSample>>,
    delivered: AtomicU64,
    failed_reads: AtomicU64,
    retired_drops: AtomicU64,
    status: watch::Sender<StreamStatus>,
}

impl Shared {
    fn fan_out(&self, sample: SensorSample) {
        let tagged = TaggedSample {
            run_id: *self.run_id.read(),
            sample,
        };
        *self.last_sample.lock() = Some(sample);
        self.delivered.fetch_add(1, Ordering::Relaxed);

        {
            let mut matchers = self.matchers.lock();
            matchers.retain(|m| {
                if m.is_open() {
                    return true;
                }
                debug!(matcher = m.name(), "Matcher closed, removing");
                false
            });
            for m in matchers.iter() {
                m.offer(tagged);
            }
        }

        let mut sinks = self.sinks.lock();
        sinks.retain(|sink| {
            if sink.is_open() {
                return true;
            }
            debug!(sink = sink.name(), "Sink closed, removing");
            self.retired_drops.fetch_add(sink.dropped(), Ordering::Relaxed);
            false
        });
        for sink in sinks.iter() {
            sink.push(tagged);
        }
    }
}

struct Session {
    stop: Arc<StopSignal>,
    task: JoinHandle<()>,
}

/// Streaming engine bound to one device.
pub struct StreamingEngine {
    device: Arc<dyn Device>,
    settings: StreamSettings,
    shared: Arc<Shared>,
    session: tokio::sync::Mutex<Option<Session>>,
}

impl StreamingEngine {
    /// Engine for `device`.
    pub fn new(device: Arc<dyn Device>, settings: StreamSettings) -> Self {
        let (status, _) = watch::channel(StreamStatus::Idle);
        Self {
            device,
            settings,
            shared: Arc::new(Shared {
                sinks: Mutex::new(Vec::new()),
                matchers: Mutex::new(Vec::new()),
                run_id: RwLock::new(None),
                last_sample: Mutex::new(None),
                delivered: AtomicU64::new(0),
                failed_reads: AtomicU64::new(0),
                retired_drops: AtomicU64::new(0),
                status,
            }),
            session: tokio::sync::Mutex::new(None),
        }
    }

    /// Register a consumer with its own queue of at least `capacity` samples.
    ///
    /// Dropping the receiver unregisters it on the next tick.
    pub fn subscribe(&self, name: &str, capacity: usize) -> SampleReceiver {
        let (tx, rx) = sample_channel(name, capacity);
        self.shared.sinks.lock().push(tx);
        rx
    }

    /// Register a lossless feed of the samples `predicate` selects.
    ///
    /// The predicate runs on the acquisition task for every sample, before
    /// any sink sees it, so it must be cheap.
    pub fn subscribe_matching(
        &self,
        name: &str,
        predicate: SamplePredicate,
    ) -> mpsc::UnboundedReceiver<TaggedSample> {
        let (m, rx) = matcher(name, predicate);
        self.shared.matchers.lock().push(m);
        rx
    }

    #[cfg(test)]
    pub(crate) fn inject(&self, sample: SensorSample) {
        self.shared.fan_out(sample);
    }

    /// Tag subsequent samples with `run_id`.
    pub fn set_run_id(&self, run_id: Option<Uuid>) {
        *self.shared.run_id.write() = run_id;
    }

    /// Watch the engine's lifecycle.
    pub fn status(&self) -> watch::Receiver<StreamStatus> {
        self.shared.status.subscribe()
    }

    /// Current lifecycle state.
    pub fn current_status(&self) -> StreamStatus {
        self.shared.status.borrow().clone()
    }

    /// Most recent sample acquired.
    pub fn last_sample(&self) -> Option<SensorSample> {
        *self.shared.last_sample.lock()
    }

    /// Counters since creation.
    pub fn stats(&self) -> StreamStats {
        let live: u64 = self.shared.sinks.lock().iter().map(SinkSender::dropped).sum();
        StreamStats {
            delivered: self.shared.delivered.load(Ordering::Relaxed),
            failed_reads: self.shared.failed_reads.load(Ordering::Relaxed),
            dropped: live + self.shared.retired_drops.load(Ordering::Relaxed),
        }
    }

    /// Start acquiring at `rate_hz`. A running session is stopped first.
    pub async fn start(&self, rate_hz: f64) -> DeviceResult<()> {
        if !(rate_hz.is_finite() && rate_hz > 0.0) {
            return Err(DeviceError::rejected(
                "start_streaming",
                format!("rate {rate_hz} Hz must be positive"),
            ));
        }
        if !self.device.is_connected() {
            return Err(DeviceError::NotConnected);
        }
        self.stop().await?;

        let feed = self.device.open_feed(rate_hz).await?;
        let stop = Arc::new(StopSignal::default());
        let acquisition = Acquisition {
            device: self.device.clone(),
            shared: self.shared.clone(),
            stop: stop.clone(),
            settings: self.settings,
            period: Duration::from_secs_f64(1.0 / rate_hz),
        };
        let task = match feed {
            Some(feed) => tokio::spawn(acquisition.run_feed(feed)),
            None => tokio::spawn(acquisition.run_polled()),
        };

        self.shared.status.send_replace(StreamStatus::Running { rate_hz });
        *self.session.lock().await = Some(Session { stop, task });
        info!(rate_hz, "Streaming started");
        Ok(())
    }

    /// Stop acquiring and wait for the task to exit.
    ///
    /// Returns only once the task has been joined, so the caller may
    /// disconnect right after. Stopping an idle engine is a no-op.
    pub async fn stop(&self) -> DeviceResult<()> {
        let Some(Session { stop, mut task }) = self.session.lock().await.take() else {
            return Ok(());
        };
        stop.request();

        if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut task).await.is_err() {
            warn!("Acquisition task did not stop in time, aborting");
            task.abort();
            let _ = task.await;
        }

        let feed_closed = self.device.close_feed().await;
        self.shared.status.send_if_modified(|status| {
            if status.is_running() {
                *status = StreamStatus::Idle;
                true
            } else {
                false
            }
        });
        info!("Streaming stopped");
        feed_closed
    }

    /// True while a session is active.
    pub fn is_running(&self) -> bool {
        self.shared.status.borrow().is_running()
    }
}

struct Acquisition {
    device: Arc<dyn Device>,
    shared: Arc<Shared>,
    stop: Arc<StopSignal>,
    settings: StreamSettings,
    period: Duration,
}

impl Acquisition {
    /// Record a failed read. Returns true once the failure threshold is hit.
    fn record_failure(&self, consecutive: &mut u32, err: DeviceError) -> bool {
        *consecutive += 1;
        self.shared.failed_reads.fetch_add(1, Ordering::Relaxed);
        warn!(error = %err, consecutive = *consecutive, "Sensor read failed");
        if *consecutive < self.settings.failure_threshold {
            return false;
        }

        let report = FailureReport::new(
            DeviceError::StreamingFailure {
                consecutive_failures: *consecutive,
                last_error: err.to_string(),
            },
            *self.shared.last_sample.lock(),
        );
        error!(error = %report, "Streaming stopped after repeated failures");
        self.shared.status.send_replace(StreamStatus::Failed(report));
        true
    }

    async fn run_polled(self) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut consecutive = 0u32;

        loop {
            tokio::select! {
                _ = self.stop.notify.notified() => {}
                _ = ticker.tick() => {}
            }
            if self.stop.is_requested() {
                break;
            }

            let read = tokio::time::timeout(self.settings.read_timeout, self.device.get_sensors())
                .await
                .unwrap_or_else(|_| {
                    Err(DeviceError::timeout("get_sensors", self.settings.read_timeout))
                });
            match read {
                Ok(sample) => {
                    consecutive = 0;
                    self.shared.fan_out(sample);
                }
                Err(err) => {
                    if self.record_failure(&mut consecutive, err) {
                        break;
                    }
                }
            }
        }
        debug!("Polled acquisition exited");
    }

    async fn run_feed(self, mut feed: SampleFeed) {
        let mut consecutive = 0u32;
        loop {
            let item = tokio::select! {
                _ = self.stop.notify.notified() => break,
                item = tokio::time::timeout(self.settings.read_timeout, feed.recv()) => item,
            };
            if self.stop.is_requested() {
                break;
            }

            let result = match item {
                Ok(Some(result)) => result,
                Ok(None) => {
                    consecutive = self.settings.failure_threshold.saturating_sub(1);
                    Err(DeviceError::Io("stream socket closed".into()))
                }
                Err(_) => Err(DeviceError::timeout("stream", self.settings.read_timeout)),
            };
            match result {
                Ok(sample) => {
                    consecutive = 0;
                    self.shared.fan_out(sample);
                }
                Err(err) => {
                    if self.record_failure(&mut consecutive, err) {
                        break;
                    }
                }
            }
        }
        debug!("Feed acquisition exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tendon_driver_sim::{SimConfig, SimulatedRig};
    use tracing_test::traced_test;

    async fn engine(threshold: u32) -> (Arc<SimulatedRig>, StreamingEngine) {
        let sim = Arc::new(SimulatedRig::new(SimConfig::deterministic(11)));
        sim.connect().await.unwrap();
        let engine = StreamingEngine::new(
            sim.clone(),
            StreamSettings {
                failure_threshold: threshold,
                read_timeout: Duration::from_millis(200),
            },
        );
        (sim, engine)
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_to_every_sink_at_rate() {
        let (_sim, engine) = engine(3).await;
        let mut a = engine.subscribe("a", 1_000);
        let mut b = engine.subscribe("b", 1_000);

        engine.start(100.0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(995)).await;
        engine.stop().await.unwrap();

        let got_a = a.drain().len();
        let got_b = b.drain().len();
        assert_eq!(got_a, got_b);
        assert!((99..=101).contains(&got_a), "got {got_a}");
        assert!(!engine.is_running());
        assert_eq!(engine.stats().delivered, got_a as u64);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_sink_loses_oldest_without_stalling_others() {
        let (_sim, engine) = engine(3).await;
        let mut slow = engine.subscribe("slow", 8);
        let mut fast = engine.subscribe("fast", 1_024);

        engine.start(100.0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        engine.stop().await.unwrap();

        let fast_samples = fast.drain();
        let slow_samples = slow.drain();
        assert_eq!(slow_samples.len(), 8);
        assert!(fast_samples.len() >= 45);
        assert_eq!(slow.dropped(), (fast_samples.len() - 8) as u64);
        assert_eq!(engine.stats().dropped, slow.dropped());
        assert_eq!(
            slow_samples.last().unwrap().sample.timestamp,
            fast_samples.last().unwrap().sample.timestamp
        );
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_failures_stop_the_engine() {
        let (sim, engine) = engine(3).await;
        let mut status = engine.status();
        engine.start(50.0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        sim.fail_next_reads(10).await;

        status
            .wait_for(|s| matches!(s, StreamStatus::Failed(_)))
            .await
            .unwrap();
        let StreamStatus::Failed(report) = engine.current_status() else {
            panic!("expected failure");
        };
        assert!(matches!(
            report.error,
            DeviceError::StreamingFailure {
                consecutive_failures: 3,
                ..
            }
        ));
        assert!(report.last_sample.is_some());
        assert_eq!(engine.stats().failed_reads, 3);
        engine.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn failure_is_logged_as_error() {
        let (sim, engine) = engine(2).await;
        let mut status = engine.status();
        sim.fail_next_reads(5).await;
        engine.start(50.0).await.unwrap();
        status
            .wait_for(|s| matches!(s, StreamStatus::Failed(_)))
            .await
            .unwrap();
        assert!(logs_contain("Streaming stopped after repeated failures"));
        assert!(logs_contain("Sensor read failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn samples_carry_the_active_run_id() {
        let (_sim, engine) = engine(3).await;
        let mut sink = engine.subscribe("logger", 64);
        let run = Uuid::new_v4();
        engine.set_run_id(Some(run));
        engine.start(20.0).await.unwrap();
        let first = sink.recv().await.unwrap();
        engine.stop().await.unwrap();
        assert_eq!(first.run_id, Some(run));
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_bad_rate_and_disconnected_device() {
        let (sim, engine) = engine(3).await;
        assert!(engine.start(0.0).await.is_err());
        sim.disconnect().await.unwrap();
        assert!(matches!(
            engine.start(10.0).await,
            Err(DeviceError::NotConnected)
        ));
        engine.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_sinks_are_unregistered() {
        let (_sim, engine) = engine(3).await;
        let mut sink = engine.subscribe("short-lived", 2);
        engine.start(100.0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.drain().len(), 2);
        drop(sink);
        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.stop().await.unwrap();
        assert!(engine.shared.sinks.lock().is_empty());
        assert!(engine.stats().dropped > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn matchers_see_every_selected_sample_ahead_of_lagging_sinks() {
        let (_sim, engine) = engine(3).await;
        let mut sink = engine.subscribe("plot", 64);
        let mut spikes =
            engine.subscribe_matching("spikes", Arc::new(|s: &SensorSample| s.current > 1_000));

        let sample = |timestamp: f64, current: u32| SensorSample {
            timestamp,
            position: 5_000,
            velocity: 0,
            current,
            force_tendon: 0,
            force_tip: 0,
            angle_joint: 0,
        };
        engine.inject(sample(0.0, 5_000));
        for t in 1..=100 {
            engine.inject(sample(f64::from(t), 100));
        }

        assert_eq!(spikes.try_recv().unwrap().sample.current, 5_000);
        assert!(spikes.try_recv().is_err());
        let streamed = sink.drain();
        assert_eq!(streamed.len(), 64);
        assert!(streamed.iter().all(|t| t.sample.current == 100));
        assert_eq!(sink.dropped(), 37);
    }
}
