//! Run lifecycle: refusal, pause, stop and run-ending failures.

use std::sync::Arc;
use std::time::Duration;
use tendon_core::{BackendKind, CommandBounds, DeviceError, DeviceLimits, ErrorKind, LimitChannel};
use tendon_driver_sim::{SimCommand, SimConfig, SimulatedRig};
use tendon_experiment::{
    EngineError, ProgressUpdate, RunStatus, TestConfig, TestEngine, TestKind, TestResult,
};
use tendon_hardware::{DeviceHandle, SafetyConfig, SafetyMonitor, StreamSettings};
use tokio::sync::mpsc;

fn handle_for(sim: &Arc<SimulatedRig>, limits: &DeviceLimits) -> DeviceHandle {
    DeviceHandle::new(
        sim.clone(),
        BackendKind::Simulated,
        CommandBounds::from_limits(limits),
        StreamSettings {
            failure_threshold: 3,
            ..StreamSettings::default()
        },
    )
}

async fn rig() -> (Arc<SimulatedRig>, TestEngine) {
    let sim = Arc::new(SimulatedRig::new(SimConfig::deterministic(21)));
    let limits = DeviceLimits::default();
    let handle = handle_for(&sim, &limits);
    handle.connect().await.unwrap();
    (sim, TestEngine::new(handle, limits))
}

fn cycles(n: i64) -> TestConfig {
    TestConfig::new()
        .with("num_cycles", n)
        .with("dwell_start_s", 0.5)
        .with("dwell_end_s", 0.5)
        .with("move_time_s", 1.0)
}

#[tokio::test(start_paused = true)]
async fn invalid_configuration_never_reaches_the_device() {
    let (sim, engine) = rig().await;
    // 500 mNm needs more than the 1 A limit.
    let config = TestConfig::new().with("torque_max_mnm", 500.0);
    let err = engine
        .run_quiet(TestKind::TorqueEfficiency, &config)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidConfig(_)));

    let err = engine
        .run_quiet(TestKind::Endurance, &TestConfig::new().with("cycles", 5_i64))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidConfig(_)));

    assert!(sim.command_log().await.is_empty());
    assert_eq!(engine.status(), RunStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn disconnected_device_is_refused() {
    let sim = Arc::new(SimulatedRig::new(SimConfig::deterministic(22)));
    let limits = DeviceLimits::default();
    let engine = TestEngine::new(handle_for(&sim, &limits), limits);
    let err = engine
        .run_quiet(TestKind::Hysteresis, &TestConfig::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Device(DeviceError::NotConnected)));
}

#[tokio::test(start_paused = true)]
async fn controls_need_an_active_run() {
    let (_sim, engine) = rig().await;
    assert!(matches!(
        engine.pause(),
        Err(EngineError::InvalidState { action: "pause", .. })
    ));
    assert!(engine.resume().is_err());
    assert!(engine.stop().is_err());
}

#[tokio::test(start_paused = true)]
async fn pause_freezes_the_run_until_resumed() {
    let (sim, engine) = rig().await;
    let config = cycles(4);
    let (tx, mut rx) = mpsc::unbounded_channel::<ProgressUpdate>();
    let controller = async {
        while let Some(update) = rx.recv().await {
            if update.fraction >= 0.25 {
                break;
            }
        }
        engine.pause().unwrap();
        while engine.status() != RunStatus::Paused {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let frozen = sim.command_log().await.len();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(engine.status(), RunStatus::Paused);
        assert_eq!(sim.command_log().await.len(), frozen);

        // A second run cannot start meanwhile.
        let busy = engine.run_quiet(TestKind::Hysteresis, &TestConfig::new()).await;
        assert!(matches!(busy, Err(EngineError::Busy)));
        engine.resume().unwrap();
    };
    let (state, ()) = tokio::join!(engine.run_test(TestKind::Endurance, &config, &tx), controller);
    let state = state.unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    let Some(TestResult::Endurance(result)) = state.result else {
        panic!("expected an endurance result");
    };
    assert_eq!(result.summary.cycles_completed, 4);

    // Progress never goes backwards, and the pause was reported.
    drop(tx);
    let mut last = 0.0;
    let mut saw_pause = false;
    while let Some(update) = rx.recv().await {
        assert!(update.fraction >= last);
        last = update.fraction;
        saw_pause |= update.status == RunStatus::Paused;
    }
    assert!(saw_pause);
    assert_eq!(last, 1.0);
}

#[tokio::test(start_paused = true)]
async fn stop_aborts_and_disables_actuation() {
    let (sim, engine) = rig().await;
    let config = cycles(50);
    let (tx, mut rx) = mpsc::unbounded_channel::<ProgressUpdate>();
    let controller = async {
        while let Some(update) = rx.recv().await {
            if update.fraction > 0.0 {
                engine.stop().unwrap();
                break;
            }
        }
    };
    let (state, ()) = tokio::join!(engine.run_test(TestKind::Endurance, &config, &tx), controller);
    let state = state.unwrap();
    assert_eq!(state.status, RunStatus::Aborted);
    assert!(state.failure.is_none());
    assert!(state.result.is_none());
    assert!(state.finished_at.is_some());
    assert!(!sim.is_enabled().await);
    assert_eq!(sim.command_log().await.last(), Some(&SimCommand::Disable));

    // The engine is free again.
    let next = engine
        .run_quiet(TestKind::Endurance, &cycles(1))
        .await
        .unwrap();
    assert_eq!(next.status, RunStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn safety_trip_fails_the_run_with_the_violation() {
    let sim = Arc::new(SimulatedRig::new(SimConfig::deterministic(23)));
    let limits = DeviceLimits {
        current_max: 300,
        ..DeviceLimits::default()
    };
    let handle = handle_for(&sim, &limits);
    handle.connect().await.unwrap();
    let config = SafetyConfig {
        check_rate_hz: 200.0,
        ..SafetyConfig::default()
    };
    let monitor = SafetyMonitor::new(handle.clone(), limits, config);
    monitor.start().await;
    let engine = TestEngine::new(handle.clone(), DeviceLimits::default()).with_safety(monitor.clone());
    assert_eq!(engine.limits().current_max, 300);

    // Fast strokes draw about 620 mA.
    let state = engine
        .run_quiet(TestKind::Endurance, &cycles(3))
        .await
        .unwrap();
    assert_eq!(state.status, RunStatus::Failed);
    let failure = state.failure.expect("failure recorded");
    assert_eq!(failure.kind, ErrorKind::SafetyViolation);
    assert_eq!(failure.violation.map(|v| v.channel), Some(LimitChannel::Current));
    assert!(failure.last_sample.is_some());
    assert!(sim.emergency_stop_count() >= 1);
    assert!(!sim.is_enabled().await);

    // Latched until the operator acknowledges.
    let refused = engine.run_quiet(TestKind::Endurance, &cycles(1)).await;
    assert!(matches!(refused, Err(EngineError::EmergencyStopLatched)));
    tokio::time::sleep(Duration::from_millis(200)).await;
    monitor.acknowledge().unwrap();
    assert!(!handle.is_estopped());
    monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn streaming_failure_fails_the_run() {
    let (sim, engine) = rig().await;
    engine.handle().start_streaming(100.0).await.unwrap();
    let config = TestConfig::new()
        .with("duration_min", 0.2)
        .with("sample_interval_s", 1.0);
    let (tx, mut rx) = mpsc::unbounded_channel::<ProgressUpdate>();
    let controller = async {
        while let Some(update) = rx.recv().await {
            if update.fraction > 0.0 {
                sim.fail_next_reads(3).await;
                break;
            }
        }
    };
    let (state, ()) = tokio::join!(engine.run_test(TestKind::StaticHold, &config, &tx), controller);
    let state = state.unwrap();
    assert_eq!(state.status, RunStatus::Failed);
    let failure = state.failure.expect("failure recorded");
    assert_eq!(failure.kind, ErrorKind::StreamingFailure);
    assert!(failure.last_sample.is_some());
}

#[tokio::test(start_paused = true)]
async fn streamed_samples_carry_the_run_id() {
    let (_sim, engine) = rig().await;
    let mut recorder = engine.handle().subscribe("recorder", 4_096);
    engine.handle().start_streaming(50.0).await.unwrap();
    let config = TestConfig::new()
        .with("test_points", 3_i64)
        .with("settle_s", 0.2);
    let state = engine.run_quiet(TestKind::Hysteresis, &config).await.unwrap();
    engine.handle().stop_streaming().await.unwrap();

    assert_eq!(state.status, RunStatus::Completed);
    assert!(state.samples_seen > 0);
    let tagged = recorder.drain();
    assert!(tagged.iter().any(|t| t.run_id == Some(state.run_id)));
    assert!(tagged.iter().all(|t| t.run_id.is_none() || t.run_id == Some(state.run_id)));
}
