//! Randomised configurations never produce commands outside the envelope.

use proptest::prelude::*;
use std::sync::Arc;
use tendon_core::mechanics::current_for_torque_ma;
use tendon_core::{BackendKind, CommandBounds, DeviceLimits};
use tendon_driver_sim::{SimCommand, SimConfig, SimulatedRig};
use tendon_experiment::{RunStatus, TestConfig, TestEngine, TestKind};
use tendon_hardware::{DeviceHandle, StreamSettings};

fn limits() -> DeviceLimits {
    DeviceLimits {
        current_max: 900,
        position_max: 9_000,
        ..DeviceLimits::default()
    }
}

fn torque_case() -> impl Strategy<Value = (TestKind, TestConfig)> {
    (0.0..400.0f64, 2i64..6, 0.1..0.5f64, any::<bool>()).prop_map(|(max, steps, hold, down)| {
        let config = TestConfig::new()
            .with("torque_max_mnm", max)
            .with("steps", steps)
            .with("hold_s", hold)
            .with("settle_s", 0.2)
            .with("ramp_down", down);
        (TestKind::TorqueEfficiency, config)
    })
}

fn hysteresis_case() -> impl Strategy<Value = (TestKind, TestConfig)> {
    (0i64..12_000, 0i64..12_000, 3i64..5, 10i64..2_000).prop_map(|(lo, hi, points, offset)| {
        let config = TestConfig::new()
            .with("position_min", lo)
            .with("position_max", hi)
            .with("test_points", points)
            .with("approach_offset", offset)
            .with("settle_s", 0.1);
        (TestKind::Hysteresis, config)
    })
}

fn stiffness_case() -> impl Strategy<Value = (TestKind, TestConfig)> {
    (0i64..12_000, 1.0..3.0f64).prop_map(|(position, hold)| {
        let config = TestConfig::new()
            .with("test_position", position)
            .with("settle_s", 0.5)
            .with("hold_s", hold);
        (TestKind::Stiffness, config)
    })
}

fn hold_case() -> impl Strategy<Value = (TestKind, TestConfig)> {
    (0.5..12.0f64, 0.5..2.0f64).prop_map(|(force, interval)| {
        let config = TestConfig::new()
            .with("target_force_n", force)
            .with("duration_min", 0.1)
            .with("sample_interval_s", interval)
            .with("settle_s", 0.5);
        (TestKind::StaticHold, config)
    })
}

fn endurance_case() -> impl Strategy<Value = (TestKind, TestConfig)> {
    (0i64..12_000, 0i64..12_000, 1i64..4).prop_map(|(start, end, cycles)| {
        let config = TestConfig::new()
            .with("position_start", start)
            .with("position_end", end)
            .with("num_cycles", cycles)
            .with("dwell_start_s", 0.2)
            .with("dwell_end_s", 0.2)
            .with("move_time_s", 0.5);
        (TestKind::Endurance, config)
    })
}

fn any_case() -> impl Strategy<Value = (TestKind, TestConfig)> {
    prop_oneof![
        torque_case(),
        hysteresis_case(),
        stiffness_case(),
        hold_case(),
        endurance_case(),
    ]
}

fn run(kind: TestKind, config: &TestConfig, seed: u64) -> (Option<RunStatus>, Vec<SimCommand>) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap();
    runtime.block_on(async {
        let sim = Arc::new(SimulatedRig::new(SimConfig::seeded(seed)));
        let limits = limits();
        let handle = DeviceHandle::new(
            sim.clone(),
            BackendKind::Simulated,
            CommandBounds::from_limits(&limits),
            StreamSettings::default(),
        );
        handle.connect().await.unwrap();
        let engine = TestEngine::new(handle, limits);
        let status = engine.run_quiet(kind, config).await.ok().map(|s| s.status);
        (status, sim.command_log().await)
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(40))]

    #[test]
    fn commands_stay_inside_the_limits((kind, config) in any_case(), seed in any::<u64>()) {
        let limits = limits();
        let (status, log) = run(kind, &config, seed);

        match status {
            None => prop_assert!(log.is_empty(), "rejected {kind} run still commanded the rig"),
            Some(status) => prop_assert_eq!(status, RunStatus::Completed),
        }
        for command in &log {
            match *command {
                SimCommand::Position(p) => {
                    prop_assert!(p >= limits.position_min && p <= limits.position_max, "position {}", p);
                }
                SimCommand::Current(ma) => {
                    prop_assert!(ma.unsigned_abs() <= limits.current_max, "current {}", ma);
                }
                SimCommand::Torque(mnm) => {
                    let ma = current_for_torque_ma(f64::from(mnm)).abs();
                    prop_assert!(ma <= f64::from(limits.current_max) + 1e-6, "torque {}", mnm);
                }
                _ => {}
            }
        }
    }
}
