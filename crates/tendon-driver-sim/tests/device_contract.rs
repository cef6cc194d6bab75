//! Exercises the simulator purely through the `Device` trait object.

use std::sync::Arc;
use std::time::Duration;
use tendon_core::{Capability, Device, DeviceError, LimitType, MotionProfile, PidGains, TransportKind};
use tendon_driver_sim::{SimCommand, SimConfig, SimulatedRig};

fn rig(config: SimConfig) -> (Arc<SimulatedRig>, Arc<dyn Device>) {
    let sim = Arc::new(SimulatedRig::new(config));
    let device: Arc<dyn Device> = sim.clone();
    (sim, device)
}

#[tokio::test(start_paused = true)]
async fn platform_info_lists_core_capabilities() {
    let (_, device) = rig(SimConfig::default());
    let info = device.platform_info();
    assert_eq!(info.transport, TransportKind::Simulated);
    assert!(info.supports(Capability::EmergencyStop));
    assert!(!info.supports(Capability::PushStreaming));
}

#[tokio::test(start_paused = true)]
async fn parameters_round_trip_through_device() {
    let (sim, device) = rig(SimConfig::deterministic(5));
    device.connect().await.unwrap();

    let gains = PidGains { kp: 2.5, ki: 0.2, kd: 0.01 };
    device.set_pid_params(gains).await.unwrap();
    assert_eq!(device.get_pid_params().await.unwrap(), gains);

    let profile = MotionProfile { max_velocity_rpm: 1500.0, ..MotionProfile::default() };
    device.set_motion_profile(profile).await.unwrap();
    assert_eq!(device.get_motion_profile().await.unwrap(), profile);

    device.set_limit(LimitType::Current, 500).await.unwrap();
    assert!(matches!(
        device.set_current(600).await,
        Err(DeviceError::CommandRejected { .. })
    ));

    let log = sim.command_log().await;
    assert_eq!(log[0], SimCommand::Pid(gains));
    assert_eq!(log.last(), Some(&SimCommand::Current(600)));
}

#[tokio::test(start_paused = true)]
async fn backlash_shows_as_direction_dependent_offset() {
    let (_, device) = rig(SimConfig {
        backlash_counts: 40.0,
        ..SimConfig::deterministic(9)
    });
    device.connect().await.unwrap();
    device.enable().await.unwrap();

    device.set_position(2_000).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    let forward = device.get_sensors().await.unwrap().position;

    device.set_position(4_000).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    device.set_position(2_000).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    let backward = device.get_sensors().await.unwrap().position;

    assert_eq!(backward - forward, 40);
}

#[tokio::test(start_paused = true)]
async fn velocity_mode_reports_rpm() {
    let (_, device) = rig(SimConfig::deterministic(2));
    device.connect().await.unwrap();
    device.enable().await.unwrap();
    device.set_velocity(600).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let sample = device.get_sensors().await.unwrap();
    assert_eq!(sample.velocity, 600);
    // 600 RPM is 10 000 counts/s
    assert!((990..=1_010).contains(&sample.position));
}
