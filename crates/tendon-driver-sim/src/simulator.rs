//! Simulated actuator implementing the [`Device`] contract.

use crate::config::SimConfig;
use crate::physics::{DriveMode, ForceZero, PhysicsState, STEP_S};
use crate::rng::SimRng;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tendon_core::capabilities::CORE_CAPABILITIES;
use tendon_core::limits::DEFAULT_READ_TIMEOUT;
use tendon_core::mechanics::{TIP_FORCE_RATIO, TORQUE_CONSTANT_MNM_PER_MA};
use tendon_core::{
    Device, DeviceError, DeviceLimits, DeviceResult, LimitType, MotionProfile, PidGains,
    PlatformInfo, SensorSample, TransportKind,
};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A command as received by the simulator, recorded for later inspection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SimCommand {
    /// Driver enabled.
    Enable,
    /// Driver disabled.
    Disable,
    /// Emergency stop.
    EmergencyStop,
    /// Position setpoint in counts.
    Position(i32),
    /// Velocity setpoint in RPM.
    Velocity(i32),
    /// Torque setpoint in mNm.
    Torque(i32),
    /// Current setpoint in mA.
    Current(i32),
    /// PID gains written.
    Pid(PidGains),
    /// Motion profile written.
    Profile(MotionProfile),
    /// Remote limit written.
    Limit(LimitType, i32),
    /// Sensors zeroed.
    Zero,
}

const STEP: Duration = Duration::from_millis(1);

struct SimInner {
    physics: PhysicsState,
    rng: SimRng,
    clock: Instant,
    enabled: bool,
    setpoint: DriveMode,
    pid: PidGains,
    profile: MotionProfile,
    remote: DeviceLimits,
    zero: ForceZero,
    failures_pending: u32,
    commands: Vec<SimCommand>,
}

impl SimInner {
    /// Integrate whole steps up to `now`; the remainder carries to the next call.
    fn advance(&mut self, config: &SimConfig, now: Instant) {
        let elapsed = now.saturating_duration_since(self.clock);
        let steps = elapsed.as_micros() / STEP.as_micros();
        for _ in 0..steps {
            self.physics.step(config, STEP_S);
        }
        self.clock += STEP * steps as u32;
    }

    fn apply_setpoint(&mut self, setpoint: DriveMode) {
        self.setpoint = setpoint;
        let effective = if self.enabled {
            setpoint
        } else {
            DriveMode::Disabled
        };
        self.physics.set_mode(effective);
    }

    fn check_remote(&self, command: &str, ok: bool) -> DeviceResult<()> {
        if ok {
            Ok(())
        } else {
            Err(DeviceError::rejected(command, "LIMIT"))
        }
    }
}

/// Deterministic physics-backed actuator.
///
/// Time is taken from `tokio::time`, so tests running with paused time see
/// identical trajectories for identical command sequences and seeds.
pub struct SimulatedRig {
    config: SimConfig,
    inner: Mutex<SimInner>,
    connected: AtomicBool,
    emergency_stops: AtomicU32,
}

impl SimulatedRig {
    /// Build a simulator from `config`. The physics clock starts now.
    pub fn new(config: SimConfig) -> Self {
        let rng = SimRng::new(config.seed);
        Self {
            inner: Mutex::new(SimInner {
                physics: PhysicsState::default(),
                rng,
                clock: Instant::now(),
                enabled: false,
                setpoint: DriveMode::Disabled,
                pid: PidGains::default(),
                profile: MotionProfile::default(),
                remote: DeviceLimits::default(),
                zero: ForceZero::default(),
                failures_pending: 0,
                commands: Vec::new(),
            }),
            config,
            connected: AtomicBool::new(false),
            emergency_stops: AtomicU32::new(0),
        }
    }

    /// Simulator parameters.
    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Make the next `count` reads fail with a timeout.
    pub async fn fail_next_reads(&self, count: u32) {
        self.inner.lock().await.failures_pending = count;
    }

    /// Number of emergency stops received since construction.
    pub fn emergency_stop_count(&self) -> u32 {
        self.emergency_stops.load(Ordering::SeqCst)
    }

    /// Every command received, oldest first.
    pub async fn command_log(&self) -> Vec<SimCommand> {
        self.inner.lock().await.commands.clone()
    }

    /// Physical state advanced to now.
    pub async fn physics(&self) -> PhysicsState {
        let mut inner = self.inner.lock().await;
        inner.advance(&self.config, Instant::now());
        inner.physics.clone()
    }

    /// True while the motor driver is enabled.
    pub async fn is_enabled(&self) -> bool {
        self.inner.lock().await.enabled
    }

    async fn latency(&self) {
        if self.config.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.latency_ms)).await;
        }
    }

    fn ensure_connected(&self) -> DeviceResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DeviceError::NotConnected)
        }
    }

    /// Shared path for every setpoint-style command.
    async fn command<F>(&self, record: SimCommand, apply: F) -> DeviceResult<()>
    where
        F: FnOnce(&mut SimInner) -> DeviceResult<()> + Send,
    {
        self.ensure_connected()?;
        self.latency().await;
        let mut inner = self.inner.lock().await;
        inner.advance(&self.config, Instant::now());
        inner.commands.push(record);
        apply(&mut inner)
    }
}

impl Default for SimulatedRig {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

#[async_trait]
impl Device for SimulatedRig {
    fn platform_info(&self) -> PlatformInfo {
        PlatformInfo {
            name: "Tendon rig simulator".into(),
            transport: TransportKind::Simulated,
            protocol_version: "sim-1".into(),
            capabilities: CORE_CAPABILITIES.to_vec(),
        }
    }

    async fn connect(&self) -> DeviceResult<()> {
        self.connected.store(true, Ordering::SeqCst);
        info!(seed = ?self.config.seed, "Simulator connected");
        Ok(())
    }

    async fn disconnect(&self) -> DeviceResult<()> {
        if self.connected.swap(false, Ordering::SeqCst) {
            let mut inner = self.inner.lock().await;
            inner.advance(&self.config, Instant::now());
            inner.enabled = false;
            inner.apply_setpoint(DriveMode::Disabled);
            info!("Simulator disconnected");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn enable(&self) -> DeviceResult<()> {
        self.command(SimCommand::Enable, |inner| {
            inner.enabled = true;
            let setpoint = match inner.setpoint {
                DriveMode::Disabled => DriveMode::Position(inner.physics.motor),
                other => other,
            };
            inner.apply_setpoint(setpoint);
            Ok(())
        })
        .await
    }

    async fn disable(&self) -> DeviceResult<()> {
        self.command(SimCommand::Disable, |inner| {
            inner.enabled = false;
            inner.apply_setpoint(DriveMode::Disabled);
            Ok(())
        })
        .await
    }

    async fn emergency_stop(&self) -> DeviceResult<()> {
        self.ensure_connected()?;
        let mut inner = self.inner.lock().await;
        inner.advance(&self.config, Instant::now());
        inner.commands.push(SimCommand::EmergencyStop);
        inner.enabled = false;
        inner.apply_setpoint(DriveMode::Disabled);
        self.emergency_stops.fetch_add(1, Ordering::SeqCst);
        warn!("Simulator emergency stop");
        Ok(())
    }

    async fn set_position(&self, counts: i32) -> DeviceResult<()> {
        self.command(SimCommand::Position(counts), |inner| {
            let ok = counts >= inner.remote.position_min && counts <= inner.remote.position_max;
            inner.check_remote("SETPOS", ok)?;
            inner.apply_setpoint(DriveMode::Position(f64::from(counts)));
            Ok(())
        })
        .await
    }

    async fn set_velocity(&self, rpm: i32) -> DeviceResult<()> {
        let max_rpm = self.config.max_velocity_rpm;
        self.command(SimCommand::Velocity(rpm), |inner| {
            inner.check_remote("SETVEL", f64::from(rpm).abs() <= max_rpm)?;
            inner.apply_setpoint(DriveMode::Velocity(f64::from(rpm)));
            Ok(())
        })
        .await
    }

    async fn set_torque(&self, mnm: i32) -> DeviceResult<()> {
        self.command(SimCommand::Torque(mnm), |inner| {
            let ma = f64::from(mnm) / TORQUE_CONSTANT_MNM_PER_MA;
            inner.check_remote("SETTORQ", ma.abs() <= f64::from(inner.remote.current_max))?;
            let anchor = match inner.setpoint {
                DriveMode::Current { anchor, .. } => anchor,
                _ => inner.physics.motor,
            };
            inner.apply_setpoint(DriveMode::Current { ma, anchor });
            Ok(())
        })
        .await
    }

    async fn set_current(&self, ma: i32) -> DeviceResult<()> {
        self.command(SimCommand::Current(ma), |inner| {
            inner.check_remote("SETCURR", ma.unsigned_abs() <= inner.remote.current_max)?;
            let anchor = match inner.setpoint {
                DriveMode::Current { anchor, .. } => anchor,
                _ => inner.physics.motor,
            };
            inner.apply_setpoint(DriveMode::Current {
                ma: f64::from(ma),
                anchor,
            });
            Ok(())
        })
        .await
    }

    async fn get_sensors(&self) -> DeviceResult<SensorSample> {
        self.ensure_connected()?;
        self.latency().await;
        let mut inner = self.inner.lock().await;

        if inner.failures_pending > 0 {
            inner.failures_pending -= 1;
            return Err(DeviceError::timeout("get_sensors", DEFAULT_READ_TIMEOUT));
        }
        if inner.rng.should_fail(self.config.read_failure_rate) {
            return Err(DeviceError::timeout("get_sensors", DEFAULT_READ_TIMEOUT));
        }

        inner.advance(&self.config, Instant::now());
        let SimInner {
            physics, rng, zero, ..
        } = &mut *inner;
        Ok(physics.read(&self.config, rng, zero))
    }

    async fn set_pid_params(&self, gains: PidGains) -> DeviceResult<()> {
        self.command(SimCommand::Pid(gains), |inner| {
            inner.pid = gains;
            Ok(())
        })
        .await
    }

    async fn get_pid_params(&self) -> DeviceResult<PidGains> {
        self.ensure_connected()?;
        Ok(self.inner.lock().await.pid)
    }

    async fn set_motion_profile(&self, profile: MotionProfile) -> DeviceResult<()> {
        self.command(SimCommand::Profile(profile), |inner| {
            inner.profile = profile;
            Ok(())
        })
        .await
    }

    async fn get_motion_profile(&self) -> DeviceResult<MotionProfile> {
        self.ensure_connected()?;
        Ok(self.inner.lock().await.profile)
    }

    async fn set_limit(&self, limit: LimitType, value: i32) -> DeviceResult<()> {
        self.command(SimCommand::Limit(limit, value), |inner| {
            match limit {
                LimitType::Current => {
                    inner.remote.current_max = u32::try_from(value)
                        .map_err(|_| DeviceError::rejected("SETLIMIT", "negative current"))?;
                }
                LimitType::PositionMin => inner.remote.position_min = value,
                LimitType::PositionMax => inner.remote.position_max = value,
                LimitType::Force => inner.remote.force_tendon_max = value,
            }
            debug!(limit = limit.wire_name(), value, "Simulator limit set");
            Ok(())
        })
        .await
    }

    async fn zero_sensors(&self) -> DeviceResult<()> {
        let config = &self.config;
        self.command(SimCommand::Zero, |inner| {
            let tendon = inner.physics.effective_tendon_mn();
            inner.zero = ForceZero {
                tendon_mn: tendon,
                tip_mn: tendon * TIP_FORCE_RATIO + inner.physics.external_load_mn(config),
            };
            Ok(())
        })
        .await
    }
}
