//! Rigid-body-free physics of the motor, tendon and finger.
//!
//! The model is deliberately simple and fully deterministic: a P-controlled
//! motor shaft, a deadband between motor and joint encoder (backlash), a
//! first-order lag from current to tendon force, optional viscoelastic
//! relaxation (creep) and an optional external load pressing on the tip.

use crate::config::SimConfig;
use crate::rng::SimRng;
use tendon_core::mechanics::{
    tendon_force_for_torque_n, MOTOR_COUNTS_PER_REV, TIP_FORCE_RATIO, TORQUE_CONSTANT_MNM_PER_MA,
};
use tendon_core::SensorSample;

/// Integration step in seconds.
pub const STEP_S: f64 = 0.001;

/// Idle current drawn to overcome friction, in mA.
pub const FRICTION_CURRENT_MA: f64 = 20.0;

/// Additional current per RPM while moving, in mA.
pub const CURRENT_PER_RPM: f64 = 0.2;

/// Joint angle per encoder count, in centidegrees (full travel spans 90°).
pub const CENTIDEGREES_PER_COUNT: f64 = 0.9;

/// What the motor driver is trying to do.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DriveMode {
    /// Driver off; shaft coasts to a stop and current drops to zero.
    Disabled,
    /// Track a position in counts.
    Position(f64),
    /// Run at a fixed speed in RPM.
    Velocity(f64),
    /// Regulate current in mA; the finger settles against its spring.
    Current {
        /// Commanded current in mA (sign selects direction).
        ma: f64,
        /// Motor position when current control began.
        anchor: f64,
    },
}

/// Complete physical state, advanced in fixed steps.
#[derive(Debug, Clone, PartialEq)]
pub struct PhysicsState {
    /// Seconds since the simulator started.
    pub time: f64,
    /// Motor-side position in counts.
    pub motor: f64,
    /// Joint-side position in counts, after backlash.
    pub output: f64,
    /// Motor speed in counts per second.
    pub velocity_cps: f64,
    /// Motor current in mA.
    pub current_ma: f64,
    /// Tendon force in mN before creep is applied.
    pub tendon_mn: f64,
    /// Fraction of tendon force lost to relaxation.
    pub relaxation: f64,
    /// Active drive mode.
    pub mode: DriveMode,
}

impl Default for PhysicsState {
    fn default() -> Self {
        Self {
            time: 0.0,
            motor: 0.0,
            output: 0.0,
            velocity_cps: 0.0,
            current_ma: 0.0,
            tendon_mn: 0.0,
            relaxation: 0.0,
            mode: DriveMode::Disabled,
        }
    }
}

impl PhysicsState {
    /// Switch drive mode. Relaxation restarts whenever the load changes.
    pub fn set_mode(&mut self, mode: DriveMode) {
        if mode != self.mode {
            self.relaxation = 0.0;
        }
        self.mode = mode;
    }

    /// Advance one integration step of `dt` seconds.
    pub fn step(&mut self, config: &SimConfig, dt: f64) {
        let vmax = config.max_velocity_rpm * MOTOR_COUNTS_PER_REV / 60.0;
        let track = |target: f64, motor: f64| {
            (config.position_gain * (target - motor)).clamp(-vmax, vmax)
        };

        self.velocity_cps = match self.mode {
            DriveMode::Disabled => 0.0,
            DriveMode::Position(target) => track(target, self.motor),
            DriveMode::Velocity(rpm) => (rpm * MOTOR_COUNTS_PER_REV / 60.0).clamp(-vmax, vmax),
            DriveMode::Current { ma, anchor } => {
                let travel = (ma.abs() - FRICTION_CURRENT_MA).max(0.0) * config.spring_counts_per_ma;
                track(anchor + travel.copysign(ma), self.motor)
            }
        };
        self.motor += self.velocity_cps * dt;

        self.current_ma = match self.mode {
            DriveMode::Disabled => 0.0,
            DriveMode::Current { ma, .. } => ma.abs(),
            DriveMode::Position(_) | DriveMode::Velocity(_) => {
                FRICTION_CURRENT_MA + self.velocity_rpm().abs() * CURRENT_PER_RPM
            }
        };

        let half = config.backlash_counts / 2.0;
        self.output = self.output.clamp(self.motor - half, self.motor + half);

        if matches!(self.mode, DriveMode::Current { .. }) && config.creep_rate > 0.0 {
            self.relaxation = (self.relaxation + config.creep_rate * dt).min(config.creep_max);
        }

        let target_mn =
            tendon_force_for_torque_n(self.current_ma * TORQUE_CONSTANT_MNM_PER_MA) * 1_000.0;
        let alpha = 1.0 - (-dt / config.force_tau_s).exp();
        self.tendon_mn += (target_mn - self.tendon_mn) * alpha;

        self.time += dt;
    }

    /// Motor speed in RPM.
    pub fn velocity_rpm(&self) -> f64 {
        self.velocity_cps * 60.0 / MOTOR_COUNTS_PER_REV
    }

    /// Tendon force after relaxation, in mN.
    pub fn effective_tendon_mn(&self) -> f64 {
        self.tendon_mn * (1.0 - self.relaxation)
    }

    /// External tip load at the current time, in mN.
    pub fn external_load_mn(&self, config: &SimConfig) -> f64 {
        config
            .external_load
            .map(|load| load.at(self.time))
            .unwrap_or(0.0)
    }

    /// Produce a noisy sensor reading of the current state.
    pub fn read(&self, config: &SimConfig, rng: &mut SimRng, zero: &ForceZero) -> SensorSample {
        let external = self.external_load_mn(config);
        let deflection = if config.stiffness_mn_per_count > 0.0 {
            external / config.stiffness_mn_per_count
        } else {
            0.0
        };
        let position = self.output + deflection;
        let tendon = self.effective_tendon_mn();

        let noise = &config.noise;
        let current = (self.current_ma + rng.gaussian(noise.current_ma)).max(0.0);
        let force_tendon = tendon + rng.gaussian(noise.force_tendon_mn) - zero.tendon_mn;
        let force_tip =
            tendon * TIP_FORCE_RATIO + external + rng.gaussian(noise.force_tip_mn) - zero.tip_mn;

        SensorSample {
            timestamp: self.time,
            position: position.round() as i32,
            velocity: self.velocity_rpm().round() as i32,
            current: current.round() as u32,
            force_tendon: force_tendon.round() as i32,
            force_tip: force_tip.round() as i32,
            angle_joint: (position * CENTIDEGREES_PER_COUNT).round() as i32,
        }
    }
}

/// Force offsets captured by `zero_sensors`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ForceZero {
    /// Subtracted from the tendon channel, in mN.
    pub tendon_mn: f64,
    /// Subtracted from the tip channel, in mN.
    pub tip_mn: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExternalLoad, NoiseModel};

    fn quiet() -> SimConfig {
        SimConfig {
            noise: NoiseModel::none(),
            ..SimConfig::default()
        }
    }

    fn run(state: &mut PhysicsState, config: &SimConfig, seconds: f64) {
        for _ in 0..(seconds / STEP_S).round() as usize {
            state.step(config, STEP_S);
        }
    }

    #[test]
    fn position_mode_converges() {
        let config = quiet();
        let mut state = PhysicsState::default();
        state.set_mode(DriveMode::Position(4_000.0));
        run(&mut state, &config, 1.5);
        assert!((state.motor - 4_000.0).abs() < 1e-6);
        assert!((state.current_ma - FRICTION_CURRENT_MA).abs() < 1e-3);
    }

    #[test]
    fn backlash_depends_on_approach_direction() {
        let config = SimConfig {
            backlash_counts: 40.0,
            ..quiet()
        };
        let mut state = PhysicsState::default();

        state.set_mode(DriveMode::Position(1_000.0));
        run(&mut state, &config, 2.0);
        let from_below = state.output;

        state.set_mode(DriveMode::Position(2_000.0));
        run(&mut state, &config, 2.0);
        state.set_mode(DriveMode::Position(1_000.0));
        run(&mut state, &config, 2.0);
        let from_above = state.output;

        assert!((from_above - from_below - 40.0).abs() < 1e-3);
    }

    #[test]
    fn tendon_force_follows_current() {
        let config = quiet();
        let mut state = PhysicsState::default();
        state.set_mode(DriveMode::Current { ma: 500.0, anchor: 0.0 });
        run(&mut state, &config, 0.5);
        // 500 mA * 0.15 mNm/mA / 10 mm = 7.5 N
        assert!((state.tendon_mn - 7_500.0).abs() < 1e-3);

        let sample = state.read(&config, &mut SimRng::new(Some(1)), &ForceZero::default());
        assert_eq!(sample.force_tendon, 7_500);
        assert_eq!(sample.force_tip, 5_250);
        assert_eq!(sample.current, 500);
    }

    #[test]
    fn creep_relaxes_held_force() {
        let config = SimConfig {
            creep_rate: 0.01,
            ..quiet()
        };
        let mut state = PhysicsState::default();
        state.set_mode(DriveMode::Current { ma: 500.0, anchor: 0.0 });
        run(&mut state, &config, 10.0);
        assert!((state.relaxation - 0.1).abs() < 1e-6);
        assert!(state.effective_tendon_mn() < 7_000.0);
    }

    #[test]
    fn external_load_deflects_joint() {
        let config = SimConfig {
            external_load: Some(ExternalLoad {
                peak_mn: 2_000.0,
                period_s: 4.0,
            }),
            stiffness_mn_per_count: 2.0,
            ..quiet()
        };
        let mut state = PhysicsState::default();
        state.set_mode(DriveMode::Position(5_000.0));
        run(&mut state, &config, 4.0); // half way through the second period: peak
        let sample = state.read(&config, &mut SimRng::new(Some(1)), &ForceZero::default());
        assert_eq!(sample.position, 5_000);

        run(&mut state, &config, 2.0);
        let peak = state.read(&config, &mut SimRng::new(Some(1)), &ForceZero::default());
        assert_eq!(peak.position, 6_000);
    }

    #[test]
    fn disabled_drive_drops_current() {
        let config = quiet();
        let mut state = PhysicsState::default();
        state.set_mode(DriveMode::Velocity(60.0));
        run(&mut state, &config, 1.0);
        assert!((state.motor - 1_000.0).abs() < 1e-6);
        state.set_mode(DriveMode::Disabled);
        run(&mut state, &config, 0.1);
        assert_eq!(state.current_ma, 0.0);
        assert_eq!(state.velocity_cps, 0.0);
    }
}
