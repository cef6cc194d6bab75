//! Simulator configuration and fault injection knobs.

use serde::{Deserialize, Serialize};

/// Gaussian noise on each sensor channel (standard deviations).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseModel {
    /// Current noise in mA.
    pub current_ma: f64,
    /// Tendon load cell noise in mN.
    pub force_tendon_mn: f64,
    /// Tip load cell noise in mN.
    pub force_tip_mn: f64,
}

impl NoiseModel {
    /// Noise-free sensors.
    pub fn none() -> Self {
        Self {
            current_ma: 0.0,
            force_tendon_mn: 0.0,
            force_tip_mn: 0.0,
        }
    }
}

impl Default for NoiseModel {
    fn default() -> Self {
        Self {
            current_ma: 2.0,
            force_tendon_mn: 50.0,
            force_tip_mn: 30.0,
        }
    }
}

/// Triangle-wave external force pressing on the fingertip.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExternalLoad {
    /// Peak force in mN.
    pub peak_mn: f64,
    /// Period of one rise and fall, in seconds.
    pub period_s: f64,
}

impl ExternalLoad {
    /// Load at simulator time `t`.
    pub fn at(&self, t: f64) -> f64 {
        if self.period_s <= 0.0 {
            return 0.0;
        }
        let phase = (t / self.period_s).fract();
        self.peak_mn * (1.0 - (2.0 * phase - 1.0).abs())
    }
}

fn default_gain() -> f64 {
    20.0
}

/// Simulator parameters.
///
/// Deserializes from TOML with every field optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Noise seed. `None` seeds from the OS.
    pub seed: Option<u64>,
    /// Position loop gain in 1/s.
    pub position_gain: f64,
    /// Shaft speed ceiling in RPM.
    pub max_velocity_rpm: f64,
    /// Deadband between motor and joint, in counts.
    pub backlash_counts: f64,
    /// Fraction of held tendon force lost per second under current control.
    pub creep_rate: f64,
    /// Ceiling on accumulated relaxation.
    pub creep_max: f64,
    /// Time constant of the current-to-force response.
    pub force_tau_s: f64,
    /// Finger travel per mA above friction current, in counts.
    pub spring_counts_per_ma: f64,
    /// Tip stiffness seen by an external load, in mN per count.
    pub stiffness_mn_per_count: f64,
    /// Optional external load profile.
    pub external_load: Option<ExternalLoad>,
    /// Sensor noise.
    pub noise: NoiseModel,
    /// Probability that any single read fails.
    pub read_failure_rate: f64,
    /// Artificial delay added to every command and read, in milliseconds.
    pub latency_ms: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: None,
            position_gain: default_gain(),
            max_velocity_rpm: 3_000.0,
            backlash_counts: 0.0,
            creep_rate: 0.0,
            creep_max: 0.5,
            force_tau_s: 0.02,
            spring_counts_per_ma: 2.0,
            stiffness_mn_per_count: 2.0,
            external_load: None,
            noise: NoiseModel::default(),
            read_failure_rate: 0.0,
            latency_ms: 0,
        }
    }
}

impl SimConfig {
    /// Default configuration with a fixed seed.
    pub fn seeded(seed: u64) -> Self {
        Self {
            seed: Some(seed),
            ..Self::default()
        }
    }

    /// Fixed seed and noise-free sensors.
    pub fn deterministic(seed: u64) -> Self {
        Self {
            seed: Some(seed),
            noise: NoiseModel::none(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triangle_load_shape() {
        let load = ExternalLoad {
            peak_mn: 1_000.0,
            period_s: 2.0,
        };
        assert_eq!(load.at(0.0), 0.0);
        assert!((load.at(0.5) - 500.0).abs() < 1e-9);
        assert!((load.at(1.0) - 1_000.0).abs() < 1e-9);
        assert!((load.at(1.5) - 500.0).abs() < 1e-9);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: SimConfig = toml::from_str(
            r#"
seed = 9
backlash_counts = 30.0

[noise]
force_tip_mn = 10.0
"#,
        )
        .unwrap();
        assert_eq!(config.seed, Some(9));
        assert_eq!(config.backlash_counts, 30.0);
        assert_eq!(config.noise.force_tip_mn, 10.0);
        assert_eq!(config.noise.force_tendon_mn, 50.0);
        assert_eq!(config.position_gain, 20.0);
    }
}
