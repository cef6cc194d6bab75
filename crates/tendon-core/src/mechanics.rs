//! Mechanical model of the motor, spool and finger linkage.
//!
//! Relationships used to convert between commanded quantities and forces:
//!
//! ```text
//! torque  [mNm] = current [mA] * TORQUE_CONSTANT
//! tendon  [N]   = torque [mNm] / SPOOL_RADIUS [mm]
//! tip     [N]   = tendon [N] * TIP_FORCE_RATIO
//! ```

use std::f64::consts::PI;

/// Standard gravity in m/s².
pub const GRAVITY: f64 = 9.81;

/// Tendon spool radius in millimetres.
pub const SPOOL_RADIUS_MM: f64 = 10.0;

/// Output torque per milliamp of motor current, in mNm/mA (gearbox included).
pub const TORQUE_CONSTANT_MNM_PER_MA: f64 = 0.15;

/// Mechanical advantage from tendon force to fingertip force.
pub const TIP_FORCE_RATIO: f64 = 0.7;

/// Motor encoder resolution in counts per revolution.
pub const MOTOR_COUNTS_PER_REV: f64 = 1_000.0;

/// Nominal motor supply voltage.
pub const SUPPLY_VOLTAGE_V: f64 = 24.0;

/// Current needed to produce `torque_mnm` at the spool.
pub fn current_for_torque_ma(torque_mnm: f64) -> f64 {
    torque_mnm / TORQUE_CONSTANT_MNM_PER_MA
}

/// Spool torque needed for a fingertip force.
pub fn torque_for_tip_force_mnm(tip_force_n: f64) -> f64 {
    tip_force_n / TIP_FORCE_RATIO * SPOOL_RADIUS_MM
}

/// Current needed for a fingertip force.
pub fn current_for_tip_force_ma(tip_force_n: f64) -> f64 {
    current_for_torque_ma(torque_for_tip_force_mnm(tip_force_n))
}

/// Tendon force produced by a spool torque.
pub fn tendon_force_for_torque_n(torque_mnm: f64) -> f64 {
    torque_mnm / SPOOL_RADIUS_MM
}

/// Fingertip force gained per milliamp, in mN/mA.
pub fn tip_force_per_ma_mn() -> f64 {
    TORQUE_CONSTANT_MNM_PER_MA / SPOOL_RADIUS_MM * 1_000.0 * TIP_FORCE_RATIO
}

/// Fingertip linear velocity for a motor speed, in m/s.
///
/// The tendon moves at `ω·r`; an ideal lever trades force for speed, so the
/// tip moves at the tendon speed divided by the force ratio.
pub fn tip_velocity_m_s(velocity_rpm: f64) -> f64 {
    let omega = velocity_rpm * 2.0 * PI / 60.0;
    omega * SPOOL_RADIUS_MM / 1_000.0 / TIP_FORCE_RATIO
}

/// Mass equivalent of a force.
pub fn newtons_to_kg(force_n: f64) -> f64 {
    force_n / GRAVITY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tip_force_round_trip() {
        let current = current_for_tip_force_ma(5.0);
        let tip_mn = current * tip_force_per_ma_mn();
        assert!((tip_mn - 5_000.0).abs() < 1e-6);
    }

    #[test]
    fn torque_to_tendon_force() {
        assert!((tendon_force_for_torque_n(100.0) - 10.0).abs() < 1e-12);
        assert!((current_for_torque_ma(150.0) - 1_000.0).abs() < 1e-9);
    }

    #[test]
    fn tip_velocity_scales_with_rpm() {
        assert_eq!(tip_velocity_m_s(0.0), 0.0);
        let v = tip_velocity_m_s(60.0);
        assert!((v - 2.0 * PI * 0.01 / 0.7).abs() < 1e-12);
    }
}
