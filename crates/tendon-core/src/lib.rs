//! `tendon-core`
//!
//! Core types and the capability contract for the tendon actuator test rig.
//!
//! Everything that talks to an actuator, whether a serial line controller, a
//! networked controller, a register-bus board or the physics simulator,
//! implements [`Device`]. The streaming engine, the safety monitor and the test
//! protocol engine depend on that trait only.
//!
//! ## Key Types
//!
//! - [`SensorSample`]: one temporally consistent reading of every sensor
//! - [`DeviceLimits`]: safety envelope enforced by the safety monitor
//! - [`CommandBounds`]: local fast-fail ranges checked before wire I/O
//! - [`CalibrationRecord`]: per-channel scale/offset pair
//! - [`PlatformInfo`]: static backend descriptor
//! - [`DeviceError`]: typed failure taxonomy returned by every capability call
//! - [`CommandGate`]: single-writer transport guard with emergency-stop priority

pub mod calibration;
pub mod capabilities;
pub mod config;
pub mod error;
pub mod gate;
pub mod limits;
pub mod mechanics;
pub mod sample;
#[cfg(feature = "serial")]
pub mod serial;

pub use calibration::{CalibrationError, CalibrationRecord, CalibrationSet, SensorChannel};
pub use capabilities::{
    Capability, Device, LimitType, MotionProfile, PidGains, PlatformInfo, SampleFeed,
    TransportKind,
};
pub use config::{BackendKind, ConfigError, ConnectionParams, RigConfig};
pub use error::{DeviceError, DeviceResult, ErrorKind, FailureReport};
pub use gate::CommandGate;
pub use limits::{CommandBounds, DeviceLimits, LimitChannel, Violation};
pub use sample::{SensorSample, TaggedSample};
