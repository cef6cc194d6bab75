//! Transports, streaming and safety for the tendon actuator rig.
//!
//! - [`backends`]: `Device` implementations for the line, JSON-line and
//!   register-bus controllers (the simulator lives in `tendon-driver-sim`)
//! - [`codec`]: pure frame encoders/decoders used by the backends
//! - [`factory`]: `create_backend` from [`tendon_core::ConnectionParams`]
//! - [`DeviceHandle`]: the owned handle every other component talks to
//! - [`StreamingEngine`]: background acquisition with drop-oldest sinks
//!   and lossless matchers
//! - [`SafetyMonitor`]: independent limit checker with emergency-stop authority
//! - [`CalibrationStore`]: per-channel calibration files

pub mod backends;
pub mod calibration_store;
pub mod codec;
pub mod factory;
pub mod handle;
pub mod safety;
mod sink;
pub mod streaming;

pub use calibration_store::CalibrationStore;
pub use factory::{create_backend, create_backend_with, create_from_config, BackendOptions};
pub use handle::DeviceHandle;
pub use safety::{SafetyConfig, SafetyEvent, SafetyLevel, SafetyMonitor, SafetyStatus};
pub use sink::{SamplePredicate, SampleReceiver, MAX_SINK_CAPACITY};
pub use streaming::{StreamSettings, StreamStats, StreamStatus, StreamingEngine};
