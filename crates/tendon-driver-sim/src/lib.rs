//! Simulated tendon-driven actuator.
//!
//! [`SimulatedRig`] implements [`tendon_core::Device`] on top of a small
//! physics model: a position-controlled motor with velocity saturation, a
//! backlash deadband between motor and joint, first-order tendon force lag,
//! optional creep under constant current and an optional periodic external
//! tip load. Noise comes from a seeded ChaCha8 stream so runs are repeatable.
//!
//! The model advances with `tokio::time`, so tests using paused time get
//! bit-identical trajectories.
//!
//! ```rust,ignore
//! use tendon_driver_sim::{SimConfig, SimulatedRig};
//! use tendon_core::Device;
//!
//! let rig = SimulatedRig::new(SimConfig::seeded(42));
//! rig.connect().await?;
//! rig.enable().await?;
//! rig.set_position(2_000).await?;
//! ```

pub mod config;
pub mod physics;
pub mod rng;
mod simulator;

pub use config::{ExternalLoad, NoiseModel, SimConfig};
pub use physics::{DriveMode, PhysicsState};
pub use rng::SimRng;
pub use simulator::{SimCommand, SimulatedRig};
