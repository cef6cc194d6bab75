//! Test protocol engine for the tendon actuator rig.
//!
//! - [`params`]: parameter schemas and configuration validation
//! - [`protocols`]: the test catalogue and its five algorithms
//! - [`TestEngine`]: run lifecycle with pause, resume and stop
//! - [`CheckpointStore`]: resume points for long-running tests
//!
//! # Usage
//!
//! ```rust,ignore
//! let engine = TestEngine::new(handle, limits)
//!     .with_safety(monitor)
//!     .with_checkpoints(CheckpointStore::new("checkpoints"));
//!
//! let config = TestConfig::new().with("num_cycles", 500_i64);
//! let state = engine
//!     .run_test(TestKind::Endurance, &config, &|u: &ProgressUpdate| {
//!         println!("{:>5.1}% {}", u.fraction * 100.0, u.message)
//!     })
//!     .await?;
//! assert_eq!(state.status, RunStatus::Completed);
//! ```

pub mod analysis;
pub mod checkpoint;
mod context;
pub mod engine;
pub mod params;
pub mod protocols;
pub mod state;

pub use checkpoint::{CheckpointError, CheckpointStore, RunCheckpoint};
pub use engine::{EngineError, TestEngine};
pub use params::{ConfigValidationError, ParamKind, ParamSpec, ParamValue, TestConfig};
pub use protocols::{catalogue, format_duration, TestKind, TestPlan, TestResult};
pub use state::{
    NoProgress, ProgressSink, ProgressUpdate, RunFailure, RunStatus, RunWarning, TestRunState,
    WarningKind,
};
