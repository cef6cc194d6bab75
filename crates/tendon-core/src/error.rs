//! Error taxonomy for device and transport failures.
//!
//! Every capability call returns [`DeviceResult`]. Transport-level problems
//! (I/O failures, malformed frames, timeouts) are converted into
//! [`DeviceError`] variants at the backend boundary so callers can react
//! deterministically instead of unwinding.
//!
//! ## Categories
//!
//! - **`Connection`**: transport unreachable or handshake failed. Recoverable by
//!   an explicit retry from the caller; nothing retries silently.
//! - **`Decode`**: malformed wire data. The sample is dropped and counted.
//! - **`CommandRejected`**: value out of range or a remote NACK. No retry.
//! - **`Timeout`**: the bounded per-call timeout elapsed.
//! - **`SafetyViolation`**: a limit was exceeded. Fatal to the current test run.
//! - **`StreamingFailure`**: repeated acquisition failure. Streaming stopped itself.

use crate::limits::Violation;
use crate::sample::SensorSample;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for capability call results.
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Flat classification of a [`DeviceError`], convenient for matching and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transport unreachable or handshake failed.
    Connection,
    /// Malformed wire data.
    Decode,
    /// Rejected locally or by the remote device.
    CommandRejected,
    /// Bounded timeout elapsed.
    Timeout,
    /// A safety limit was exceeded.
    SafetyViolation,
    /// Streaming stopped after repeated failures.
    StreamingFailure,
    /// Operation attempted on a disconnected backend.
    NotConnected,
    /// Capability not offered by this backend.
    Unsupported,
    /// Underlying I/O failure.
    Io,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Decode => "decode",
            ErrorKind::CommandRejected => "command_rejected",
            ErrorKind::Timeout => "timeout",
            ErrorKind::SafetyViolation => "safety_violation",
            ErrorKind::StreamingFailure => "streaming_failure",
            ErrorKind::NotConnected => "not_connected",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Io => "io",
        };
        write!(f, "{}", label)
    }
}

/// Typed failure of a device, transport or streaming operation.
#[derive(Error, Debug, Clone)]
pub enum DeviceError {
    /// Transport unreachable or the liveness handshake failed.
    #[error("Connection to {backend} failed: {message}")]
    Connection {
        /// Backend name, e.g. `line-serial`.
        backend: String,
        /// Human-readable cause.
        message: String,
    },

    /// Wire data could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// The command was refused, locally or by the device.
    #[error("Command '{command}' rejected: {reason}")]
    CommandRejected {
        /// Command verb.
        command: String,
        /// Why it was refused.
        reason: String,
    },

    /// No response within the bounded timeout.
    #[error("'{operation}' timed out after {after:?}")]
    Timeout {
        /// Operation that timed out.
        operation: String,
        /// The timeout that elapsed.
        after: Duration,
    },

    /// A safety limit was exceeded and actuation was halted.
    #[error("Safety violation: {0}")]
    SafetyViolation(Box<Violation>),

    /// Streaming stopped after too many consecutive acquisition failures.
    #[error("Streaming failed after {consecutive_failures} consecutive errors: {last_error}")]
    StreamingFailure {
        /// Number of consecutive failures that triggered the stop.
        consecutive_failures: u32,
        /// Message of the final failure.
        last_error: String,
    },

    /// Operation requires a connected backend.
    #[error("Device is not connected")]
    NotConnected,

    /// The backend does not offer this capability.
    #[error("'{0}' is not supported by this backend")]
    Unsupported(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(String),
}

impl DeviceError {
    /// Shorthand for a [`DeviceError::CommandRejected`].
    pub fn rejected(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CommandRejected {
            command: command.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`DeviceError::Connection`].
    pub fn connection(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a [`DeviceError::Timeout`].
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Flat classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeviceError::Connection { .. } => ErrorKind::Connection,
            DeviceError::Decode(_) => ErrorKind::Decode,
            DeviceError::CommandRejected { .. } => ErrorKind::CommandRejected,
            DeviceError::Timeout { .. } => ErrorKind::Timeout,
            DeviceError::SafetyViolation(_) => ErrorKind::SafetyViolation,
            DeviceError::StreamingFailure { .. } => ErrorKind::StreamingFailure,
            DeviceError::NotConnected => ErrorKind::NotConnected,
            DeviceError::Unsupported(_) => ErrorKind::Unsupported,
            DeviceError::Io(_) => ErrorKind::Io,
        }
    }

    /// True for errors that end a test run as failed.
    pub fn is_run_ending(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::SafetyViolation | ErrorKind::StreamingFailure
        )
    }
}

impl From<std::io::Error> for DeviceError {
    fn from(err: std::io::Error) -> Self {
        DeviceError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for DeviceError {
    fn from(err: serde_json::Error) -> Self {
        DeviceError::Decode(err.to_string())
    }
}

/// A failure paired with the last known good sample, for diagnosis.
#[derive(Error, Debug, Clone)]
#[error("{error}")]
pub struct FailureReport {
    /// What went wrong.
    pub error: DeviceError,
    /// Most recent successful sample before the failure, if any.
    pub last_sample: Option<SensorSample>,
}

impl FailureReport {
    /// Pair an error with the last sample seen.
    pub fn new(error: DeviceError, last_sample: Option<SensorSample>) -> Self {
        Self { error, last_sample }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ending_classification() {
        let streaming = DeviceError::StreamingFailure {
            consecutive_failures: 3,
            last_error: "timeout".into(),
        };
        assert!(streaming.is_run_ending());
        assert!(!DeviceError::rejected("SETPOS", "LIMIT").is_run_ending());
        assert!(!DeviceError::NotConnected.is_run_ending());
    }

    #[test]
    fn io_errors_convert() {
        let err: DeviceError =
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed").into();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.to_string().contains("pipe closed"));
    }

    #[test]
    fn display_includes_context() {
        let err = DeviceError::timeout("GETSENSORS", Duration::from_millis(500));
        assert_eq!(err.to_string(), "'GETSENSORS' timed out after 500ms");
    }
}
