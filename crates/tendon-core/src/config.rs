//! Rig configuration.
//!
//! Configuration is layered with `figment`:
//! 1. Library defaults ([`RigConfig::default`])
//! 2. An optional TOML file
//! 3. `TENDON_`-prefixed environment variables, `__` separating nested keys
//!    (e.g. `TENDON_LIMITS__CURRENT_MAX=800`)
//!
//! ```toml
//! calibration_dir = "calibration"
//!
//! [backend]
//! kind = "teensy"            # alias of "line"
//! path = "/dev/ttyACM0"
//! baud = 115200
//!
//! [limits]
//! current_max = 800
//! ```

use crate::limits::{
    CommandBounds, DeviceLimits, DEFAULT_CLEAR_FRACTION, DEFAULT_SAFETY_RATE_HZ,
    DEFAULT_STREAM_FAILURE_THRESHOLD,
};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::{Figment, Provider};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Configuration loading and validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Explicitly requested file does not exist.
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    /// A layer could not be parsed or extracted.
    #[error("failed to extract configuration: {0}")]
    Extract(#[from] Box<figment::Error>),

    /// Values parsed but are semantically invalid.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// =============================================================================
// Backend Selection
// =============================================================================

/// Backend family, accepting the historical platform names as aliases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Line protocol over serial.
    Line,
    /// JSON-line protocol over TCP.
    JsonLine,
    /// Binary register protocol over a framed bus.
    RegisterBus,
    /// Physics simulator.
    Simulated,
}

impl std::str::FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "line" | "teensy" | "serial" => Ok(BackendKind::Line),
            "json_line" | "json-line" | "imx8" | "tcp" => Ok(BackendKind::JsonLine),
            "register_bus" | "register-bus" | "rpi" | "raspberry_pi" | "i2c" => {
                Ok(BackendKind::RegisterBus)
            }
            "simulated" | "mock" | "simulator" => Ok(BackendKind::Simulated),
            other => Err(ConfigError::Invalid(format!("unknown backend '{other}'"))),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            BackendKind::Line => "line",
            BackendKind::JsonLine => "json_line",
            BackendKind::RegisterBus => "register_bus",
            BackendKind::Simulated => "simulated",
        };
        f.write_str(label)
    }
}

fn default_baud() -> u32 {
    115_200
}

fn default_host() -> String {
    "192.168.1.100".to_string()
}

fn default_port() -> u16 {
    5_000
}

fn default_bus_address() -> u8 {
    0x60
}

/// Backend-specific connection parameters, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectionParams {
    /// Line protocol: serial device path and baud rate.
    #[serde(alias = "teensy", alias = "serial")]
    Line {
        /// Serial device path.
        path: String,
        /// Baud rate.
        #[serde(default = "default_baud")]
        baud: u32,
        /// Per-transaction timeout override in milliseconds.
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    /// JSON-line protocol: controller host and command port.
    #[serde(alias = "imx8", alias = "tcp")]
    JsonLine {
        /// Controller host name or address.
        #[serde(default = "default_host")]
        host: String,
        /// Command port; the stream socket is `port + 1`.
        #[serde(default = "default_port")]
        port: u16,
        /// Per-transaction timeout override in milliseconds.
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    /// Register protocol: bus adapter path and device address.
    #[serde(alias = "rpi", alias = "raspberry_pi", alias = "i2c")]
    RegisterBus {
        /// Bus adapter device path.
        bus: String,
        /// Device address on the bus.
        #[serde(default = "default_bus_address")]
        address: u8,
        /// Per-transaction timeout override in milliseconds.
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    /// Physics simulator.
    #[serde(alias = "mock", alias = "simulator")]
    Simulated {
        /// Noise seed for reproducible runs.
        #[serde(default)]
        seed: Option<u64>,
    },
}

impl Default for ConnectionParams {
    fn default() -> Self {
        ConnectionParams::Simulated { seed: None }
    }
}

impl ConnectionParams {
    /// Backend family these parameters belong to.
    pub fn kind(&self) -> BackendKind {
        match self {
            ConnectionParams::Line { .. } => BackendKind::Line,
            ConnectionParams::JsonLine { .. } => BackendKind::JsonLine,
            ConnectionParams::RegisterBus { .. } => BackendKind::RegisterBus,
            ConnectionParams::Simulated { .. } => BackendKind::Simulated,
        }
    }

    /// Timeout override, if configured.
    pub fn timeout(&self) -> Option<Duration> {
        match self {
            ConnectionParams::Line { timeout_ms, .. }
            | ConnectionParams::JsonLine { timeout_ms, .. }
            | ConnectionParams::RegisterBus { timeout_ms, .. } => {
                timeout_ms.map(Duration::from_millis)
            }
            ConnectionParams::Simulated { .. } => None,
        }
    }
}

// =============================================================================
// Sections
// =============================================================================

/// Streaming engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingSettings {
    /// Acquisition rate in Hz.
    pub rate_hz: f64,
    /// Per-sink queue capacity before the oldest sample is dropped.
    pub queue_capacity: usize,
    /// Consecutive failures after which streaming stops itself.
    pub failure_threshold: u32,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            rate_hz: 100.0,
            queue_capacity: 256,
            failure_threshold: DEFAULT_STREAM_FAILURE_THRESHOLD,
        }
    }
}

/// Safety monitor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetySettings {
    /// Minimum evaluation rate in Hz.
    pub check_rate_hz: f64,
    /// Fraction of a limit a channel must drop below to clear a violation.
    pub clear_fraction: f64,
}

impl Default for SafetySettings {
    fn default() -> Self {
        Self {
            check_rate_hz: DEFAULT_SAFETY_RATE_HZ,
            clear_fraction: DEFAULT_CLEAR_FRACTION,
        }
    }
}

/// Complete rig configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    /// Backend selection and connection parameters.
    pub backend: ConnectionParams,
    /// Safety envelope.
    pub limits: DeviceLimits,
    /// Local fast-fail command ranges.
    pub bounds: CommandBounds,
    /// Streaming engine settings.
    pub streaming: StreamingSettings,
    /// Safety monitor settings.
    pub safety: SafetySettings,
    /// Directory holding one JSON file per calibrated channel.
    pub calibration_dir: PathBuf,
    /// Directory for long-running test checkpoints.
    pub checkpoint_dir: PathBuf,
}

impl Default for RigConfig {
    fn default() -> Self {
        let limits = DeviceLimits::default();
        Self {
            backend: ConnectionParams::default(),
            limits,
            bounds: CommandBounds::from_limits(&limits),
            streaming: StreamingSettings::default(),
            safety: SafetySettings::default(),
            calibration_dir: PathBuf::from("calibration"),
            checkpoint_dir: PathBuf::from("checkpoints"),
        }
    }
}

impl Provider for RigConfig {
    fn metadata(&self) -> figment::Metadata {
        figment::Metadata::named("Rig Defaults")
    }

    fn data(
        &self,
    ) -> Result<figment::value::Map<figment::Profile, figment::value::Dict>, figment::Error> {
        Serialized::defaults(self).data()
    }
}

impl RigConfig {
    /// Load defaults, then `path` (if given), then the environment.
    ///
    /// An explicitly named file that does not exist is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(RigConfig::default());

        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::NotFound(path.to_path_buf()));
            }
            info!(path = %path.display(), "Loading rig configuration");
            figment = figment.merge(Toml::file(path));
        }

        let config = Self::extract(figment.merge(Env::prefixed("TENDON_").split("__")))?;
        debug!(backend = %config.backend.kind(), "Configuration resolved");
        Ok(config)
    }

    /// Extract and validate from an arbitrary figment.
    pub fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: RigConfig = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// Semantic validation beyond what deserialization checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.position_min >= self.limits.position_max {
            return Err(ConfigError::Invalid(format!(
                "position_min {} must be below position_max {}",
                self.limits.position_min, self.limits.position_max
            )));
        }
        if !(self.streaming.rate_hz > 0.0) {
            return Err(ConfigError::Invalid("streaming.rate_hz must be positive".into()));
        }
        if self.streaming.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "streaming.queue_capacity must be at least 1".into(),
            ));
        }
        if self.streaming.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "streaming.failure_threshold must be at least 1".into(),
            ));
        }
        if self.safety.check_rate_hz < DEFAULT_SAFETY_RATE_HZ {
            return Err(ConfigError::Invalid(format!(
                "safety.check_rate_hz must be at least {DEFAULT_SAFETY_RATE_HZ} Hz"
            )));
        }
        if !(self.safety.clear_fraction > 0.0 && self.safety.clear_fraction < 1.0) {
            return Err(ConfigError::Invalid(
                "safety.clear_fraction must lie strictly between 0 and 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = RigConfig::default();
        config.validate().unwrap();
        assert_eq!(config.backend.kind(), BackendKind::Simulated);
    }

    #[test]
    fn loads_file_with_alias() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[backend]
kind = "teensy"
path = "/dev/ttyACM0"

[limits]
current_max = 800
"#
        )
        .unwrap();

        let config = RigConfig::extract(
            Figment::from(RigConfig::default()).merge(Toml::file(file.path())),
        )
        .unwrap();

        assert_eq!(
            config.backend,
            ConnectionParams::Line {
                path: "/dev/ttyACM0".into(),
                baud: 115_200,
                timeout_ms: None,
            }
        );
        assert_eq!(config.limits.current_max, 800);
        assert_eq!(config.limits.position_max, 10_000);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = RigConfig::load(Some(Path::new("/nonexistent/rig.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn rejects_inverted_position_limits() {
        let mut config = RigConfig::default();
        config.limits.position_min = 500;
        config.limits.position_max = 100;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn backend_kind_aliases() {
        assert_eq!("imx8".parse::<BackendKind>().unwrap(), BackendKind::JsonLine);
        assert_eq!("Raspberry_Pi".parse::<BackendKind>().unwrap(), BackendKind::RegisterBus);
        assert_eq!("mock".parse::<BackendKind>().unwrap(), BackendKind::Simulated);
        assert!("usb".parse::<BackendKind>().is_err());
    }
}
