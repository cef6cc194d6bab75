//! Backend construction from connection parameters.

use crate::handle::DeviceHandle;
use crate::streaming::StreamSettings;
use std::sync::Arc;
use std::time::Duration;
use tendon_core::limits::DEFAULT_READ_TIMEOUT;
use tendon_core::{CommandBounds, ConnectionParams, Device, DeviceError, DeviceResult, RigConfig};
use tendon_driver_sim::{SimConfig, SimulatedRig};
use tracing::info;

/// JSON-line controllers answer over a network hop, so they get more slack.
pub const JSON_LINE_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything besides the connection parameters that shapes a handle.
#[derive(Debug, Clone, Default)]
pub struct BackendOptions {
    /// Local fast-fail command ranges.
    pub bounds: CommandBounds,
    /// Consecutive streaming failures tolerated.
    pub failure_threshold: Option<u32>,
    /// Full simulator configuration; overrides the seed in the parameters.
    pub simulator: Option<SimConfig>,
}

impl BackendOptions {
    /// Options derived from a loaded rig configuration.
    pub fn from_config(config: &RigConfig) -> Self {
        Self {
            bounds: config.bounds,
            failure_threshold: Some(config.streaming.failure_threshold),
            simulator: None,
        }
    }
}

// =============================================================================
// Configuration Validation
// =============================================================================

/// Reject parameters that cannot possibly connect, before touching hardware.
pub fn validate_params(params: &ConnectionParams) -> DeviceResult<()> {
    match params {
        ConnectionParams::Line { path, baud, .. } => {
            if path.trim().is_empty() {
                return Err(DeviceError::connection("line-serial", "serial path is empty"));
            }
            if *baud == 0 {
                return Err(DeviceError::connection("line-serial", "baud rate must be positive"));
            }
        }
        ConnectionParams::JsonLine { host, port, .. } => {
            if host.trim().is_empty() {
                return Err(DeviceError::connection("json-line", "host is empty"));
            }
            if *port == u16::MAX {
                return Err(DeviceError::connection(
                    "json-line",
                    "port 65535 leaves no room for the stream socket",
                ));
            }
        }
        ConnectionParams::RegisterBus { bus, address, .. } => {
            if bus.trim().is_empty() {
                return Err(DeviceError::connection("register-bus", "bus path is empty"));
            }
            if *address == 0 || *address > 0x7F {
                return Err(DeviceError::connection(
                    "register-bus",
                    format!("address {address:#04x} outside 0x01..=0x7f"),
                ));
            }
        }
        ConnectionParams::Simulated { .. } => {}
    }
    Ok(())
}

// =============================================================================
// Construction
// =============================================================================

/// Build an unconnected handle for `params` with default options.
pub fn create_backend(params: &ConnectionParams) -> DeviceResult<DeviceHandle> {
    create_backend_with(params, BackendOptions::default())
}

/// Build an unconnected handle for `params`.
pub fn create_backend_with(
    params: &ConnectionParams,
    options: BackendOptions,
) -> DeviceResult<DeviceHandle> {
    validate_params(params)?;
    let timeout = params.timeout();

    let device: Arc<dyn Device> = match params {
        #[cfg(feature = "serial")]
        ConnectionParams::Line { path, baud, .. } => Arc::new(
            crate::backends::LineSerialBackend::new(
                path.clone(),
                *baud,
                timeout.unwrap_or(DEFAULT_READ_TIMEOUT),
            ),
        ),
        #[cfg(not(feature = "serial"))]
        ConnectionParams::Line { .. } => {
            return Err(DeviceError::Unsupported(
                "line backend (built without the `serial` feature)".into(),
            ))
        }

        ConnectionParams::JsonLine { host, port, .. } => {
            Arc::new(crate::backends::JsonTcpBackend::new(
                host.clone(),
                *port,
                timeout.unwrap_or(JSON_LINE_TIMEOUT),
            ))
        }

        #[cfg(feature = "register_bus")]
        ConnectionParams::RegisterBus { bus, address, .. } => Arc::new(
            crate::backends::RegisterBusBackend::new(
                bus.clone(),
                *address,
                timeout.unwrap_or(DEFAULT_READ_TIMEOUT),
            ),
        ),
        #[cfg(not(feature = "register_bus"))]
        ConnectionParams::RegisterBus { .. } => {
            return Err(DeviceError::Unsupported(
                "register bus backend (built without the `register_bus` feature)".into(),
            ))
        }

        ConnectionParams::Simulated { seed } => {
            let config = match (options.simulator.clone(), seed) {
                (Some(config), _) => config,
                (None, Some(seed)) => SimConfig::seeded(*seed),
                (None, None) => SimConfig::default(),
            };
            Arc::new(SimulatedRig::new(config))
        }
    };

    // The engine's outer timeout sits above the backend's own so the backend
    // reports its typed timeout first.
    let stream = StreamSettings {
        failure_threshold: options
            .failure_threshold
            .unwrap_or(StreamSettings::default().failure_threshold),
        read_timeout: timeout.unwrap_or(JSON_LINE_TIMEOUT) + Duration::from_millis(500),
    };

    info!(kind = %params.kind(), "Backend created");
    Ok(DeviceHandle::new(device, params.kind(), options.bounds, stream))
}

/// Build the handle described by a loaded rig configuration.
pub fn create_from_config(config: &RigConfig) -> DeviceResult<DeviceHandle> {
    create_backend_with(&config.backend, BackendOptions::from_config(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tendon_core::{BackendKind, TransportKind};

    #[tokio::test(start_paused = true)]
    async fn simulated_backend_connects_and_reads() {
        let handle = create_backend(&ConnectionParams::Simulated { seed: Some(9) }).unwrap();
        assert_eq!(handle.kind(), BackendKind::Simulated);
        assert_eq!(handle.platform_info().transport, TransportKind::Simulated);
        handle.connect().await.unwrap();
        let sample = handle.get_sensors().await.unwrap();
        assert_eq!(sample.position, 0);
    }

    #[test]
    fn rejects_unusable_parameters() {
        let empty_path = ConnectionParams::Line {
            path: " ".into(),
            baud: 115_200,
            timeout_ms: None,
        };
        assert!(matches!(
            create_backend(&empty_path),
            Err(DeviceError::Connection { .. })
        ));

        let bad_address = ConnectionParams::RegisterBus {
            bus: "/dev/ttyAMA0".into(),
            address: 0x80,
            timeout_ms: None,
        };
        assert!(create_backend(&bad_address).is_err());

        let no_stream_port = ConnectionParams::JsonLine {
            host: "localhost".into(),
            port: u16::MAX,
            timeout_ms: None,
        };
        assert!(create_backend(&no_stream_port).is_err());
    }

    #[test]
    fn builds_every_real_transport_without_io() {
        let params = [
            ConnectionParams::Line {
                path: "/dev/ttyACM0".into(),
                baud: 115_200,
                timeout_ms: Some(250),
            },
            ConnectionParams::JsonLine {
                host: "192.168.1.100".into(),
                port: 5_000,
                timeout_ms: None,
            },
            ConnectionParams::RegisterBus {
                bus: "/dev/ttyAMA0".into(),
                address: 0x60,
                timeout_ms: None,
            },
        ];
        for p in &params {
            let handle = create_backend(p).unwrap();
            assert_eq!(handle.kind(), p.kind());
            assert!(!handle.is_connected());
        }
    }

    #[test]
    fn config_bounds_reach_the_handle() {
        let mut config = RigConfig::default();
        config.bounds.velocity_max_rpm = 1_200;
        let handle = create_from_config(&config).unwrap();
        assert_eq!(handle.bounds().velocity_max_rpm, 1_200);
    }
}
