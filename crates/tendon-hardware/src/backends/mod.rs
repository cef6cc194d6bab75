//! [`tendon_core::Device`] implementations for real controllers.

pub mod json_tcp;
#[cfg(feature = "serial")]
pub mod line_serial;
#[cfg(feature = "register_bus")]
pub mod register_bus;

pub use json_tcp::JsonTcpBackend;
#[cfg(feature = "serial")]
pub use line_serial::LineSerialBackend;
#[cfg(feature = "register_bus")]
pub use register_bus::RegisterBusBackend;
