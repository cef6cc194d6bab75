//! Wire encodings for the three controller families.
//!
//! Codecs are pure: they build and parse frames and never touch I/O, so every
//! malformed input ends up as a [`tendon_core::DeviceError::Decode`] instead of
//! a panic.

pub mod json_line;
pub mod line;
#[cfg(feature = "register_bus")]
pub mod register;
