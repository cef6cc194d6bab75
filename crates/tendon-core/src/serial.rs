//! Serial port plumbing shared by the serial-attached backends.
//!
//! Backends store a [`DynSerial`] so tests can substitute an in-memory
//! `tokio::io::duplex` stream for real hardware.

use crate::error::{DeviceError, DeviceResult};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, BufReader};

/// Anything usable as a serial port: real `SerialStream`s and test duplexes.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Serial port with line buffering, for ASCII protocols.
pub type LinePort = BufReader<DynSerial>;

/// Open a serial port at 8N1 without flow control.
///
/// Opening can block on some platforms, so it runs on the blocking pool.
pub async fn open_serial(path: &str, baud_rate: u32, backend: &str) -> DeviceResult<DynSerial> {
    use tokio_serial::SerialPortBuilderExt;

    let path_owned = path.to_string();
    let opened = tokio::task::spawn_blocking(move || {
        tokio_serial::new(&path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
    })
    .await
    .map_err(|e| DeviceError::connection(backend, format!("open task failed: {e}")))?;

    let stream = opened
        .map_err(|e| DeviceError::connection(backend, format!("cannot open {path}: {e}")))?;
    Ok(Box::new(stream))
}

/// Discard whatever the device has already sent.
///
/// Reads until the port is quiet for `quiet` or returns EOF/error. Returns the
/// number of bytes discarded.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin>(port: &mut R, quiet: Duration) -> usize {
    let mut discard = [0u8; 256];
    let mut total = 0usize;

    loop {
        match tokio::time::timeout(quiet, port.read(&mut discard)).await {
            Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
            Ok(Ok(n)) => total += n,
        }
    }
    total
}

/// Read one line within `timeout`, without the trailing newline.
///
/// EOF is reported as a connection loss.
pub async fn read_line_bounded<R: AsyncBufRead + Unpin>(
    port: &mut R,
    timeout: Duration,
    operation: &str,
) -> DeviceResult<String> {
    let mut line = String::new();
    let read = tokio::time::timeout(timeout, port.read_line(&mut line))
        .await
        .map_err(|_| DeviceError::timeout(operation, timeout))??;
    if read == 0 {
        return Err(DeviceError::Io("port closed by remote end".into()));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}
