//! Byte transport abstraction over the physical serial link.
//!
//! The controller owns a boxed transport so the protocol stack can run
//! against real hardware or the in-memory mock used by the test rigs.

use std::io::{self, Read, Write};
use std::time::Duration;

use tracing::debug;

use crate::error::PortError;

/// Default read timeout applied at open; `read_frame` overrides it per call.
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);

/// A half-duplex byte stream with a configurable read timeout.
pub trait SerialTransport: Send {
    /// Writes the whole buffer.
    fn send(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Reads up to `buf.len()` bytes, honoring the configured read timeout.
    /// A timeout surfaces as `ErrorKind::TimedOut`.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Sets the read timeout for subsequent `recv` calls.
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()>;
}

/// The real serial port, via the `serialport` crate.
pub struct NativePort {
    inner: Box<dyn serialport::SerialPort>,
}

impl NativePort {
    /// Opens the named port at the given baud rate.
    pub fn open(path: &str, baud: u32) -> Result<Self, PortError> {
        let inner = serialport::new(path, baud)
            .timeout(DEFAULT_TIMEOUT)
            .open()
            .map_err(|e| PortError::Unavailable(e.to_string()))?;
        debug!("opened serial port {} @ {} baud", path, baud);
        Ok(Self { inner })
    }
}

impl SerialTransport for NativePort {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.inner.write_all(bytes)?;
        self.inner.flush()
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.inner
            .set_timeout(timeout)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    }
}
