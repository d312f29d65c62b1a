//! Exclusive owner of the physical serial handle; framed byte I/O.

use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::error::PortError;
use crate::frame::{encode_frame, scan_frame, Scan};
use crate::transport::{NativePort, SerialTransport};

/// Size of the scratch buffer for one transport read.
const READ_CHUNK: usize = 256;

/// Owns the transport and performs framed reads and writes. The handle is
/// never duplicated; higher layers borrow the controller for each exchange.
pub struct SerialPortController {
    transport: Box<dyn SerialTransport>,
    rx_buf: Vec<u8>,
    discarded_frames: u64,
}

impl SerialPortController {
    /// Opens the named serial device.
    pub fn open(path: &str, baud: u32) -> Result<Self, PortError> {
        Ok(Self::from_transport(Box::new(NativePort::open(path, baud)?)))
    }

    /// Wraps an already-open transport (mock or native).
    pub fn from_transport(transport: Box<dyn SerialTransport>) -> Self {
        Self {
            transport,
            rx_buf: Vec::new(),
            discarded_frames: 0,
        }
    }

    /// Frames and writes one payload.
    pub fn write_frame(&mut self, payload: &[u8]) -> Result<(), PortError> {
        let frame = encode_frame(payload)?;
        trace!("tx frame: {} payload bytes", payload.len());
        self.transport.send(&frame).map_err(PortError::from)
    }

    /// Reads the next checksum-valid frame, discarding malformed ones and
    /// resynchronizing at the next start marker. Fails with
    /// [`PortError::Timeout`] if no valid frame arrives before the deadline.
    pub fn read_frame(&mut self, timeout: Duration) -> Result<Vec<u8>, PortError> {
        let deadline = Instant::now() + timeout;
        loop {
            let (discarded, scan) = scan_frame(&mut self.rx_buf);
            if discarded > 0 {
                self.discarded_frames += discarded;
                debug!("discarded {} malformed frame(s), resynced", discarded);
            }
            if let Scan::Frame(payload) = scan {
                trace!("rx frame: {} payload bytes", payload.len());
                return Ok(payload);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(PortError::Timeout);
            }
            self.transport.set_read_timeout(deadline - now)?;
            let mut chunk = [0u8; READ_CHUNK];
            match self.transport.recv(&mut chunk) {
                Ok(0) => return Err(PortError::Io("transport closed".into())),
                Ok(n) => self.rx_buf.extend_from_slice(&chunk[..n]),
                Err(e) => return Err(PortError::from(e)),
            }
        }
    }

    /// Total malformed frames discarded since open.
    pub fn discarded_frames(&self) -> u64 {
        self.discarded_frames
    }

    /// Releases the port handle.
    pub fn close(self) {
        debug!("serial port closed");
    }
}
