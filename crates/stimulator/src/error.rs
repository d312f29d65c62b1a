//! Error types for the device-control subsystem

use thiserror::Error;

use crate::protocol::ConnectionState;

/// Errors from the serial port layer.
#[derive(Error, Debug, Clone)]
pub enum PortError {
    /// The port could not be opened (missing device, permissions, in use).
    #[error("port unavailable: {0}")]
    Unavailable(String),

    /// No complete frame arrived within the deadline.
    #[error("read timed out")]
    Timeout,

    /// The payload does not fit the one-byte length prefix.
    #[error("frame payload too long: {0} bytes")]
    FrameTooLong(usize),

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for PortError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => PortError::Timeout,
            _ => PortError::Io(err.to_string()),
        }
    }
}

/// Errors from the command/response state machine.
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    /// A command is already outstanding; callers must sequence their own
    /// requests rather than queue them here.
    #[error("link is busy with an outstanding command")]
    Busy,

    /// The matching response did not arrive in time.
    #[error("response timed out")]
    Timeout,

    /// Checksum failures exhausted the retry budget.
    #[error("checksum failures exceeded retry budget")]
    Checksum,

    /// The response did not match the pending command.
    #[error("response mismatch: {0}")]
    Mismatch(String),

    /// The identification exchange never succeeded.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The session is faulted; recovery requires a fresh session.
    #[error("session is faulted")]
    SessionFault,

    /// The operation is not legal in the current state.
    #[error("'{op}' is invalid in state {state:?}")]
    InvalidState {
        op: &'static str,
        state: ConnectionState,
    },

    /// Command construction failed (unknown width, oversized payload).
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error(transparent)]
    Port(#[from] PortError),
}
