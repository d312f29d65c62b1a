//! Serial device-control subsystem for the workbench.
//!
//! Layers, bottom up: a framed byte transport over the serial link, the
//! half-duplex command/response state machine, the per-attempt device
//! session, and the connection supervisor that keeps exactly one session
//! alive across transient faults. `TriggerNode` wraps the stack as a
//! pipeline sink so stimulation can be driven by signal events.

pub mod error;
pub mod frame;
pub mod mock;
pub mod node;
pub mod port;
pub mod protocol;
pub mod session;
pub mod supervisor;
pub mod transport;

// Re-export commonly used types
pub use error::{PortError, ProtocolError};
pub use frame::{checksum, encode_frame, FRAME_START};
pub use node::TriggerNode;
pub use port::SerialPortController;
pub use protocol::{
    Command, CommandKind, CommandSet, CommandSpec, ConnectionState, Response, StimulatorProtocol,
};
pub use session::{DeviceSession, LinkSettings};
pub use supervisor::{
    ConnectionSupervisor, SessionFactory, SupervisorPhase, SupervisorSettings,
};
pub use transport::{NativePort, SerialTransport};
