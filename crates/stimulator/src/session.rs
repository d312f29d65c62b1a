//! One live connection attempt to the device.
//!
//! A session is created on connect and destroyed on shutdown or fault;
//! reconnecting always builds a fresh session object, so no state leaks
//! across session boundaries.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::port::SerialPortController;
use crate::protocol::{
    Command, CommandKind, CommandSet, ConnectionState, Response, StimulatorProtocol,
};

/// Serial link parameters supplied by configuration collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSettings {
    pub path: String,
    pub baud: u32,
    /// How long to wait for each response.
    #[serde(default = "default_response_timeout")]
    pub response_timeout: Duration,
    /// Identification attempts before the handshake faults.
    #[serde(default = "default_handshake_retries")]
    pub handshake_retries: u32,
}

fn default_response_timeout() -> Duration {
    Duration::from_millis(500)
}

fn default_handshake_retries() -> u32 {
    3
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            path: "/dev/ttyUSB0".to_string(),
            baud: 115_200,
            response_timeout: default_response_timeout(),
            handshake_retries: default_handshake_retries(),
        }
    }
}

/// The live state of one serial connection to the stimulator: the open port
/// handle, the protocol state machine, and the session health counters.
pub struct DeviceSession {
    id: Uuid,
    port: SerialPortController,
    protocol: StimulatorProtocol,
    identity: Vec<u8>,
    consecutive_failures: u32,
    last_ok: Option<Instant>,
}

impl DeviceSession {
    /// Opens the configured port and runs the handshake.
    pub fn open(settings: &LinkSettings, set: CommandSet) -> Result<Self, ProtocolError> {
        let port = SerialPortController::open(&settings.path, settings.baud)?;
        Self::establish(port, settings, set)
    }

    /// Runs the handshake over an already-open controller. This is the path
    /// test rigs use with a mock transport.
    pub fn establish(
        mut port: SerialPortController,
        settings: &LinkSettings,
        set: CommandSet,
    ) -> Result<Self, ProtocolError> {
        let mut protocol =
            StimulatorProtocol::new(set, settings.response_timeout, settings.handshake_retries);
        let identity = protocol.connect(&mut port)?;
        let id = Uuid::new_v4();
        info!(
            "device session {} ready, identity {:?}",
            id,
            String::from_utf8_lossy(&identity)
        );
        Ok(Self {
            id,
            port,
            protocol,
            identity,
            consecutive_failures: 0,
            last_ok: Some(Instant::now()),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.protocol.state()
    }

    pub fn identity(&self) -> &[u8] {
        &self.identity
    }

    /// Builds a command against this session's table.
    pub fn command(&self, kind: CommandKind, params: Vec<u8>) -> Result<Command, ProtocolError> {
        self.protocol.command_set().command(kind, params)
    }

    /// One half-duplex exchange, tracking session health.
    pub fn transact(&mut self, cmd: &Command) -> Result<Response, ProtocolError> {
        let result = self.protocol.transact(&mut self.port, cmd);
        match &result {
            Ok(resp) if resp.status == 0 => {
                self.consecutive_failures = 0;
                self.last_ok = Some(Instant::now());
            }
            _ => self.consecutive_failures += 1,
        }
        result
    }

    /// Lightweight liveness probe: the identification exchange.
    pub fn ping(&mut self) -> Result<(), ProtocolError> {
        let cmd = self.command(CommandKind::Identify, Vec::new())?;
        self.transact(&cmd).map(|_| ())
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_ok(&self) -> Option<Instant> {
        self.last_ok
    }

    /// Malformed frames discarded on this session's port.
    pub fn discarded_frames(&self) -> u64 {
        self.port.discarded_frames()
    }

    /// Tears the session down explicitly.
    pub fn shutdown(mut self) {
        self.protocol.disconnect();
        self.port.close();
    }
}
