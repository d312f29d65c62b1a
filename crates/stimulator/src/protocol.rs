//! Command/response state machine for the stimulator link.
//!
//! The link is half-duplex: at most one command is outstanding per session
//! at any instant. `submit` rejects a second command with `Busy` instead of
//! queuing — callers sequence their requests through the session lock.
//! Fault is terminal; recovery always builds a fresh session.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{PortError, ProtocolError};
use crate::port::SerialPortController;

/// Connection lifecycle of one device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    Busy,
    Fault,
}

/// The device command vocabulary. Opcode values are configuration data, not
/// code: variants index into a [`CommandSet`] table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Identify,
    Arm,
    Disarm,
    Fire,
    GetParam,
    SetParam,
}

/// Opcode and fixed parameter width for one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub opcode: u8,
    pub param_len: usize,
}

/// Per-device command table. Device family variants differ only in this
/// data, never in code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSet {
    pub identify: CommandSpec,
    pub arm: CommandSpec,
    pub disarm: CommandSpec,
    pub fire: CommandSpec,
    pub get_param: CommandSpec,
    pub set_param: CommandSpec,
}

impl Default for CommandSet {
    fn default() -> Self {
        Self {
            identify: CommandSpec {
                opcode: 0x01,
                param_len: 0,
            },
            arm: CommandSpec {
                opcode: 0x10,
                param_len: 0,
            },
            disarm: CommandSpec {
                opcode: 0x11,
                param_len: 0,
            },
            fire: CommandSpec {
                opcode: 0x12,
                param_len: 4,
            },
            get_param: CommandSpec {
                opcode: 0x20,
                param_len: 1,
            },
            set_param: CommandSpec {
                opcode: 0x21,
                param_len: 3,
            },
        }
    }
}

impl CommandSet {
    pub fn spec(&self, kind: CommandKind) -> &CommandSpec {
        match kind {
            CommandKind::Identify => &self.identify,
            CommandKind::Arm => &self.arm,
            CommandKind::Disarm => &self.disarm,
            CommandKind::Fire => &self.fire,
            CommandKind::GetParam => &self.get_param,
            CommandKind::SetParam => &self.set_param,
        }
    }

    /// Builds a command, validating the parameter width against the table.
    pub fn command(&self, kind: CommandKind, params: Vec<u8>) -> Result<Command, ProtocolError> {
        let spec = self.spec(kind);
        if params.len() != spec.param_len {
            return Err(ProtocolError::InvalidCommand(format!(
                "{kind:?} takes {} parameter bytes, got {}",
                spec.param_len,
                params.len()
            )));
        }
        Ok(Command {
            kind,
            opcode: spec.opcode,
            params,
        })
    }
}

/// One encoded command, ready for submission.
#[derive(Debug, Clone)]
pub struct Command {
    pub kind: CommandKind,
    pub opcode: u8,
    pub params: Vec<u8>,
}

/// A decoded device response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub opcode: u8,
    pub seq: u8,
    /// Device status byte; zero means success.
    pub status: u8,
    pub data: Vec<u8>,
}

fn decode_response(payload: &[u8]) -> Result<Response, ProtocolError> {
    if payload.len() < 3 {
        return Err(ProtocolError::Mismatch(format!(
            "response too short: {} bytes",
            payload.len()
        )));
    }
    Ok(Response {
        opcode: payload[0],
        seq: payload[1],
        status: payload[2],
        data: payload[3..].to_vec(),
    })
}

/// The state machine driving one session's exchanges. Holds no port of its
/// own: the owning session lends its controller to every call.
pub struct StimulatorProtocol {
    set: CommandSet,
    state: ConnectionState,
    seq: u8,
    pending: Option<(u8, u8)>,
    response_timeout: Duration,
    handshake_retries: u32,
    retries_used: u64,
}

impl StimulatorProtocol {
    pub fn new(set: CommandSet, response_timeout: Duration, handshake_retries: u32) -> Self {
        Self {
            set,
            state: ConnectionState::Disconnected,
            seq: 0,
            pending: None,
            response_timeout,
            handshake_retries: handshake_retries.max(1),
            retries_used: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn command_set(&self) -> &CommandSet {
        &self.set
    }

    /// Handshake retries consumed over the session lifetime.
    pub fn retries_used(&self) -> u64 {
        self.retries_used
    }

    /// Runs the identification handshake. Disconnected -> Connecting, then
    /// Ready on success or Fault once the retry budget is spent. Returns the
    /// device identity payload.
    pub fn connect(&mut self, port: &mut SerialPortController) -> Result<Vec<u8>, ProtocolError> {
        match self.state {
            ConnectionState::Disconnected => {}
            ConnectionState::Fault => return Err(ProtocolError::SessionFault),
            state => return Err(ProtocolError::InvalidState { op: "connect", state }),
        }
        self.state = ConnectionState::Connecting;

        let identify = self.set.command(CommandKind::Identify, Vec::new())?;
        let mut last = ProtocolError::Timeout;
        for attempt in 1..=self.handshake_retries {
            match self.exchange(port, &identify) {
                Ok(resp) if resp.status == 0 => {
                    debug!("handshake complete on attempt {}", attempt);
                    self.state = ConnectionState::Ready;
                    return Ok(resp.data);
                }
                Ok(resp) => {
                    last = ProtocolError::Handshake(format!(
                        "device refused identification, status {:#04x}",
                        resp.status
                    ));
                }
                Err(e) => {
                    warn!("handshake attempt {} failed: {}", attempt, e);
                    last = e;
                }
            }
            self.retries_used += 1;
        }
        self.state = ConnectionState::Fault;
        Err(ProtocolError::Handshake(last.to_string()))
    }

    /// Writes one command frame. Ready -> Busy. A call while Busy fails with
    /// [`ProtocolError::Busy`] and leaves the pending sequence untouched.
    pub fn submit(
        &mut self,
        port: &mut SerialPortController,
        cmd: &Command,
    ) -> Result<(), ProtocolError> {
        match self.state {
            ConnectionState::Ready => {}
            ConnectionState::Busy => return Err(ProtocolError::Busy),
            ConnectionState::Fault => return Err(ProtocolError::SessionFault),
            state => return Err(ProtocolError::InvalidState { op: "submit", state }),
        }
        let seq = self.next_seq();
        if let Err(e) = self.write_command(port, cmd, seq) {
            self.state = ConnectionState::Fault;
            return Err(e.into());
        }
        self.pending = Some((cmd.opcode, seq));
        self.state = ConnectionState::Busy;
        Ok(())
    }

    /// Awaits the response matching the pending command. Busy -> Ready on a
    /// match; Busy -> Fault on timeout or opcode/sequence mismatch.
    pub fn receive(
        &mut self,
        port: &mut SerialPortController,
        timeout: Duration,
    ) -> Result<Response, ProtocolError> {
        let (opcode, seq) = match (self.state, self.pending) {
            (ConnectionState::Busy, Some(pending)) => pending,
            (state, _) => return Err(ProtocolError::InvalidState { op: "receive", state }),
        };
        match port.read_frame(timeout) {
            Ok(payload) => {
                let resp = match decode_response(&payload) {
                    Ok(resp) => resp,
                    Err(e) => {
                        self.state = ConnectionState::Fault;
                        return Err(e);
                    }
                };
                if resp.opcode != opcode || resp.seq != seq {
                    self.state = ConnectionState::Fault;
                    return Err(ProtocolError::Mismatch(format!(
                        "expected opcode {opcode:#04x} seq {seq}, got opcode {:#04x} seq {}",
                        resp.opcode, resp.seq
                    )));
                }
                self.pending = None;
                self.state = ConnectionState::Ready;
                Ok(resp)
            }
            Err(PortError::Timeout) => {
                self.state = ConnectionState::Fault;
                Err(ProtocolError::Timeout)
            }
            Err(e) => {
                self.state = ConnectionState::Fault;
                Err(e.into())
            }
        }
    }

    /// One full half-duplex exchange with the configured response timeout.
    pub fn transact(
        &mut self,
        port: &mut SerialPortController,
        cmd: &Command,
    ) -> Result<Response, ProtocolError> {
        self.submit(port, cmd)?;
        self.receive(port, self.response_timeout)
    }

    /// Drops any state and returns to Disconnected. Legal from any state.
    pub fn disconnect(&mut self) {
        self.pending = None;
        self.state = ConnectionState::Disconnected;
    }

    /// Raw exchange used by the handshake, outside the Ready/Busy discipline.
    fn exchange(
        &mut self,
        port: &mut SerialPortController,
        cmd: &Command,
    ) -> Result<Response, ProtocolError> {
        let seq = self.next_seq();
        self.write_command(port, cmd, seq)?;
        let payload = port.read_frame(self.response_timeout)?;
        let resp = decode_response(&payload)?;
        if resp.opcode != cmd.opcode || resp.seq != seq {
            return Err(ProtocolError::Mismatch(format!(
                "expected opcode {:#04x} seq {seq}, got opcode {:#04x} seq {}",
                cmd.opcode, resp.opcode, resp.seq
            )));
        }
        Ok(resp)
    }

    fn write_command(
        &mut self,
        port: &mut SerialPortController,
        cmd: &Command,
        seq: u8,
    ) -> Result<(), PortError> {
        let mut payload = Vec::with_capacity(2 + cmd.params.len());
        payload.push(cmd.opcode);
        payload.push(seq);
        payload.extend_from_slice(&cmd.params);
        port.write_frame(&payload)
    }

    fn next_seq(&mut self) -> u8 {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        seq
    }
}
