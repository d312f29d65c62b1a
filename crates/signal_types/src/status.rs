//! One-way observation events surfaced to GUI/log collaborators.
//!
//! The core never shares mutable state across the boundary; collaborators
//! receive immutable snapshots on a channel and send configuration snapshots
//! in. These are the events flowing out.

use serde::Serialize;
use std::time::Duration;

/// A named monotonic counter exposed by a node or link component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Counter {
    pub name: String,
    pub value: u64,
}

impl Counter {
    pub fn new(name: impl Into<String>, value: u64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Status updates emitted by the pipeline runtime and the connection
/// supervisor. Delivery is best-effort; dropping the receiving end only
/// silences observation, never processing.
#[derive(Debug, Clone, Serialize)]
pub enum StatusEvent {
    /// A node returned an error or panicked; its channels were closed and
    /// the rest of the graph keeps running.
    NodeFault { node: String, message: String },
    /// A node drained its inputs and flushed its trailing output.
    NodeStopped { node: String },
    /// A device session reached Ready.
    LinkUp { session_id: String, identity: String },
    /// The live session was lost or a connect attempt failed.
    LinkDown { reason: String },
    /// The supervisor scheduled a reconnect attempt.
    ReconnectScheduled { failures: u32, delay: Duration },
    /// Consecutive failures exhausted the budget; auto-retry is halted until
    /// an operator reset.
    HardFault { failures: u32 },
    /// An operator reset was accepted.
    SupervisorReset,
}
