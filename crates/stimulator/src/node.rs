//! Pipeline-facing wrapper: fire the stimulator from pipeline events.
//!
//! The node is a sink. It watches one channel of its input stream for an
//! upward threshold crossing and issues a `fire` exchange through the
//! supervisor's session lock. Device trouble is counted and logged, never
//! escalated into a node fault — link recovery is the supervisor's job.

use std::sync::{Arc, Mutex};

use byteorder::{LittleEndian, WriteBytesExt};
use serde::Deserialize;
use tracing::{debug, warn};

use pipeline::{typed_params, Emit, NodeError, NodeParams, ProcessingNode};
use signal_types::{Counter, SampleBlock};

use crate::protocol::{CommandKind, ConnectionState};
use crate::session::DeviceSession;

#[derive(Debug, Clone, Deserialize)]
struct TriggerParams {
    channel: usize,
    threshold: f32,
    #[serde(default = "default_amplitude_ma")]
    amplitude_ma: u16,
    #[serde(default = "default_pulse_us")]
    pulse_us: u16,
}

fn default_amplitude_ma() -> u16 {
    1
}

fn default_pulse_us() -> u16 {
    100
}

/// Threshold-triggered stimulation node.
pub struct TriggerNode {
    session: Arc<Mutex<Option<DeviceSession>>>,
    channel: usize,
    threshold: f32,
    fire_params: Vec<u8>,
    /// True while the watched signal sits below the threshold; a fire is
    /// issued only on the below-to-above edge.
    below: bool,
    fired: u64,
    skipped: u64,
}

impl TriggerNode {
    pub fn new(session: Arc<Mutex<Option<DeviceSession>>>) -> Self {
        Self {
            session,
            channel: 0,
            threshold: 0.0,
            fire_params: Vec::new(),
            below: true,
            fired: 0,
            skipped: 0,
        }
    }

    fn fire(&mut self) {
        let mut guard = self.session.lock().unwrap();
        let live = match guard.as_mut() {
            Some(live) if live.state() == ConnectionState::Ready => live,
            _ => {
                self.skipped += 1;
                debug!("trigger suppressed: no ready device session");
                return;
            }
        };
        let cmd = match live.command(CommandKind::Fire, self.fire_params.clone()) {
            Ok(cmd) => cmd,
            Err(e) => {
                self.skipped += 1;
                warn!("fire command rejected by command table: {}", e);
                return;
            }
        };
        match live.transact(&cmd) {
            Ok(resp) if resp.status == 0 => {
                self.fired += 1;
                debug!("stimulation fired ({} total)", self.fired);
            }
            Ok(resp) => {
                self.skipped += 1;
                warn!("device refused fire, status {:#04x}", resp.status);
            }
            Err(e) => {
                self.skipped += 1;
                warn!("fire exchange failed: {}", e);
            }
        }
    }
}

impl ProcessingNode for TriggerNode {
    fn node_type(&self) -> &'static str {
        "stim_trigger"
    }

    fn configure(&mut self, params: &NodeParams) -> Result<(), NodeError> {
        let p: TriggerParams = typed_params(params)?;
        let mut fire_params = Vec::with_capacity(4);
        fire_params
            .write_u16::<LittleEndian>(p.amplitude_ma)
            .and_then(|_| fire_params.write_u16::<LittleEndian>(p.pulse_us))
            .map_err(|e| NodeError::Fatal(e.to_string()))?;
        self.channel = p.channel;
        self.threshold = p.threshold;
        self.fire_params = fire_params;
        Ok(())
    }

    fn on_block(&mut self, _port: &str, block: Arc<SampleBlock>) -> Result<Vec<Emit>, NodeError> {
        let samples = block.channel(self.channel).ok_or_else(|| {
            NodeError::BadBlock(format!(
                "trigger channel {} out of range for {}-channel block",
                self.channel,
                block.channel_count()
            ))
        })?;
        for &sample in samples {
            if sample >= self.threshold {
                if self.below {
                    self.below = false;
                    self.fire();
                }
            } else {
                self.below = true;
            }
        }
        Ok(Vec::new())
    }

    fn counters(&self) -> Vec<Counter> {
        vec![
            Counter::new("stim_fired", self.fired),
            Counter::new("stim_skipped", self.skipped),
        ]
    }
}
