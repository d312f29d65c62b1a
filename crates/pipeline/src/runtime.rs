//! The multi-threaded pipeline runtime.
//!
//! `start` turns a validated graph into one OS thread per node. Each thread
//! drains its own input channels, feeds the node, and routes emissions to
//! the output channels. The runtime itself performs no per-block work.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use signal_types::{Counter, StatusEvent};

use crate::channel::{
    stream_channel_internal, BlockReceiver, BlockSender, ChannelControl, OverflowPolicy, PopResult,
};
use crate::error::{ChannelError, GraphError};
use crate::graph::PipelineGraph;
use crate::node::ProcessingNode;

/// How long a node thread waits on one input port before servicing the next.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Capacity and policy for injector channels feeding unbound input ports.
const INJECTOR_CAPACITY: usize = 64;

/// Capacity for tap channels draining unbound output ports. Taps use the
/// drop-oldest policy so an idle display collaborator can never stall the
/// graph.
const TAP_CAPACITY: usize = 64;

/// A running pipeline. Dropping it stops the graph.
pub struct PipelineRuntime {
    threads: Vec<(String, JoinHandle<Box<dyn ProcessingNode>>)>,
    injectors: HashMap<String, BlockSender>,
    taps: HashMap<String, BlockReceiver>,
    injector_controls: Vec<ChannelControl>,
    edge_stats: Vec<(String, ChannelControl)>,
    status_tx: flume::Sender<StatusEvent>,
    status_rx: flume::Receiver<StatusEvent>,
    finished: Vec<(String, Box<dyn ProcessingNode>)>,
    stopped: bool,
}

impl PipelineRuntime {
    pub(crate) fn start(graph: PipelineGraph) -> Result<Self, GraphError> {
        let (status_tx, status_rx) = flume::unbounded();

        let mut senders: HashMap<String, BlockSender> = HashMap::new();
        let mut receivers: HashMap<String, BlockReceiver> = HashMap::new();
        let mut edge_stats = Vec::new();
        for edge in &graph.edges {
            let (tx, rx, control) = stream_channel_internal(edge.capacity, edge.policy);
            senders.insert(edge.source.label(), tx);
            receivers.insert(edge.sink.label(), rx);
            edge_stats.push((edge.label(), control));
        }

        let mut injectors = HashMap::new();
        let mut injector_controls = Vec::new();
        let mut taps = HashMap::new();

        let core_ids = core_affinity::get_core_ids().unwrap_or_default();
        if core_ids.is_empty() {
            warn!("could not enumerate core ids; thread affinity disabled");
        }

        let mut threads = Vec::new();
        for (i, slot) in graph.nodes.into_iter().enumerate() {
            let mut inputs = Vec::new();
            for port in &slot.inputs {
                let label = format!("{}.{}", slot.name, port.name);
                let rx = match receivers.remove(&label) {
                    Some(rx) => rx,
                    None => {
                        let (tx, rx, control) =
                            stream_channel_internal(INJECTOR_CAPACITY, OverflowPolicy::Block);
                        injectors.insert(label.clone(), tx);
                        injector_controls.push(control);
                        rx
                    }
                };
                inputs.push((port.name.clone(), rx));
            }

            let mut outputs = HashMap::new();
            for port in &slot.outputs {
                let label = format!("{}.{}", slot.name, port.name);
                let tx = match senders.remove(&label) {
                    Some(tx) => tx,
                    None => {
                        let (tx, rx, _control) =
                            stream_channel_internal(TAP_CAPACITY, OverflowPolicy::DropOldest);
                        taps.insert(label.clone(), rx);
                        tx
                    }
                };
                outputs.insert(port.name.clone(), tx);
            }

            let name = slot.name.clone();
            let node = slot.node;
            let status = status_tx.clone();
            let core_ids = core_ids.clone();
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    if !core_ids.is_empty() {
                        let core_id = core_ids[i % core_ids.len()];
                        if !core_affinity::set_for_current(core_id) {
                            warn!("failed to set affinity for node '{}'", name);
                        }
                    }
                    run_node(&name, node, inputs, outputs, status)
                })
                .map_err(|e| GraphError::Node(crate::error::NodeError::Fatal(e.to_string())))?;
            threads.push((slot.name, handle));
        }

        info!("pipeline started with {} node threads", threads.len());
        Ok(Self {
            threads,
            injectors,
            taps,
            injector_controls,
            edge_stats,
            status_tx,
            status_rx,
            finished: Vec::new(),
            stopped: false,
        })
    }

    /// Takes the producing end of an unbound input port (`node.port`).
    /// Dropping the returned sender signals end-of-stream into that port.
    pub fn injector(&mut self, port: &str) -> Option<BlockSender> {
        self.injectors.remove(port)
    }

    /// Takes the consuming end of an unbound output port (`node.port`).
    pub fn tap(&mut self, port: &str) -> Option<BlockReceiver> {
        self.taps.remove(port)
    }

    /// The one-way observation stream of status events.
    pub fn status(&self) -> flume::Receiver<StatusEvent> {
        self.status_rx.clone()
    }

    /// A sender collaborators may use to merge their own events into the
    /// same observation stream.
    pub fn status_sender(&self) -> flume::Sender<StatusEvent> {
        self.status_tx.clone()
    }

    /// Dropped-block totals per edge, readable while running.
    pub fn dropped_blocks(&self) -> Vec<(String, u64)> {
        self.edge_stats
            .iter()
            .map(|(label, control)| (label.clone(), control.dropped()))
            .collect()
    }

    /// Stops the pipeline: closes every injector so end-of-stream cascades
    /// through the graph, then joins all node threads. Every node observes
    /// the drain and runs `on_stop` exactly once. Idempotent.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        info!("stopping pipeline");
        self.injectors.clear();
        for control in &self.injector_controls {
            control.close_producer();
        }
        for (name, handle) in self.threads.drain(..) {
            match handle.join() {
                Ok(node) => self.finished.push((name, node)),
                Err(_) => error!("node '{}' thread panicked during shutdown", name),
            }
        }
    }

    /// Per-node counters, available once [`stop`](Self::stop) has run.
    pub fn counters(&self) -> Vec<(String, Vec<Counter>)> {
        self.finished
            .iter()
            .map(|(name, node)| (name.clone(), node.counters()))
            .collect()
    }
}

impl Drop for PipelineRuntime {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Body of one node thread: drain inputs round-robin, feed the node, route
/// emissions, flush on end-of-stream. Faults are isolated here — the thread
/// reports and exits, closing its channels, while siblings keep running.
fn run_node(
    name: &str,
    mut node: Box<dyn ProcessingNode>,
    mut inputs: Vec<(String, BlockReceiver)>,
    outputs: HashMap<String, BlockSender>,
    status: flume::Sender<StatusEvent>,
) -> Box<dyn ProcessingNode> {
    debug!("node thread '{}' started", name);
    while !inputs.is_empty() {
        let mut i = 0;
        while i < inputs.len() {
            match inputs[i].1.pop_timeout(POLL_INTERVAL) {
                PopResult::Block(block) => {
                    let port = inputs[i].0.clone();
                    let result =
                        catch_unwind(AssertUnwindSafe(|| node.on_block(&port, block)));
                    match result {
                        Ok(Ok(emits)) => {
                            if let Err(message) = route(name, emits, &outputs) {
                                fault(name, &message, &status);
                                return node;
                            }
                        }
                        Ok(Err(e)) => {
                            fault(name, &e.to_string(), &status);
                            return node;
                        }
                        Err(_) => {
                            fault(name, "panic in on_block", &status);
                            return node;
                        }
                    }
                    i += 1;
                }
                PopResult::TimedOut => i += 1,
                PopResult::Closed => {
                    debug!("node '{}' input '{}' reached end-of-stream", name, inputs[i].0);
                    inputs.remove(i);
                }
            }
        }
    }

    // All inputs drained: flush trailing output exactly once.
    match catch_unwind(AssertUnwindSafe(|| node.on_stop())) {
        Ok(Ok(emits)) => {
            if let Err(message) = route(name, emits, &outputs) {
                fault(name, &message, &status);
                return node;
            }
        }
        Ok(Err(e)) => {
            fault(name, &e.to_string(), &status);
            return node;
        }
        Err(_) => {
            fault(name, "panic in on_stop", &status);
            return node;
        }
    }
    let _ = status.send(StatusEvent::NodeStopped {
        node: name.to_string(),
    });
    debug!("node thread '{}' finished", name);
    node
}

fn route(
    name: &str,
    emits: Vec<(String, std::sync::Arc<signal_types::SampleBlock>)>,
    outputs: &HashMap<String, BlockSender>,
) -> Result<(), String> {
    for (port, block) in emits {
        match outputs.get(&port) {
            Some(tx) => match tx.push(block) {
                Ok(()) => {}
                Err(ChannelError::Closed) => {
                    debug!("downstream of '{}.{}' disconnected", name, port);
                }
                Err(e @ ChannelError::WidthMismatch { .. }) => {
                    return Err(format!("emission on port '{port}': {e}"));
                }
            },
            None => warn!("node '{}' emitted to unwired port '{}'", name, port),
        }
    }
    Ok(())
}

fn fault(name: &str, message: &str, status: &flume::Sender<StatusEvent>) {
    error!("node '{}' faulted: {}", name, message);
    let _ = status.send(StatusEvent::NodeFault {
        node: name.to_string(),
        message: message.to_string(),
    });
}
