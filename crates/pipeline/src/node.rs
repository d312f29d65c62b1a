//! The capability contract every processing plugin implements.
//!
//! Configuration collaborators talk to a node only through `configure` (an
//! immutable parameter snapshot, before the graph starts) and `counters`
//! (read-only observation). Everything else is driven by the runtime.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use signal_types::{Counter, SampleBlock};

use crate::error::NodeError;

/// Node parameters as a flexible key-value snapshot.
pub type NodeParams = HashMap<String, serde_json::Value>;

/// One output emission: destination port name plus the block.
pub type Emit = (String, Arc<SampleBlock>);

/// A pipeline stage transforming input blocks into output blocks.
///
/// The runtime calls `on_block` once per arriving block, in arrival order
/// per input port, from a single dedicated thread; implementations never
/// need interior synchronization.
pub trait ProcessingNode: Send {
    /// Stable type identifier, used by the registry and in logs.
    fn node_type(&self) -> &'static str;

    /// Applies a configuration snapshot. Called before the graph starts and
    /// never again; must not perform I/O beyond validating parameters.
    fn configure(&mut self, params: &NodeParams) -> Result<(), NodeError> {
        let _ = params;
        Ok(())
    }

    /// Processes one block from the named input port, returning zero or more
    /// output blocks keyed by output port name.
    fn on_block(&mut self, port: &str, block: Arc<SampleBlock>) -> Result<Vec<Emit>, NodeError>;

    /// Flushes buffered state when every input has reached end-of-stream.
    /// Called exactly once, after the last `on_block`.
    fn on_stop(&mut self) -> Result<Vec<Emit>, NodeError> {
        Ok(Vec::new())
    }

    /// Node-exposed counters for display collaborators.
    fn counters(&self) -> Vec<Counter> {
        Vec::new()
    }
}

/// Deserializes a [`NodeParams`] snapshot into a typed parameter struct.
pub fn typed_params<T: DeserializeOwned>(params: &NodeParams) -> Result<T, NodeError> {
    let map: serde_json::Map<String, serde_json::Value> =
        params.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    serde_json::from_value(serde_json::Value::Object(map))
        .map_err(|e| NodeError::BadParam(e.to_string()))
}
