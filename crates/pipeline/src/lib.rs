//! Dataflow pipeline for multichannel sample blocks.
//!
//! This crate implements the live processing graph of the workbench:
//! capability-typed nodes connected by bounded single-producer/single-
//! consumer channels, validated as a DAG at construction time and executed
//! with one thread per node. GUI and configuration collaborators interact
//! only through parameter snapshots, injectors/taps, and the one-way
//! observation stream.

pub mod channel;
pub mod error;
pub mod graph;
pub mod node;
pub mod registry;
pub mod runtime;

// Re-export commonly used types
pub use channel::{stream_channel, BlockReceiver, BlockSender, OverflowPolicy, PopResult};
pub use error::{ChannelError, GraphError, NodeError};
pub use graph::{PipelineGraph, PortSpec};
pub use node::{typed_params, Emit, NodeParams, ProcessingNode};
pub use registry::{NodeFactory, NodeRegistry};
pub use runtime::PipelineRuntime;
