//! Error types for the pipeline system

use thiserror::Error;

/// Errors raised while building or starting a graph.
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("edge '{edge}' would close a cycle")]
    Cycle { edge: String },

    #[error("port arity violation: {0}")]
    PortArity(String),

    #[error("unknown node '{0}'")]
    UnknownNode(String),

    #[error("duplicate node name '{0}'")]
    DuplicateNode(String),

    #[error("node type not registered: {0}")]
    UnknownNodeType(String),

    #[error(transparent)]
    Node(#[from] NodeError),
}

/// Errors surfaced by a stream channel end.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The opposite end is gone; no further blocks will move.
    #[error("channel closed")]
    Closed,

    /// The block's channel count does not match the width pinned on first push.
    #[error("block width {got} does not match channel width {want}")]
    WidthMismatch { want: usize, got: usize },
}

/// Errors returned by a processing node.
#[derive(Error, Debug, Clone)]
pub enum NodeError {
    #[error("bad parameter: {0}")]
    BadParam(String),

    #[error("malformed block: {0}")]
    BadBlock(String),

    #[error("fatal: {0}")]
    Fatal(String),
}
