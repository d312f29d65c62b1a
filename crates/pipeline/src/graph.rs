//! Pipeline graph construction and validation.
//!
//! The graph is a pure builder: nodes and edges are checked as they are
//! added (acyclicity, port arity, channel widths) so that `start` can wire
//! threads without runtime surprises. A rejected edge leaves the graph
//! exactly as it was.

use std::collections::HashMap;

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::channel::OverflowPolicy;
use crate::error::GraphError;
use crate::node::ProcessingNode;
use crate::runtime::PipelineRuntime;

/// Declaration of one input or output port on a node.
#[derive(Debug, Clone)]
pub struct PortSpec {
    pub name: String,
    /// Expected channel count, if the node pins one. Edges between two
    /// ports with declared widths must agree.
    pub width: Option<usize>,
}

impl PortSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            width: None,
        }
    }

    pub fn with_width(name: impl Into<String>, width: usize) -> Self {
        Self {
            name: name.into(),
            width: Some(width),
        }
    }
}

impl From<&str> for PortSpec {
    fn from(name: &str) -> Self {
        PortSpec::new(name)
    }
}

/// A fully qualified port reference, `node.port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct PortRef {
    pub(crate) node: String,
    pub(crate) port: String,
}

impl PortRef {
    fn parse(spec: &str) -> Result<Self, GraphError> {
        match spec.split_once('.') {
            Some((node, port)) if !node.is_empty() && !port.is_empty() => Ok(Self {
                node: node.to_string(),
                port: port.to_string(),
            }),
            _ => Err(GraphError::PortArity(format!(
                "invalid port reference '{spec}', expected 'node.port'"
            ))),
        }
    }

    pub(crate) fn label(&self) -> String {
        format!("{}.{}", self.node, self.port)
    }
}

pub(crate) struct NodeSlot {
    pub(crate) name: String,
    pub(crate) node: Box<dyn ProcessingNode>,
    pub(crate) inputs: Vec<PortSpec>,
    pub(crate) outputs: Vec<PortSpec>,
}

pub(crate) struct EdgeSpec {
    pub(crate) source: PortRef,
    pub(crate) sink: PortRef,
    pub(crate) capacity: usize,
    pub(crate) policy: OverflowPolicy,
}

impl EdgeSpec {
    pub(crate) fn label(&self) -> String {
        format!("{}->{}", self.source.label(), self.sink.label())
    }
}

/// Owns the set of nodes and edges forming a DAG, and turns into a running
/// pipeline via [`start`](Self::start).
#[derive(Default)]
pub struct PipelineGraph {
    pub(crate) nodes: Vec<NodeSlot>,
    pub(crate) edges: Vec<EdgeSpec>,
    dag: DiGraph<String, ()>,
    indices: HashMap<String, NodeIndex>,
}

impl PipelineGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node with its declared ports. Every node consumes at least one
    /// input channel; pure sources are fed through an unbound input port.
    pub fn add_node(
        &mut self,
        name: &str,
        node: Box<dyn ProcessingNode>,
        inputs: &[PortSpec],
        outputs: &[PortSpec],
    ) -> Result<(), GraphError> {
        if self.indices.contains_key(name) {
            return Err(GraphError::DuplicateNode(name.to_string()));
        }
        if inputs.is_empty() {
            return Err(GraphError::PortArity(format!(
                "node '{name}' declares no input ports"
            )));
        }
        for ports in [inputs, outputs] {
            for (i, p) in ports.iter().enumerate() {
                if ports[..i].iter().any(|q| q.name == p.name) {
                    return Err(GraphError::PortArity(format!(
                        "node '{name}' declares port '{}' twice",
                        p.name
                    )));
                }
            }
        }
        let idx = self.dag.add_node(name.to_string());
        self.indices.insert(name.to_string(), idx);
        self.nodes.push(NodeSlot {
            name: name.to_string(),
            node,
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
        });
        Ok(())
    }

    /// Connects `source` (`node.port` of an output) to `sink` (`node.port`
    /// of an input) with a bounded channel. Fails with [`GraphError::Cycle`]
    /// if the edge would close a cycle and [`GraphError::PortArity`] if a
    /// port is unknown, already bound, or the declared widths disagree; in
    /// every failure case the graph is left unchanged.
    pub fn connect(
        &mut self,
        source: &str,
        sink: &str,
        capacity: usize,
        policy: OverflowPolicy,
    ) -> Result<(), GraphError> {
        let source = PortRef::parse(source)?;
        let sink = PortRef::parse(sink)?;

        let src_spec = self.port_spec(&source, false)?.clone();
        let dst_spec = self.port_spec(&sink, true)?.clone();

        if let Some(edge) = self
            .edges
            .iter()
            .find(|e| e.source == source || e.sink == sink)
        {
            return Err(GraphError::PortArity(format!(
                "port already bound by edge '{}'",
                edge.label()
            )));
        }
        if let (Some(a), Some(b)) = (src_spec.width, dst_spec.width) {
            if a != b {
                return Err(GraphError::PortArity(format!(
                    "channel width mismatch: '{}' is {a} wide, '{}' is {b} wide",
                    source.label(),
                    sink.label()
                )));
            }
        }

        let from = self.indices[&source.node];
        let to = self.indices[&sink.node];
        let edge_idx = self.dag.add_edge(from, to, ());
        if is_cyclic_directed(&self.dag) {
            self.dag.remove_edge(edge_idx);
            return Err(GraphError::Cycle {
                edge: format!("{}->{}", source.label(), sink.label()),
            });
        }

        self.edges.push(EdgeSpec {
            source,
            sink,
            capacity,
            policy,
        });
        Ok(())
    }

    /// Activates the graph: one execution context per node, channels wired,
    /// unbound ports exposed as injectors and taps.
    pub fn start(self) -> Result<PipelineRuntime, GraphError> {
        PipelineRuntime::start(self)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    fn port_spec(&self, port: &PortRef, input: bool) -> Result<&PortSpec, GraphError> {
        let slot = self
            .nodes
            .iter()
            .find(|s| s.name == port.node)
            .ok_or_else(|| GraphError::UnknownNode(port.node.clone()))?;
        let ports = if input { &slot.inputs } else { &slot.outputs };
        ports.iter().find(|p| p.name == port.port).ok_or_else(|| {
            GraphError::PortArity(format!(
                "node '{}' has no {} port '{}'",
                port.node,
                if input { "input" } else { "output" },
                port.port
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NodeError;
    use crate::node::Emit;
    use signal_types::SampleBlock;
    use std::sync::Arc;

    struct Passthrough;

    impl ProcessingNode for Passthrough {
        fn node_type(&self) -> &'static str {
            "passthrough"
        }

        fn on_block(&mut self, _port: &str, block: Arc<SampleBlock>) -> Result<Vec<Emit>, NodeError> {
            Ok(vec![("out".to_string(), block)])
        }
    }

    fn simple_node() -> Box<dyn ProcessingNode> {
        Box::new(Passthrough)
    }

    fn two_port_graph() -> PipelineGraph {
        let mut g = PipelineGraph::new();
        g.add_node("a", simple_node(), &["in".into()], &["out".into()])
            .unwrap();
        g.add_node("b", simple_node(), &["in".into()], &["out".into()])
            .unwrap();
        g
    }

    #[test]
    fn test_connect_rejects_cycle_and_leaves_graph_unchanged() {
        let mut g = two_port_graph();
        g.connect("a.out", "b.in", 4, OverflowPolicy::Block).unwrap();
        let before = g.edge_count();
        let err = g
            .connect("b.out", "a.in", 4, OverflowPolicy::Block)
            .unwrap_err();
        assert!(matches!(err, GraphError::Cycle { .. }));
        assert_eq!(g.edge_count(), before);
        // The rejected edge left the DAG intact: an unrelated edge still works.
        g.add_node("c", simple_node(), &["in".into()], &["out".into()])
            .unwrap();
        g.connect("b.out", "c.in", 4, OverflowPolicy::Block).unwrap();
    }

    #[test]
    fn test_connect_rejects_bound_port() {
        let mut g = two_port_graph();
        g.connect("a.out", "b.in", 4, OverflowPolicy::Block).unwrap();
        let err = g
            .connect("a.out", "b.in", 4, OverflowPolicy::Block)
            .unwrap_err();
        assert!(matches!(err, GraphError::PortArity(_)));
    }

    #[test]
    fn test_connect_rejects_width_mismatch() {
        let mut g = PipelineGraph::new();
        g.add_node(
            "a",
            simple_node(),
            &["in".into()],
            &[PortSpec::with_width("out", 8)],
        )
        .unwrap();
        g.add_node(
            "b",
            simple_node(),
            &[PortSpec::with_width("in", 4)],
            &["out".into()],
        )
        .unwrap();
        let err = g
            .connect("a.out", "b.in", 4, OverflowPolicy::Block)
            .unwrap_err();
        assert!(matches!(err, GraphError::PortArity(_)));
    }

    #[test]
    fn test_connect_rejects_unknown_port() {
        let mut g = two_port_graph();
        assert!(g.connect("a.nope", "b.in", 4, OverflowPolicy::Block).is_err());
        assert!(g.connect("z.out", "b.in", 4, OverflowPolicy::Block).is_err());
        assert!(g.connect("a.out", "bad-ref", 4, OverflowPolicy::Block).is_err());
    }

    #[test]
    fn test_add_node_rejects_duplicates_and_sourceless_nodes() {
        let mut g = two_port_graph();
        assert!(matches!(
            g.add_node("a", simple_node(), &["in".into()], &[]),
            Err(GraphError::DuplicateNode(_))
        ));
        assert!(matches!(
            g.add_node("d", simple_node(), &[], &["out".into()]),
            Err(GraphError::PortArity(_))
        ));
    }
}
