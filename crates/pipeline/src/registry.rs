//! Factory registry for creating node instances from configuration.

use std::collections::HashMap;

use crate::error::{GraphError, NodeError};
use crate::node::{NodeParams, ProcessingNode};

/// A factory producing a configured node from a parameter snapshot.
pub type NodeFactory =
    Box<dyn Fn(&NodeParams) -> Result<Box<dyn ProcessingNode>, NodeError> + Send + Sync>;

/// Registry of node factories keyed by node-type string.
#[derive(Default)]
pub struct NodeRegistry {
    factories: HashMap<String, NodeFactory>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory for a node type.
    pub fn register<F>(&mut self, node_type: &str, factory: F)
    where
        F: Fn(&NodeParams) -> Result<Box<dyn ProcessingNode>, NodeError> + Send + Sync + 'static,
    {
        self.factories.insert(node_type.to_string(), Box::new(factory));
    }

    /// Creates and configures a node of the given type.
    pub fn create(
        &self,
        node_type: &str,
        params: &NodeParams,
    ) -> Result<Box<dyn ProcessingNode>, GraphError> {
        let factory = self
            .factories
            .get(node_type)
            .ok_or_else(|| GraphError::UnknownNodeType(node_type.to_string()))?;
        Ok(factory(params)?)
    }

    pub fn node_types(&self) -> Vec<&str> {
        self.factories.keys().map(|s| s.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Emit;
    use signal_types::SampleBlock;
    use std::sync::Arc;

    struct Null;

    impl ProcessingNode for Null {
        fn node_type(&self) -> &'static str {
            "null"
        }

        fn on_block(
            &mut self,
            _port: &str,
            _block: Arc<SampleBlock>,
        ) -> Result<Vec<Emit>, NodeError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_registry_create() {
        let mut registry = NodeRegistry::new();
        registry.register("null", |params| {
            let mut node = Box::new(Null);
            node.configure(params)?;
            Ok(node as Box<dyn ProcessingNode>)
        });
        assert!(registry.create("null", &NodeParams::new()).is_ok());
        assert!(matches!(
            registry.create("missing", &NodeParams::new()),
            Err(GraphError::UnknownNodeType(_))
        ));
    }
}
