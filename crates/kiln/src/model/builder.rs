use std::collections::BTreeMap;

use crate::ir::op::KILN_DOMAIN;
use crate::ir::tensor_info::TensorInfo;
use crate::model::format::{AttributeValue, GraphDef, Initializer, Model, NodeDef, ValueInfo};

/// Incremental construction of a [`Model`].
///
/// Node outputs are named `<op type>_<n>` with `n` counting up from zero.
#[derive(Debug, Clone, Default)]
pub struct ModelBuilder {
    graph: GraphDef,
    opsets: BTreeMap<String, u32>,
    metadata: BTreeMap<String, String>,
    next_id: usize,
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn opset(&mut self, domain: &str, version: u32) -> &mut Self {
        self.opsets.insert(domain.to_string(), version);
        self
    }

    pub fn metadata(&mut self, key: &str, value: &str) -> &mut Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub fn add_input(&mut self, name: &str, info: TensorInfo) -> String {
        self.graph.inputs.push(ValueInfo::typed(name, &info));
        name.to_string()
    }

    /// Input whose shape must be supplied when the model is prepared.
    pub fn add_untyped_input(&mut self, name: &str) -> String {
        self.graph.inputs.push(ValueInfo::named(name));
        name.to_string()
    }

    /// Initializer, also listed among the graph inputs.
    pub fn add_initializer(&mut self, name: &str, info: TensorInfo, data: Vec<f64>) -> String {
        self.graph.inputs.push(ValueInfo::typed(name, &info));
        self.graph.initializers.push(Initializer {
            name: name.to_string(),
            dtype: info.dtype,
            shape: info.shape,
            data,
        });
        name.to_string()
    }

    pub fn add_output(&mut self, name: &str) -> &mut Self {
        self.graph.outputs.push(ValueInfo::named(name));
        self
    }

    fn fresh_name(&mut self, op_type: &str) -> String {
        let name = format!("{}_{}", op_type.to_ascii_lowercase(), self.next_id);
        self.next_id += 1;
        name
    }

    /// Single-output node of the default domain.
    pub fn node(&mut self, op_type: &str, inputs: &[impl AsRef<str>]) -> String {
        self.node_with(op_type, "", inputs, BTreeMap::new())
    }

    pub fn node_with(
        &mut self,
        op_type: &str,
        domain: &str,
        inputs: &[impl AsRef<str>],
        attributes: BTreeMap<String, AttributeValue>,
    ) -> String {
        self.node_multi(op_type, domain, inputs, attributes, 1)
            .pop()
            .unwrap_or_default()
    }

    pub fn node_multi(
        &mut self,
        op_type: &str,
        domain: &str,
        inputs: &[impl AsRef<str>],
        attributes: BTreeMap<String, AttributeValue>,
        n_outputs: usize,
    ) -> Vec<String> {
        let outputs: Vec<String> = (0..n_outputs).map(|_| self.fresh_name(op_type)).collect();
        self.graph.nodes.push(NodeDef {
            name: outputs.first().cloned().unwrap_or_default(),
            op_type: op_type.to_string(),
            domain: domain.to_string(),
            inputs: inputs.iter().map(|input| input.as_ref().to_string()).collect(),
            outputs: outputs.clone(),
            attributes,
        });
        outputs
    }

    /// `Call` of `body`, one output per output of the body.
    pub fn call(&mut self, body: &GraphDef, inputs: &[impl AsRef<str>]) -> Vec<String> {
        let mut attributes = BTreeMap::new();
        attributes.insert("callee".to_string(), AttributeValue::Graph(body.clone()));
        self.node_multi("Call", KILN_DOMAIN, inputs, attributes, body.outputs.len())
    }

    /// Sets an attribute on the node producing `output`. Unknown outputs are ignored.
    pub fn annotate(&mut self, output: &str, name: &str, value: AttributeValue) -> &mut Self {
        if let Some(node) = self
            .graph
            .nodes
            .iter_mut()
            .find(|node| node.outputs.iter().any(|out| out == output))
        {
            node.attributes.insert(name.to_string(), value);
        }
        self
    }

    /// The graph alone, for use as a subgraph body.
    pub fn build_graph(self, name: &str) -> GraphDef {
        GraphDef {
            name: name.to_string(),
            ..self.graph
        }
    }

    pub fn build(self) -> Model {
        Model {
            graph: self.graph,
            opsets: self.opsets,
            metadata: self.metadata,
        }
    }
}
