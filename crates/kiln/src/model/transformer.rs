use std::collections::BTreeSet;

use tracing::debug;

use crate::error::Result;
use crate::model::format::{AttributeValue, GraphDef, Model};

/// Model-to-model rewrites applied before a model is prepared.
#[derive(Debug, Clone)]
pub struct GraphTransformer {
    model: Model,
}

/// Names read by any node of `graph` or of a graph nested in its attributes.
fn consumed_names(graph: &GraphDef, names: &mut BTreeSet<String>) {
    for node in &graph.nodes {
        names.extend(node.inputs.iter().filter(|name| !name.is_empty()).cloned());
        for value in node.attributes.values() {
            if let AttributeValue::Graph(body) = value {
                consumed_names(body, names);
            }
        }
    }
}

impl GraphTransformer {
    pub fn new(model: Model) -> Self {
        Self { model }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(Self::new(Model::from_json(json)?))
    }

    /// Drops graph inputs and initializers that no node reads and that are
    /// not graph outputs. Returns the number of names removed.
    pub fn remove_unused_inputs(&mut self) -> usize {
        let graph = &mut self.model.graph;
        let mut used = BTreeSet::new();
        consumed_names(graph, &mut used);
        used.extend(graph.outputs.iter().map(|output| output.name.clone()));

        let mut removed: BTreeSet<String> = BTreeSet::new();
        removed.extend(
            graph
                .inputs
                .iter()
                .map(|input| input.name.clone())
                .chain(graph.initializers.iter().map(|init| init.name.clone()))
                .filter(|name| !used.contains(name)),
        );
        graph.inputs.retain(|input| used.contains(&input.name));
        graph.initializers.retain(|init| used.contains(&init.name));
        debug!(
            target: "kiln::ir",
            removed = removed.len(),
            inputs = graph.inputs.len(),
            initializers = graph.initializers.len(),
            "removed unused model inputs"
        );
        removed.len()
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn into_model(self) -> Model {
        self.model
    }

    pub fn to_json(&self) -> Result<String> {
        self.model.to_json()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::tensor_info::{DataType, TensorInfo};
    use crate::model::builder::ModelBuilder;

    #[test]
    fn nested_graph_reads_keep_their_inputs() {
        let mut body = ModelBuilder::new();
        let bx = body.add_input("x", TensorInfo::new(DataType::Float, vec![1]));
        let by = body.node("Add", &[bx.as_str(), "w"]);
        body.add_output(&by);
        let body = body.build_graph("body");

        let mut builder = ModelBuilder::new();
        let x = builder.add_input("x", TensorInfo::new(DataType::Float, vec![1]));
        builder.add_initializer("w", TensorInfo::new(DataType::Float, vec![1]), vec![1.0]);
        builder.add_initializer("unused", TensorInfo::new(DataType::Float, vec![1]), vec![1.0]);
        let y = builder.call(&body, &[&x]);
        builder.add_output(&y[0]);

        let mut transformer = GraphTransformer::new(builder.build());
        assert_eq!(transformer.remove_unused_inputs(), 1);
        let names: Vec<&str> = transformer
            .model()
            .graph
            .inputs
            .iter()
            .map(|input| input.name.as_str())
            .collect();
        assert_eq!(names, vec!["x", "w"]);
    }
}
