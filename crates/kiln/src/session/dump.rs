use std::fs;
use std::path::Path;

use anyhow::Context;
use serde_json::{json, Map, Value};

use crate::error::{Error, Result};
use crate::ir::graph::Graph;
use crate::ir::ids::TensorId;
use crate::ir::scheduler::RequireOptimal;
use crate::session::ir::Ir;

fn tensor_json(graph: &Graph, id: &TensorId) -> Value {
    match graph.tensor(id) {
        Ok(tensor) => json!({
            "name": id.as_str(),
            "type": tensor.info.dtype,
            "shape": tensor.info.shape,
            "tensor_type": tensor.tensor_type.to_string(),
        }),
        Err(_) => json!({ "name": id.as_str() }),
    }
}

impl Ir {
    /// Every graph's ops in schedule order, as pretty-printed JSON.
    pub fn serialise_json(&self) -> Result<String> {
        let mut graphs = Map::new();
        for graph in self.graphs() {
            let schedule = self.graph_op_schedule(graph.id(), RequireOptimal::No)?;
            let mut ops = Vec::with_capacity(schedule.len());
            for op_id in schedule {
                let op = graph.op(op_id)?;
                let inputs: Vec<Value> = op
                    .input
                    .iter()
                    .map(|(_, tensor)| tensor_json(graph, tensor))
                    .collect();
                let outputs: Vec<Value> = op
                    .output
                    .iter()
                    .map(|(_, tensor)| tensor_json(graph, tensor))
                    .collect();
                ops.push(json!({
                    "type": op.opid.op_type,
                    "domain": op.opid.domain,
                    "version": op.opid.version,
                    "name": op.settings.name,
                    "inputs": inputs,
                    "outputs": outputs,
                    "attributes": op.attrs,
                    "vgraph_id": op.settings.vgraph_id,
                    "pipeline_stage": op.settings.pipeline_stage,
                    "execution_phase": op.settings.execution_phase,
                }));
            }
            graphs.insert(graph.id().to_string(), Value::Array(ops));
        }
        serde_json::to_string_pretty(&Value::Object(graphs))
            .map_err(|err| Error::internal(format!("failed to serialise IR: {err}")))
    }

    /// Writes [`Ir::serialise_json`] to `path`.
    pub fn dump_to(&self, path: &Path) -> anyhow::Result<()> {
        let json = self.serialise_json()?;
        fs::write(path, json).with_context(|| format!("writing IR dump to {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::ir::ids::{GraphId, TensorId};
    use crate::ir::op::{Attributes, Settings};
    use crate::ir::tensor_info::{DataType, TensorInfo};
    use crate::model::Model;
    use crate::ops::opids;
    use crate::session::{Ir, IrBundle};

    #[test]
    fn json_lists_ops_in_schedule_order() {
        let mut ir = Ir::new(IrBundle::new(Model::default()));
        let main = ir.main_graph_mut().unwrap();
        main.tensors_mut()
            .add_stream(TensorId::from("x"), TensorInfo::new(DataType::Float, vec![2]))
            .unwrap();
        for (name, input, output) in [("first", "x", "y"), ("second", "y", "z")] {
            main.create_connected_op(
                &opids::relu(),
                Settings::new(GraphId::main(), name),
                Attributes::new(),
                &[(0, TensorId::from(input))],
                &[(0, TensorId::from(output))],
            )
            .unwrap();
        }
        let value: serde_json::Value = serde_json::from_str(&ir.serialise_json().unwrap()).unwrap();
        let ops = value["main"].as_array().unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0]["name"], "first");
        assert_eq!(ops[1]["inputs"][0]["name"], "y");
        assert_eq!(ops[1]["outputs"][0]["shape"], serde_json::json!([2]));
    }
}
