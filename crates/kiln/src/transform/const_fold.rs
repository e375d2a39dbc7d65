use std::collections::BTreeSet;

use tracing::debug;

use crate::error::Result;
use crate::ir::graph::Graph;
use crate::ir::ids::{GraphId, OpId, TensorId};
use crate::ir::scheduler::{OpsBeforeKey, RequireOptimal};
use crate::ir::tensor::TensorType;
use crate::ops::ConstValue;
use crate::session::Ir;
use crate::transform::{PassResult, Transform};

/// Evaluates ops whose inputs are all constants and replaces their output by
/// a `Const` tensor of the same id.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConstExprFolding;

impl ConstExprFolding {
    pub const NAME: &'static str = "ConstExprFolding";
}

impl Transform for ConstExprFolding {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn apply(&self, ir: &mut Ir, graph: &GraphId) -> Result<PassResult> {
        let anchors = ir.anchors();
        let graph = ir.graph_mut(graph)?;
        let mut result = PassResult {
            iterations: 1,
            ..PassResult::default()
        };
        let schedule = graph.op_schedule(&OpsBeforeKey::new(), RequireOptimal::No)?;
        for op_id in schedule {
            if fold_op(graph, op_id, &anchors)? {
                result.changed = true;
                result.rewrites_applied += 1;
                result.erased_ops += 1;
            }
        }
        Ok(result)
    }
}

/// Whether every input of `op` is a `Const` carrying data.
pub(crate) fn has_only_const_inputs(graph: &Graph, op: OpId) -> Result<bool> {
    let node = graph.op(op)?;
    if node.input.is_empty() {
        return Ok(false);
    }
    for tensor in node.input.unique_tensors() {
        let tensor = graph.tensor(&tensor)?;
        if !tensor.is_const() || tensor.data.is_none() {
            return Ok(false);
        }
    }
    Ok(true)
}

fn fold_op(graph: &mut Graph, op_id: OpId, anchors: &BTreeSet<TensorId>) -> Result<bool> {
    if !graph.contains_op(op_id) || !has_only_const_inputs(graph, op_id)? {
        return Ok(false);
    }
    let op = graph.op(op_id)?;
    if op.has_side_effect() || op.modifies_any() || op.output.n() != 1 {
        return Ok(false);
    }
    let out = op.out_id(0)?.clone();
    if anchors.contains(&out) {
        return Ok(false);
    }

    let inputs = op.input.tensors();
    let mut values = Vec::with_capacity(inputs.len());
    for id in &inputs {
        let tensor = graph.tensor(id)?;
        let Some(data) = tensor.data.as_deref() else {
            return Ok(false);
        };
        values.push(ConstValue {
            info: &tensor.info,
            data,
        });
    }
    let Some(folded) = op.def().const_fold(op, &values)? else {
        return Ok(false);
    };

    let name = op.debug_name();
    graph.erase_op(op_id)?;
    graph.tensors_mut().make_const(&out, folded)?;
    for input in inputs {
        if !graph.tensors().contains(&input) || graph.is_input(&input) {
            continue;
        }
        let tensor = graph.tensor(&input)?;
        if tensor.is_isolated() && tensor.tensor_type == TensorType::Const {
            graph.tensors_mut().remove(&input)?;
        }
    }
    debug!(target: "kiln::transform", op = %name, tensor = %out, "folded");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    use super::*;
    use crate::ir::op::{Attribute, Attributes, Settings};
    use crate::ir::tensor_info::{DataType, TensorInfo};
    use crate::ops::{default_registry, opids};

    #[test]
    fn chain_of_constants_collapses() {
        let mut g = Graph::new(GraphId::main(), default_registry(), Arc::new(AtomicU64::new(0)));
        let info = TensorInfo::new(DataType::Float, vec![2]);
        g.tensors_mut()
            .add_const_init(TensorId::from("c0"), info.clone(), vec![1.0, -2.0])
            .unwrap();
        g.tensors_mut()
            .add_const_init(TensorId::from("c1"), info.clone(), vec![3.0, 4.0])
            .unwrap();
        g.tensors_mut()
            .add_stream(TensorId::from("x"), info)
            .unwrap();
        g.create_connected_op(
            &opids::add(),
            Settings::new(GraphId::main(), "add"),
            Attributes::new(),
            &[(0, TensorId::from("c0")), (1, TensorId::from("c1"))],
            &[(0, TensorId::from("s"))],
        )
        .unwrap();
        let mut attrs = Attributes::new();
        attrs.insert("scale".to_string(), Attribute::Float(2.0));
        g.create_connected_op(
            &opids::scale(),
            Settings::new(GraphId::main(), "scale"),
            attrs,
            &[(0, TensorId::from("s"))],
            &[(0, TensorId::from("t"))],
        )
        .unwrap();
        let mul = g
            .create_connected_op(
                &opids::mul(),
                Settings::new(GraphId::main(), "mul"),
                Attributes::new(),
                &[(0, TensorId::from("t")), (1, TensorId::from("x"))],
                &[(0, TensorId::from("y"))],
            )
            .unwrap();

        let schedule = g.op_schedule(&OpsBeforeKey::new(), RequireOptimal::No).unwrap();
        let folded = schedule
            .into_iter()
            .filter(|op| fold_op(&mut g, *op, &BTreeSet::new()).unwrap())
            .count();

        assert_eq!(folded, 2);
        assert_eq!(g.op_ids(), vec![mul]);
        let t = g.tensor(&TensorId::from("t")).unwrap();
        assert_eq!(t.tensor_type, TensorType::Const);
        assert_eq!(t.data.as_deref(), Some(&[8.0, 4.0][..]));
        assert!(!g.tensors().contains(&TensorId::from("c0")));
        assert!(!g.tensors().contains(&TensorId::from("s")));
    }
}
