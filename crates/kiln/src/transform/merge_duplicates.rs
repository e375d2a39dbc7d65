use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::error::{Error, Result};
use crate::ir::graph::Graph;
use crate::ir::ids::{GraphId, OpId, TensorId};
use crate::ir::op::Op;
use crate::ir::scheduler::{OpsBeforeKey, RequireOptimal};
use crate::ir::tensor::TensorType;
use crate::session::Ir;
use crate::transform::{PassResult, Transform};

/// Replaces ops that compute exactly what an earlier op computes by that op.
///
/// Two ops are duplicates when kind, attributes, inputs (by index) and
/// placement all match.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeDuplicateOps;

impl MergeDuplicateOps {
    pub const NAME: &'static str = "MergeDuplicateOps";
}

impl Transform for MergeDuplicateOps {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn apply(&self, ir: &mut Ir, graph: &GraphId) -> Result<PassResult> {
        let protected = ir.protected_tensors();
        let graph = ir.graph_mut(graph)?;
        let merged = merge_duplicates(graph, &protected)?;
        Ok(PassResult {
            changed: merged > 0,
            iterations: 1,
            rewrites_applied: merged,
            erased_ops: merged,
        })
    }
}

fn is_candidate(graph: &Graph, op: &Op, protected: &BTreeSet<TensorId>) -> bool {
    !op.has_side_effect()
        && !op.modifies_any()
        && !op.flags().subgraph
        && !graph.topo_cons().has_constraints(op.id)
        && op
            .output
            .iter()
            .all(|(_, tensor)| !protected.contains(tensor) && !graph.is_output(tensor))
}

fn equivalence_key(op: &Op) -> Result<Vec<u8>> {
    let inputs: Vec<(usize, &str)> = op
        .input
        .iter()
        .map(|(index, tensor)| (index, tensor.as_str()))
        .collect();
    let outputs: Vec<usize> = op.output.iter().map(|(index, _)| index).collect();
    let attrs = serde_json::to_string(&op.attrs)
        .map_err(|err| Error::internal(format!("encoding attributes of {}: {err}", op.id)))?;
    bincode::serialize(&(&op.opid, attrs, inputs, outputs, op.placement()))
        .map_err(|err| Error::internal(format!("encoding key of {}: {err}", op.id)))
}

pub(crate) fn merge_duplicates(graph: &mut Graph, protected: &BTreeSet<TensorId>) -> Result<usize> {
    let schedule = graph.op_schedule(&OpsBeforeKey::new(), RequireOptimal::No)?;
    let mut seen: HashMap<Vec<u8>, OpId> = HashMap::new();
    let mut merged = 0;
    for op_id in schedule {
        let op = graph.op(op_id)?;
        if !is_candidate(graph, op, protected) {
            continue;
        }
        let key = equivalence_key(op)?;
        let Some(&keep) = seen.get(&key) else {
            seen.insert(key, op_id);
            continue;
        };
        let pairs: Vec<(TensorId, TensorId)> = op
            .output
            .iter()
            .map(|(index, tensor)| {
                graph
                    .op(keep)?
                    .out_id(index)
                    .map(|kept| (tensor.clone(), kept.clone()))
            })
            .collect::<Result<_>>()?;
        let name = op.debug_name();
        graph.erase_op(op_id)?;
        for (dup, kept) in pairs {
            graph.replace_all_uses(&dup, &kept)?;
            if graph.tensor(&dup)?.tensor_type == TensorType::ActGrad {
                graph.tensors_mut().remove(&dup)?;
            }
        }
        debug!(target: "kiln::transform", op = %name, kept = %keep, "merged duplicate");
        merged += 1;
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    use super::*;
    use crate::ir::op::{Attributes, Settings};
    use crate::ir::tensor_info::{DataType, TensorInfo};
    use crate::ops::{default_registry, opids, types};

    fn relu(g: &mut Graph, input: &str, output: &str) -> OpId {
        g.create_connected_op(
            &opids::relu(),
            Settings::new(GraphId::main(), output),
            Attributes::new(),
            &[(0, TensorId::from(input))],
            &[(0, TensorId::from(output))],
        )
        .unwrap()
    }

    #[test]
    fn identical_relus_collapse_to_one() {
        let mut g = Graph::new(GraphId::main(), default_registry(), Arc::new(AtomicU64::new(0)));
        g.tensors_mut()
            .add_stream(TensorId::from("x"), TensorInfo::new(DataType::Float, vec![4]))
            .unwrap();
        relu(&mut g, "x", "r0");
        relu(&mut g, "x", "r1");
        relu(&mut g, "x", "r2");
        g.create_connected_op(
            &opids::sum(),
            Settings::new(GraphId::main(), "sum"),
            Attributes::new(),
            &[
                (0, TensorId::from("r0")),
                (1, TensorId::from("r1")),
                (2, TensorId::from("r2")),
            ],
            &[(0, TensorId::from("y"))],
        )
        .unwrap();
        g.mark_as_output(&TensorId::from("y")).unwrap();

        assert_eq!(merge_duplicates(&mut g, &BTreeSet::new()).unwrap(), 2);
        let relus: Vec<&Op> = g.ops().filter(|op| op.is(types::RELU)).collect();
        assert_eq!(relus.len(), 1);
        let kept = relus[0].out_id(0).unwrap().clone();
        assert_eq!(g.tensor(&kept).unwrap().consumers.total(), 3);
    }

    #[test]
    fn differing_placement_is_not_merged() {
        let mut g = Graph::new(GraphId::main(), default_registry(), Arc::new(AtomicU64::new(0)));
        g.tensors_mut()
            .add_stream(TensorId::from("x"), TensorInfo::new(DataType::Float, vec![4]))
            .unwrap();
        relu(&mut g, "x", "r0");
        let second = relu(&mut g, "x", "r1");
        g.op_mut(second).unwrap().settings.vgraph_id = Some(1);
        assert_eq!(merge_duplicates(&mut g, &BTreeSet::new()).unwrap(), 0);
    }
}
