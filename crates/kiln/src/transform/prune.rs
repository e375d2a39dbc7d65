use std::collections::{BTreeSet, VecDeque};

use tracing::debug;

use crate::error::Result;
use crate::ir::graph::Graph;
use crate::ir::ids::{GraphId, OpId, TensorId};
use crate::ir::tensor::TensorType;
use crate::session::Ir;
use crate::transform::{PassResult, Transform};

/// Erases ops with no path to a graph output, an anchor, the loss or a side effect.
#[derive(Debug, Clone, Copy, Default)]
pub struct Prune;

impl Prune {
    pub const NAME: &'static str = "Prune";
}

impl Transform for Prune {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn apply(&self, ir: &mut Ir, graph: &GraphId) -> Result<PassResult> {
        let protected = ir.protected_tensors();
        let graph = ir.graph_mut(graph)?;
        let erased = prune_graph(graph, &protected)?;
        Ok(PassResult {
            changed: erased > 0,
            iterations: 1,
            rewrites_applied: 0,
            erased_ops: erased,
        })
    }
}

/// Ops that must stay: producers (transitively) of required tensors, ops with
/// side effects, and ops writing into a tensor a live op reads.
fn live_ops(graph: &Graph, protected: &BTreeSet<TensorId>) -> Result<BTreeSet<OpId>> {
    let mut live = BTreeSet::new();
    let mut required: BTreeSet<TensorId> = BTreeSet::new();
    let mut work: VecDeque<OpId> = VecDeque::new();

    let mut front: Vec<TensorId> = graph.outputs().to_vec();
    front.extend(
        protected
            .iter()
            .filter(|id| graph.tensors().contains(id))
            .cloned(),
    );
    if let Some(loss) = graph.loss() {
        front.push(loss.clone());
    }
    for tensor in front {
        if required.insert(tensor.clone()) {
            if let Some(producer) = graph.tensor(&tensor)?.producer() {
                work.push_back(producer);
            }
        }
    }
    for op in graph.ops() {
        if op.has_side_effect() {
            work.push_back(op.id);
        }
    }

    while let Some(op_id) = work.pop_front() {
        if !live.insert(op_id) {
            continue;
        }
        let op = graph.op(op_id)?;
        for tensor in op.input.unique_tensors() {
            if !required.insert(tensor.clone()) {
                continue;
            }
            let node = graph.tensor(&tensor)?;
            if let Some(producer) = node.producer() {
                work.push_back(producer);
            }
            for consumer in node.consumers.ops() {
                let reader = graph.op(consumer)?;
                let writes = reader
                    .input
                    .indices(&tensor)
                    .iter()
                    .any(|index| reader.modifies(*index));
                if writes {
                    work.push_back(consumer);
                }
            }
        }
    }
    Ok(live)
}

pub(crate) fn prune_graph(graph: &mut Graph, protected: &BTreeSet<TensorId>) -> Result<usize> {
    let live = live_ops(graph, protected)?;
    let dead: Vec<OpId> = graph
        .op_ids()
        .into_iter()
        .filter(|id| !live.contains(id))
        .collect();
    for op_id in &dead {
        let outputs = graph.op(*op_id)?.output.tensors();
        let op = graph.erase_op(*op_id)?;
        debug!(target: "kiln::transform", op = %op.debug_name(), "pruned");
        for output in outputs {
            let tensor = graph.tensor(&output)?;
            let keep = protected.contains(&output)
                || graph.is_output(&output)
                || tensor.tensor_type != TensorType::ActGrad;
            if tensor.is_isolated() && !keep {
                graph.tensors_mut().remove(&output)?;
            }
        }
    }
    Ok(dead.len())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    use super::*;
    use crate::ir::op::{Attributes, Settings};
    use crate::ir::tensor_info::{DataType, TensorInfo};
    use crate::ops::{default_registry, opids};

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
    fn dead_branch_is_removed_and_anchors_survive() {
        let mut g = Graph::new(GraphId::main(), default_registry(), Arc::new(AtomicU64::new(0)));
        g.tensors_mut()
            .add_stream(TensorId::from("x"), TensorInfo::new(DataType::Float, vec![4]))
            .unwrap();
        let live = relu(&mut g, "x", "y");
        let dead = relu(&mut g, "x", "unused");
        let anchored = relu(&mut g, "x", "a");
        g.mark_as_output(&TensorId::from("y")).unwrap();

        let protected: BTreeSet<TensorId> = [TensorId::from("a")].into_iter().collect();
        let erased = prune_graph(&mut g, &protected).unwrap();

        assert_eq!(erased, 1);
        assert!(g.contains_op(live));
        assert!(g.contains_op(anchored));
        assert!(!g.contains_op(dead));
        assert!(!g.tensors().contains(&TensorId::from("unused")));
    }
}
