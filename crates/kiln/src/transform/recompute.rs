use std::collections::BTreeMap;

use tracing::debug;

use crate::error::Result;
use crate::ir::graph::Graph;
use crate::ir::ids::{reserved, GraphId, OpId, TensorId};
use crate::ir::op::{Op, RecomputeType};
use crate::ir::scheduler::{OpsBeforeKey, RequireOptimal};
use crate::ir::tensor::{LossPath, Vertex};
use crate::session::{Ir, RecomputationType};
use crate::transform::{PassResult, Transform};

/// Forward ops: not part of the backward pass or the optimizer step.
fn is_forward(op: &Op) -> bool {
    let flags = op.flags();
    op.vertex().scheduled_pre_loss != LossPath::No
        && !flags.gradient
        && !flags.var_update
        && op.settings.recompute_type != RecomputeType::Recomputed
}

fn forward_schedule(graph: &Graph) -> Result<Vec<OpId>> {
    let schedule = graph.op_schedule(&OpsBeforeKey::new(), RequireOptimal::No)?;
    let mut forward = Vec::with_capacity(schedule.len());
    for id in schedule {
        if is_forward(graph.op(id)?) {
            forward.push(id);
        }
    }
    Ok(forward)
}

/// Marks forward ops as checkpointed or recomputed according to `mode`.
///
/// Ops the user already annotated keep their annotation. Returns the number
/// of ops marked for recomputation.
pub fn auto_annotate(graph: &mut Graph, mode: RecomputationType) -> Result<usize> {
    let forward: Vec<OpId> = forward_schedule(graph)?
        .into_iter()
        .filter(|id| {
            graph
                .op(*id)
                .map(|op| !op.flags().loss && !op.has_side_effect())
                .unwrap_or(false)
        })
        .collect();

    let mut marked = 0;
    let stride = (forward.len() as f64).sqrt().ceil().max(1.0) as usize;
    for (position, op_id) in forward.iter().enumerate() {
        let op = graph.op_mut(*op_id)?;
        if op.settings.recompute_type != RecomputeType::Undefined {
            continue;
        }
        let recompute = match mode {
            RecomputationType::None | RecomputationType::Pipeline => continue,
            RecomputationType::Standard => {
                let checkpoint = position % stride == stride - 1 || position + 1 == forward.len();
                !checkpoint
            }
            RecomputationType::NormOnly => op.flags().norm,
            RecomputationType::RecomputeAll => true,
        };
        op.settings.recompute_type = if recompute {
            marked += 1;
            RecomputeType::Recompute
        } else {
            RecomputeType::Checkpoint
        };
    }
    debug!(target: "kiln::transform", graph = %graph.id(), ?mode, marked, "annotated recomputation");
    Ok(marked)
}

/// Clones every op marked `Recompute` so that backward consumers read the
/// recomputed value instead of a stashed activation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExplicitRecompute;

impl ExplicitRecompute {
    pub const NAME: &'static str = "ExplicitRecompute";
}

impl Transform for ExplicitRecompute {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn apply(&self, ir: &mut Ir, graph: &GraphId) -> Result<PassResult> {
        let graph = ir.graph_mut(graph)?;
        let cloned = clone_for_backward(graph)?;
        Ok(PassResult {
            changed: cloned > 0,
            iterations: 1,
            rewrites_applied: cloned,
            erased_ops: 0,
        })
    }
}

fn recompute_id(tensor: &TensorId) -> TensorId {
    TensorId::new(format!("{}{tensor}", reserved::RECOMPUTE))
}

fn clone_for_backward(graph: &mut Graph) -> Result<usize> {
    let originals: Vec<OpId> = forward_schedule(graph)?
        .into_iter()
        .filter(|id| {
            graph
                .op(*id)
                .map(|op| op.settings.recompute_type == RecomputeType::Recompute)
                .unwrap_or(false)
        })
        .collect();
    if originals.is_empty() {
        return Ok(0);
    }
    let loss_producer = match graph.loss() {
        Some(loss) => graph.tensors().get(loss).ok().and_then(|t| t.producer()),
        None => None,
    };

    let mut remap: BTreeMap<TensorId, TensorId> = BTreeMap::new();
    let mut clones = Vec::with_capacity(originals.len());
    for original in &originals {
        let op = graph.op(*original)?.clone();
        let mut settings = op.settings.derived(format!("{}_recomp", op.settings.name));
        settings.recompute_type = RecomputeType::Recomputed;
        let clone = graph.create_op(&op.opid, settings, op.attrs.clone())?;
        for (index, tensor) in op.input.iter() {
            let source = remap.get(tensor).unwrap_or(tensor).clone();
            graph.connect_in(clone, index, &source)?;
        }
        for (index, tensor) in op.output.iter() {
            let recomputed = recompute_id(tensor);
            graph.create_and_connect_out(clone, index, recomputed.clone())?;
            remap.insert(tensor.clone(), recomputed);
        }
        graph.setup_op(clone)?;
        graph.op_mut(clone)?.vertex_mut().scheduled_pre_loss = LossPath::No;
        if let Some(loss_producer) = loss_producer {
            graph.topo_cons_mut().insert(loss_producer, clone, false)?;
        }
        graph.op_mut(*original)?.settings.recompute_type = RecomputeType::Checkpoint;
        clones.push(clone);
    }

    for (original, recomputed) in &remap {
        for consumer in graph.consumers(original)? {
            let op = graph.op(consumer)?;
            if op.vertex().scheduled_pre_loss != LossPath::No
                || op.settings.recompute_type == RecomputeType::Recomputed
            {
                continue;
            }
            let indices = op.input.indices(original).to_vec();
            for index in indices {
                graph.disconnect_in(consumer, index)?;
                graph.connect_in(consumer, index, recomputed)?;
            }
        }
    }
    debug!(target: "kiln::transform", graph = %graph.id(), cloned = clones.len(), "explicit recomputation");
    Ok(clones.len())
}
