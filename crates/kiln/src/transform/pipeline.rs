use tracing::debug;

use crate::error::Result;
use crate::ir::graph::Graph;
use crate::ir::ids::{reserved, GraphId, OpId, PipelineStage, TensorId};
use crate::ir::op::{Attribute, Attributes, Op, RecomputeType, Settings};
use crate::ir::tensor::{LossPath, TensorType, Vertex};
use crate::ops::{opids, types, RestoreInplace};
use crate::session::Ir;
use crate::transform::{PassResult, Transform};

/// Stashes forward tensors that the backward pass of the same pipeline stage
/// reads again, and restores them in place right before that pass.
///
/// With several batches in flight a stage runs the forward pass of later
/// batches before the backward pass of earlier ones, so the value read by the
/// backward pass must be kept aside in a ring buffer.
#[derive(Debug, Clone, Copy, Default)]
pub struct Pipeline;

impl Pipeline {
    pub const NAME: &'static str = "Pipeline";
}

impl Transform for Pipeline {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn apply(&self, ir: &mut Ir, graph: &GraphId) -> Result<PassResult> {
        let graph = ir.graph_mut(graph)?;
        let stashed = stash_and_restore(graph)?;
        Ok(PassResult {
            changed: stashed > 0,
            iterations: 1,
            rewrites_applied: stashed,
            erased_ops: 0,
        })
    }
}

fn stash_id(tensor: &TensorId) -> TensorId {
    TensorId::new(format!("{}{tensor}", reserved::STASH))
}

fn restored_id(tensor: &TensorId) -> TensorId {
    TensorId::new(format!("{}{tensor}", reserved::RESTORED))
}

/// Entries a stage's stash needs: one per batch between its forward and its
/// backward pass.
fn stash_size(stage: PipelineStage, num_stages: PipelineStage) -> i64 {
    (2 * (num_stages - stage) - 1).max(1)
}

struct ToStash {
    tensor: TensorId,
    stage: PipelineStage,
    /// Backward readers on the same stage.
    readers: Vec<OpId>,
    /// Settings of the forward op the stash is placed next to.
    forward: Settings,
}

fn is_backward(op: &Op) -> bool {
    op.vertex().scheduled_pre_loss == LossPath::No
}

fn candidates(graph: &Graph) -> Result<Vec<ToStash>> {
    let mut found = Vec::new();
    for tensor in graph.tensors().iter() {
        if !matches!(tensor.tensor_type, TensorType::ActGrad | TensorType::Stream)
            || tensor.vertex().scheduled_pre_loss != LossPath::Yes
        {
            continue;
        }
        let producer = match tensor.producer() {
            Some(id) => Some(graph.op(id)?),
            None => None,
        };
        if let Some(producer) = producer {
            let flags = producer.flags();
            if flags.restore_inplace
                || flags.ipu_copy
                || producer.settings.recompute_type == RecomputeType::Recompute
            {
                continue;
            }
        }

        let mut forward_readers = Vec::new();
        let mut backward_readers = Vec::new();
        for consumer in tensor.consumers.ops() {
            let op = graph.op(consumer)?;
            if op.is(types::STASH) {
                forward_readers.clear();
                backward_readers.clear();
                break;
            }
            if op.is_ipu_copy() {
                continue;
            }
            if is_backward(op) {
                backward_readers.push(op);
            } else {
                forward_readers.push(op);
            }
        }

        let forward = match producer.or_else(|| forward_readers.first().copied()) {
            Some(op) => op,
            None => continue,
        };
        let Some(stage) = forward.settings.pipeline_stage else {
            continue;
        };
        let readers: Vec<OpId> = backward_readers
            .iter()
            .filter(|op| op.settings.pipeline_stage == Some(stage))
            .map(|op| op.id)
            .collect();
        if readers.is_empty() {
            continue;
        }
        let mut settings = forward.settings.derived(format!("Stash_{}", tensor.id));
        settings.recompute_type = RecomputeType::Undefined;
        found.push(ToStash {
            tensor: tensor.id.clone(),
            stage,
            readers,
            forward: settings,
        });
    }
    Ok(found)
}

/// Inserts a stash and an inplace restore for every forward tensor read by
/// the backward pass of its own stage. Returns the number of stashed tensors.
pub(crate) fn stash_and_restore(graph: &mut Graph) -> Result<usize> {
    let num_stages = match graph.ops().filter_map(|op| op.settings.pipeline_stage).max() {
        Some(last) => last + 1,
        None => return Ok(0),
    };
    let loss_producer = match graph.loss() {
        Some(loss) => graph.tensors().get(loss).ok().and_then(|t| t.producer()),
        None => None,
    };

    let found = candidates(graph)?;
    for entry in &found {
        let tensor = &entry.tensor;
        let mut attrs = Attributes::new();
        attrs.insert(
            "stash_size".to_string(),
            Attribute::Int(stash_size(entry.stage, num_stages)),
        );

        let stash = stash_id(tensor);
        graph.create_connected_op(
            &opids::stash(),
            entry.forward.clone(),
            attrs.clone(),
            &[(0, tensor.clone())],
            &[(0, stash.clone())],
        )?;

        let mut settings = graph
            .op(entry.readers[0])?
            .settings
            .derived(format!("Restore_{tensor}"));
        settings.recompute_type = RecomputeType::Undefined;
        let restored = restored_id(tensor);
        let restore = graph.create_connected_op(
            &opids::restore_inplace(),
            settings,
            attrs,
            &[
                (RestoreInplace::ACT_IN, tensor.clone()),
                (RestoreInplace::STASH_IN, stash),
            ],
            &[(0, restored.clone())],
        )?;
        graph.op_mut(restore)?.vertex_mut().scheduled_pre_loss = LossPath::No;

        for reader in &entry.readers {
            let indices = graph.op(*reader)?.input.indices(tensor).to_vec();
            for index in indices {
                graph.disconnect_in(*reader, index)?;
                graph.connect_in(*reader, index, &restored)?;
            }
        }

        // The restore overwrites the tensor, so every remaining reader goes first.
        for consumer in graph.consumers(tensor)? {
            if consumer != restore {
                graph.topo_cons_mut().insert(consumer, restore, false)?;
            }
        }
        if let Some(loss_producer) = loss_producer {
            graph.topo_cons_mut().insert(loss_producer, restore, false)?;
        }
        debug!(target: "kiln::transform", tensor = %tensor, stage = entry.stage, readers = entry.readers.len(), "stashed");
    }
    Ok(found.len())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    use super::*;
    use crate::ir::op::OperatorIdentifier;
    use crate::ir::scheduler::{OpsBeforeKey, RequireOptimal};
    use crate::ir::tensor_info::{DataType, TensorInfo};
    use crate::ops::default_registry;

    fn staged(
        g: &mut Graph,
        opid: OperatorIdentifier,
        (input, output): (&str, &str),
        stage: i64,
        backward: bool,
    ) -> OpId {
        let mut settings = Settings::new(GraphId::main(), output);
        settings.vgraph_id = Some(stage);
        settings.pipeline_stage = Some(stage);
        let op = g
            .create_connected_op(
                &opid,
                settings,
                Attributes::new(),
                &[(0, TensorId::from(input))],
                &[(0, TensorId::from(output))],
            )
            .unwrap();
        let pre_loss = if backward { LossPath::No } else { LossPath::Yes };
        g.op_mut(op).unwrap().vertex_mut().scheduled_pre_loss = pre_loss;
        let out = TensorId::from(output);
        g.tensors_mut().get_mut(&out).unwrap().vertex_mut().scheduled_pre_loss = pre_loss;
        op
    }

    /// x -> relu [stage 0] -> a -> neg [stage 1] -> b; a is read again by a
    /// backward op on stage 0.
    fn two_stage() -> (Graph, OpId, OpId) {
        let mut g = Graph::new(GraphId::main(), default_registry(), Arc::new(AtomicU64::new(0)));
        let x = TensorId::from("x");
        g.tensors_mut()
            .add_stream(x.clone(), TensorInfo::new(DataType::Float, vec![4]))
            .unwrap();
        g.tensors_mut().get_mut(&x).unwrap().vertex_mut().scheduled_pre_loss = LossPath::Yes;
        staged(&mut g, opids::relu(), ("x", "a"), 0, false);
        let fwd = staged(&mut g, opids::neg(), ("a", "b"), 1, false);
        let bwd = staged(&mut g, opids::exp(), ("a", "g"), 0, true);
        (g, fwd, bwd)
    }

    #[test]
    fn backward_reader_on_the_same_stage_reads_the_restored_value() {
        let (mut g, fwd, bwd) = two_stage();
        assert_eq!(stash_and_restore(&mut g).unwrap(), 1);

        let a = TensorId::from("a");
        assert_eq!(g.op(bwd).unwrap().in_id(0).unwrap(), &restored_id(&a));
        assert_eq!(g.op(fwd).unwrap().in_id(0).unwrap(), &a);

        let stash = g.producer(&stash_id(&a)).unwrap().unwrap();
        assert!(stash.is(types::STASH));
        assert_eq!(stash.settings.pipeline_stage, Some(0));
        assert_eq!(stash.attr_int("stash_size"), Some(3));
        assert_eq!(g.info(&stash_id(&a)).unwrap().shape, vec![3, 4]);

        let restore = g.producer(&restored_id(&a)).unwrap().unwrap();
        assert!(restore.flags().restore_inplace);
        assert!(restore.modifies(RestoreInplace::ACT_IN));
        let restore = restore.id;
        assert!(g.topo_cons().contains(fwd, restore));

        let schedule = g.op_schedule(&OpsBeforeKey::new(), RequireOptimal::Yes).unwrap();
        let at = |id: OpId| schedule.iter().position(|op| *op == id).unwrap();
        assert!(at(fwd) < at(restore));
        assert!(at(restore) < at(bwd));
    }

    #[test]
    fn stashing_twice_changes_nothing() {
        let (mut g, _, _) = two_stage();
        stash_and_restore(&mut g).unwrap();
        let ops = g.n_ops();
        assert_eq!(stash_and_restore(&mut g).unwrap(), 0);
        assert_eq!(g.n_ops(), ops);
    }

    #[test]
    fn readers_on_other_stages_need_no_stash() {
        let (mut g, _, bwd) = two_stage();
        g.op_mut(bwd).unwrap().settings.pipeline_stage = Some(1);
        assert_eq!(stash_and_restore(&mut g).unwrap(), 0);
        assert!(g.ops().all(|op| !op.is(types::STASH)));
    }
}
