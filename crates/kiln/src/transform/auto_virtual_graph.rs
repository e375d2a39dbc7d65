use tracing::debug;

use crate::error::Result;
use crate::ir::graph::Graph;
use crate::ir::ids::{GraphId, VGraphId};
use crate::ir::scheduler::{OpsBeforeKey, RequireOptimal};
use crate::session::Ir;
use crate::transform::{PassResult, Transform};

/// Splits the schedule into contiguous, roughly equal cost shards, one per
/// compute partition of the device.
///
/// The cost of an op is the byte size of its outputs.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoVirtualGraph;

impl AutoVirtualGraph {
    pub const NAME: &'static str = "AutoVirtualGraph";
}

impl Transform for AutoVirtualGraph {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn apply(&self, ir: &mut Ir, graph: &GraphId) -> Result<PassResult> {
        let num_ipus = ir.device().num_ipus.max(1);
        let graph = ir.graph_mut(graph)?;
        let changed = shard(graph, num_ipus)?;
        Ok(PassResult {
            changed: changed > 0,
            iterations: 1,
            rewrites_applied: changed,
            erased_ops: 0,
        })
    }
}

fn op_cost(graph: &Graph, op: &crate::ir::op::Op) -> u64 {
    let bytes: i64 = op
        .output
        .iter()
        .filter_map(|(_, tensor)| graph.info(tensor).ok())
        .map(|info| info.nbytes().max(0))
        .sum();
    bytes.max(1) as u64
}

/// Assigns virtual graph ids; returns the number of ops whose id changed.
pub(crate) fn shard(graph: &mut Graph, num_ipus: u32) -> Result<usize> {
    let schedule = graph.op_schedule(&OpsBeforeKey::new(), RequireOptimal::No)?;
    let costs: Vec<u64> = schedule
        .iter()
        .map(|id| graph.op(*id).map(|op| op_cost(graph, op)))
        .collect::<Result<_>>()?;
    let total: u64 = costs.iter().sum::<u64>().max(1);
    let n = u64::from(num_ipus.max(1));

    let mut changed = 0;
    let mut cumulative = 0u64;
    for (op_id, cost) in schedule.into_iter().zip(costs) {
        let shard = ((cumulative * n) / total).min(n - 1) as VGraphId;
        cumulative += cost;
        let op = graph.op_mut(op_id)?;
        if op.settings.vgraph_id != Some(shard) {
            op.settings.vgraph_id = Some(shard);
            changed += 1;
        }
    }
    debug!(target: "kiln::transform", graph = %graph.id(), shards = n, total_cost = total, "sharded");
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    use super::*;
    use crate::ir::ids::TensorId;
    use crate::ir::op::{Attributes, Settings};
    use crate::ir::tensor_info::{DataType, TensorInfo};
    use crate::ops::{default_registry, opids};

    #[test]
    fn equal_cost_chain_spreads_over_every_partition() {
        let mut g = Graph::new(GraphId::main(), default_registry(), Arc::new(AtomicU64::new(0)));
        g.tensors_mut()
            .add_stream(TensorId::from("x0"), TensorInfo::new(DataType::Float, vec![8]))
            .unwrap();
        for layer in 0..6 {
            g.create_connected_op(
                &opids::relu(),
                Settings::new(GraphId::main(), format!("relu{layer}")),
                Attributes::new(),
                &[(0, TensorId::new(format!("x{layer}")))],
                &[(0, TensorId::new(format!("x{}", layer + 1)))],
            )
            .unwrap();
        }
        shard(&mut g, 3).unwrap();
        let ids: BTreeSet<VGraphId> = g.ops().filter_map(|op| op.settings.vgraph_id).collect();
        assert_eq!(ids, [0, 1, 2].into_iter().collect());
        let ordered: Vec<VGraphId> = g
            .op_schedule(&OpsBeforeKey::new(), RequireOptimal::No)
            .unwrap()
            .into_iter()
            .map(|id| g.op(id).unwrap().settings.vgraph_id.unwrap())
            .collect();
        assert_eq!(ordered, vec![0, 0, 1, 1, 2, 2]);
    }
}
