use std::collections::BTreeMap;

use tracing::debug;

use crate::error::Result;
use crate::ir::graph::Graph;
use crate::ir::ids::{GraphId, OpId, TensorId, VGraphId};
use crate::ir::op::Settings;
use crate::ir::scheduler::{OpsBeforeKey, RequireOptimal};
use crate::ops::{opids, IpuCopy};
use crate::session::Ir;
use crate::transform::{PassResult, Transform};

/// Inserts a copy op wherever an op reads a tensor living on another
/// virtual graph.
///
/// One copy is created per `(tensor, destination)` pair and shared by every
/// reader on that destination.
#[derive(Debug, Clone, Copy, Default)]
pub struct InterIpuCopy;

impl InterIpuCopy {
    pub const NAME: &'static str = "InterIpuCopy";
}

impl Transform for InterIpuCopy {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn apply(&self, ir: &mut Ir, graph: &GraphId) -> Result<PassResult> {
        let graph = ir.graph_mut(graph)?;
        let copies = insert_copies(graph)?;
        Ok(PassResult {
            changed: copies > 0,
            iterations: 1,
            rewrites_applied: copies,
            erased_ops: 0,
        })
    }
}

fn copy_settings(
    graph: &Graph,
    tensor: &TensorId,
    source: VGraphId,
    reader: OpId,
    dest: VGraphId,
) -> Result<Settings> {
    let mut settings = Settings::new(graph.id().clone(), format!("IpuCopy_{tensor}_to_{dest}"));
    settings.vgraph_id = Some(source);
    settings.pipeline_stage = match graph.producer(tensor)? {
        Some(producer) => producer.settings.pipeline_stage,
        None => graph.op(reader)?.settings.pipeline_stage,
    };
    settings.execution_phase = graph.op(reader)?.settings.execution_phase;
    Ok(settings)
}

pub(crate) fn insert_copies(graph: &mut Graph) -> Result<usize> {
    let mut home: BTreeMap<TensorId, Option<VGraphId>> = BTreeMap::new();
    for id in graph.tensors().ids() {
        let vgid = graph.tensor_vgraph_id(&id)?;
        home.insert(id, vgid);
    }

    let mut copies: BTreeMap<(TensorId, VGraphId), TensorId> = BTreeMap::new();
    let schedule = graph.op_schedule(&OpsBeforeKey::new(), RequireOptimal::No)?;
    for op_id in schedule {
        let op = graph.op(op_id)?;
        if op.is_ipu_copy() {
            continue;
        }
        let Some(dest) = op.settings.vgraph_id else {
            continue;
        };
        let reads: Vec<(usize, TensorId, bool)> = op
            .input
            .iter()
            .map(|(index, tensor)| (index, tensor.clone(), op.modifies(index)))
            .collect();

        for (index, tensor, modified) in reads {
            let Some(source) = home.get(&tensor).copied().flatten() else {
                continue;
            };
            if source == dest {
                continue;
            }
            if modified {
                debug!(target: "kiln::transform", op = %op_id, tensor = %tensor, "not copying a modified input");
                continue;
            }
            let copied = match copies.get(&(tensor.clone(), dest)) {
                Some(copied) => copied.clone(),
                None => {
                    let copied = tensor.with_suffix(format!("_c{dest}"));
                    let settings = copy_settings(graph, &tensor, source, op_id, dest)?;
                    graph.create_connected_op(
                        &opids::ipu_copy(),
                        settings,
                        IpuCopy::attrs(vec![source], dest),
                        &[(0, tensor.clone())],
                        &[(0, copied.clone())],
                    )?;
                    copies.insert((tensor.clone(), dest), copied.clone());
                    copied
                }
            };
            graph.disconnect_in(op_id, index)?;
            graph.connect_in(op_id, index, &copied)?;
        }
    }
    Ok(copies.len())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    use super::*;
    use crate::ir::op::Attributes;
    use crate::ir::tensor_info::{DataType, TensorInfo};
    use crate::ops::default_registry;

    #[test]
    fn boundary_reads_go_through_one_shared_copy() {
        let mut g = Graph::new(GraphId::main(), default_registry(), Arc::new(AtomicU64::new(0)));
        g.tensors_mut()
            .add_stream(TensorId::from("x"), TensorInfo::new(DataType::Float, vec![4]))
            .unwrap();
        let place = |g: &mut Graph, input: &str, output: &str, vgid: VGraphId| {
            let mut settings = Settings::new(GraphId::main(), output);
            settings.vgraph_id = Some(vgid);
            g.create_connected_op(
                &opids::relu(),
                settings,
                Attributes::new(),
                &[(0, TensorId::from(input))],
                &[(0, TensorId::from(output))],
            )
            .unwrap()
        };
        place(&mut g, "x", "a", 0);
        let b = place(&mut g, "a", "b", 1);
        let c = place(&mut g, "a", "c", 1);

        assert_eq!(insert_copies(&mut g).unwrap(), 1);
        let copied = TensorId::from("a_c1");
        assert_eq!(g.op(b).unwrap().in_id(0).unwrap(), &copied);
        assert_eq!(g.op(c).unwrap().in_id(0).unwrap(), &copied);
        assert_eq!(g.tensor_vgraph_id(&copied).unwrap(), Some(1));
        let copy = g.producer(&copied).unwrap().unwrap();
        assert_eq!(copy.settings.vgraph_id, Some(0));
    }
}
