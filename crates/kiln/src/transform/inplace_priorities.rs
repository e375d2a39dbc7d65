use tracing::trace;

use crate::error::Result;
use crate::ir::graph::Graph;
use crate::ir::ids::GraphId;
use crate::ops::types;
use crate::session::Ir;
use crate::transform::{PassResult, Transform};

/// Priority given to the inplace variant writing into a heavy op's output.
const HEAVY_OPERAND_PRIORITY: f32 = 20.0;

/// Prefers the `Add` inplace variant that overwrites the operand produced by
/// a matmul-like op, whose layout is the better target on the device.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateInplacePrioritiesForIpu;

impl UpdateInplacePrioritiesForIpu {
    pub const NAME: &'static str = "UpdateInplacePrioritiesForIpu";
}

impl Transform for UpdateInplacePrioritiesForIpu {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn apply(&self, ir: &mut Ir, graph: &GraphId) -> Result<PassResult> {
        let graph = ir.graph_mut(graph)?;
        let updated = update_priorities(graph)?;
        Ok(PassResult {
            changed: updated > 0,
            iterations: 1,
            rewrites_applied: updated,
            erased_ops: 0,
        })
    }
}

pub(crate) fn update_priorities(graph: &mut Graph) -> Result<usize> {
    let mut updates = Vec::new();
    for op in graph.ops().filter(|op| op.is(types::ADD)) {
        for (index, variant) in [(0, types::ADD_LHS_INPLACE), (1, types::ADD_RHS_INPLACE)] {
            let Some(operand) = op.input.tensor(index) else {
                continue;
            };
            let heavy = graph
                .producer(operand)?
                .map(|producer| producer.flags().heavy)
                .unwrap_or(false);
            let vetoed = op
                .settings
                .inplace_priority_veto
                .iter()
                .any(|(name, _)| name == variant);
            if heavy && !vetoed {
                updates.push((op.id, variant));
            }
        }
    }
    for (op_id, variant) in &updates {
        let op = graph.op_mut(*op_id)?;
        op.settings
            .inplace_priority_veto
            .push((variant.to_string(), HEAVY_OPERAND_PRIORITY));
        trace!(target: "kiln::transform", op = %op.debug_name(), variant, "raised inplace priority");
    }
    Ok(updates.len())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    use super::*;
    use crate::ir::ids::TensorId;
    use crate::ir::op::{Attributes, Settings};
    use crate::ir::tensor_info::{DataType, TensorInfo};
    use crate::ops::{default_registry, opids};

    #[test]
    fn matmul_operand_side_is_preferred() {
        let mut g = Graph::new(GraphId::main(), default_registry(), Arc::new(AtomicU64::new(0)));
        let info = TensorInfo::new(DataType::Float, vec![2, 2]);
        for name in ["a", "b", "bias"] {
            g.tensors_mut().add_stream(TensorId::from(name), info.clone()).unwrap();
        }
        g.create_connected_op(
            &opids::matmul(),
            Settings::new(GraphId::main(), "mm"),
            Attributes::new(),
            &[(0, TensorId::from("a")), (1, TensorId::from("b"))],
            &[(0, TensorId::from("p"))],
        )
        .unwrap();
        let add = g
            .create_connected_op(
                &opids::add(),
                Settings::new(GraphId::main(), "add"),
                Attributes::new(),
                &[(0, TensorId::from("bias")), (1, TensorId::from("p"))],
                &[(0, TensorId::from("y"))],
            )
            .unwrap();

        assert_eq!(update_priorities(&mut g).unwrap(), 1);
        assert_eq!(
            g.op(add).unwrap().settings.inplace_priority_veto,
            vec![(types::ADD_RHS_INPLACE.to_string(), HEAVY_OPERAND_PRIORITY)]
        );
        assert_eq!(update_priorities(&mut g).unwrap(), 0);
    }
}
