use tracing::warn;

use crate::error::Result;
use crate::ir::ids::GraphId;
use crate::session::Ir;
use crate::transform::{PassResult, Transform};

/// Gives every op the pipeline stage of its virtual graph when no op has one.
#[derive(Debug, Clone, Copy, Default)]
pub struct InferPipelineStages;

impl InferPipelineStages {
    pub const NAME: &'static str = "InferPipelineStages";
}

impl Transform for InferPipelineStages {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn apply(&self, ir: &mut Ir, graph: &GraphId) -> Result<PassResult> {
        let graph = ir.graph_mut(graph)?;
        if graph.ops().any(|op| op.settings.pipeline_stage.is_some()) {
            return Ok(PassResult::unchanged());
        }
        let mut changed = 0;
        for op_id in graph.op_ids() {
            let op = graph.op_mut(op_id)?;
            match op.settings.vgraph_id {
                Some(vgid) => {
                    op.settings.pipeline_stage = Some(vgid);
                    changed += 1;
                }
                None => {
                    warn!(target: "kiln::transform", op = %op.debug_name(), "no virtual graph id to infer a pipeline stage from");
                }
            }
        }
        Ok(PassResult {
            changed: changed > 0,
            iterations: 1,
            rewrites_applied: changed,
            erased_ops: 0,
        })
    }
}
