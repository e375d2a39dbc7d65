use crate::alias::{apply_inplace, InplaceConfig};
use crate::error::Result;
use crate::ir::ids::GraphId;
use crate::session::Ir;
use crate::transform::{PassResult, Transform};

/// Runs the inplacing engine on one graph.
#[derive(Debug, Clone, Copy, Default)]
pub struct Inplace;

impl Inplace {
    pub const NAME: &'static str = "Inplace";
}

impl Transform for Inplace {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn apply(&self, ir: &mut Ir, graph: &GraphId) -> Result<PassResult> {
        let cfg = InplaceConfig {
            pipelining: ir.options().enable_pipelining,
            explicit_recompute: ir.options().explicit_recomputation,
        };
        let stats = apply_inplace(ir.graph_mut(graph)?, &cfg)?;
        Ok(PassResult {
            changed: stats.applied > 0,
            iterations: stats.candidates,
            rewrites_applied: stats.applied,
            erased_ops: stats.applied,
        })
    }
}
