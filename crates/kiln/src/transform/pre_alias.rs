use crate::error::Result;
use crate::ir::ids::GraphId;
use crate::pattern::{apply_patterns_greedily, GreedyConfig, PatternContext};
use crate::session::Ir;
use crate::transform::{PassResult, Transform};

/// Applies the enabled pre-alias patterns to a fixed point.
///
/// Anchors and the loss are protected from being rewritten away.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreAliasPatterns;

impl PreAliasPatterns {
    pub const NAME: &'static str = "PreAliasPatterns";
}

impl Transform for PreAliasPatterns {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn apply(&self, ir: &mut Ir, graph: &GraphId) -> Result<PassResult> {
        let patterns = ir.patterns().pre_alias_patterns();
        if patterns.is_empty() {
            return Ok(PassResult::unchanged());
        }
        let cx = PatternContext::new(ir.protected_tensors());
        let stats = apply_patterns_greedily(ir.graph_mut(graph)?, &patterns, &cx, &GreedyConfig::default())?;
        Ok(PassResult {
            changed: stats.applied > 0 || stats.dce_removed > 0,
            iterations: stats.iterations,
            rewrites_applied: stats.applied,
            erased_ops: stats.dce_removed,
        })
    }
}
