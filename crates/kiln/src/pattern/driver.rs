use std::collections::{HashMap, VecDeque};

use tracing::trace;

use crate::error::Result;
use crate::ir::graph::Graph;
use crate::ir::ids::OpId;
use crate::ir::tensor::TensorType;
use crate::pattern::{FrozenPatternSet, PatternContext};

#[derive(Debug, Clone)]
pub struct GreedyConfig {
    pub max_iterations: usize,
    pub enable_dce: bool,
}

impl Default for GreedyConfig {
    fn default() -> Self {
        Self {
            max_iterations: usize::MAX,
            enable_dce: true,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GreedyRewriteStats {
    pub iterations: usize,
    pub applied: usize,
    pub dce_removed: usize,
}

/// Applies `patterns` to every op of `graph` until none matches.
///
/// A failed match is cached per `(pattern, op)` and only retried once some
/// other rewrite has changed the graph.
pub fn apply_patterns_greedily(
    graph: &mut Graph,
    patterns: &FrozenPatternSet,
    cx: &PatternContext,
    cfg: &GreedyConfig,
) -> Result<GreedyRewriteStats> {
    if patterns.is_empty() {
        return Ok(GreedyRewriteStats::default());
    }

    let mut worklist = VecDeque::new();
    seed_worklist(graph, &mut worklist);

    let mut failure_cache: HashMap<(usize, OpId), usize> = HashMap::new();
    let mut stats = GreedyRewriteStats::default();

    while let Some(op_id) = worklist.pop_front() {
        if stats.iterations >= cfg.max_iterations {
            break;
        }
        if !graph.contains_op(op_id) {
            continue;
        }

        let version = stats.applied;
        let op_snapshot = graph.op(op_id)?.clone();

        for (idx, pattern) in patterns.matching(&op_snapshot) {
            if failure_cache.get(&(idx, op_id)).copied() == Some(version) {
                continue;
            }

            if pattern.match_and_rewrite(op_id, graph, cx)? {
                trace!(target: "kiln::pattern", pattern = pattern.name(), op = %op_snapshot.debug_name(), "applied");
                stats.applied += 1;
                stats.iterations = stats.iterations.saturating_add(1);
                clear_failure_entries(op_id, &mut failure_cache);
                seed_worklist(graph, &mut worklist);
                break;
            } else {
                failure_cache.insert((idx, op_id), version);
            }
        }
    }

    if cfg.enable_dce {
        stats.dce_removed = run_dce(graph, cx)?;
    }

    Ok(stats)
}

fn seed_worklist(graph: &Graph, worklist: &mut VecDeque<OpId>) {
    worklist.clear();
    worklist.extend(graph.op_ids());
}

fn clear_failure_entries(op: OpId, cache: &mut HashMap<(usize, OpId), usize>) {
    cache.retain(|(_, cached_op), _| *cached_op != op);
}

/// Erases side-effect free ops none of whose outputs is read or kept.
fn run_dce(graph: &mut Graph, cx: &PatternContext) -> Result<usize> {
    let mut removed_total = 0;
    loop {
        let mut removed_in_pass = 0;
        for op_id in graph.op_ids().into_iter().rev() {
            if !graph.contains_op(op_id) {
                continue;
            }
            let op = graph.op(op_id)?;
            if op.has_side_effect() || op.modifies_any() {
                continue;
            }
            let outputs = op.output.tensors();
            let mut live = false;
            for output in &outputs {
                let tensor = graph.tensor(output)?;
                if !tensor.consumers.is_empty() || cx.is_protected(graph, output) {
                    live = true;
                    break;
                }
            }
            if live {
                continue;
            }
            graph.erase_op(op_id)?;
            for output in &outputs {
                if graph.tensor(output)?.tensor_type == TensorType::ActGrad {
                    graph.tensors_mut().remove(output)?;
                }
            }
            removed_in_pass += 1;
        }
        if removed_in_pass == 0 {
            break;
        }
        removed_total += removed_in_pass;
    }
    Ok(removed_total)
}
