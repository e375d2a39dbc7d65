use crate::error::Result;
use crate::ir::graph::Graph;
use crate::ir::ids::{OpId, TensorId};
use crate::ir::op::{Attributes, Op};
use crate::ir::tensor::TensorType;
use crate::ops::{opids, types};
use crate::pattern::{filters, names, Pattern, PatternContext};

/// Whether every consumer of `tensor` only reads it.
fn read_only_uses(graph: &Graph, tensor: &TensorId) -> Result<bool> {
    for consumer in graph.consumers(tensor)? {
        let op = graph.op(consumer)?;
        if op.input.indices(tensor).iter().any(|index| op.modifies(*index)) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Points every reader of `from` at `to` and drops `from`.
fn forward_uses(graph: &mut Graph, from: &TensorId, to: &TensorId) -> Result<()> {
    graph.replace_all_uses(from, to)?;
    if graph.tensor(from)?.is_isolated() && graph.tensor(from)?.tensor_type == TensorType::ActGrad {
        graph.tensors_mut().remove(from)?;
    }
    Ok(())
}

fn single_in_out(op: &Op) -> Option<(TensorId, TensorId)> {
    if op.input.n() != 1 || op.output.n() != 1 {
        return None;
    }
    Some((op.in_id(0).ok()?.clone(), op.out_id(0).ok()?.clone()))
}

/// `y = Identity(x)`: readers of `y` read `x` directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityRemoval;

impl Pattern for IdentityRemoval {
    fn name(&self) -> &'static str {
        names::IDENTITY_REMOVAL
    }

    fn matches_operation(&self, op: &Op) -> bool {
        filters::identity(op)
    }

    fn match_and_rewrite(&self, root: OpId, graph: &mut Graph, cx: &PatternContext) -> Result<bool> {
        let Some((x, y)) = single_in_out(graph.op(root)?) else {
            return Ok(false);
        };
        if cx.is_protected(graph, &y) || !read_only_uses(graph, &y)? {
            return Ok(false);
        }
        graph.erase_op(root)?;
        forward_uses(graph, &y, &x)?;
        Ok(true)
    }
}

/// `Neg(Neg(x))`: readers of the outer result read `x`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DoubleNegation;

impl Pattern for DoubleNegation {
    fn name(&self) -> &'static str {
        names::DOUBLE_NEGATION
    }

    fn matches_operation(&self, op: &Op) -> bool {
        filters::neg(op)
    }

    fn match_and_rewrite(&self, root: OpId, graph: &mut Graph, cx: &PatternContext) -> Result<bool> {
        let Some((mid, out)) = single_in_out(graph.op(root)?) else {
            return Ok(false);
        };
        let Some(inner) = graph.producer(&mid)? else {
            return Ok(false);
        };
        if !inner.is(types::NEG) || inner.is_excluded_from_pattern(self.name()) {
            return Ok(false);
        }
        let Some((x, _)) = single_in_out(inner) else {
            return Ok(false);
        };
        if cx.is_protected(graph, &out) || !read_only_uses(graph, &out)? {
            return Ok(false);
        }
        graph.erase_op(root)?;
        forward_uses(graph, &out, &x)?;
        Ok(true)
    }
}

/// Single-input `Sum` becomes `Identity`, two-input `Sum` becomes `Add`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SumSimplify;

impl Pattern for SumSimplify {
    fn name(&self) -> &'static str {
        names::SUM_SIMPLIFY
    }

    fn matches_operation(&self, op: &Op) -> bool {
        filters::sum(op)
    }

    fn match_and_rewrite(&self, root: OpId, graph: &mut Graph, _cx: &PatternContext) -> Result<bool> {
        let op = graph.op(root)?;
        let dense = op.input.max_index().map(|max| max + 1) == Some(op.input.n());
        let replacement = match op.input.n() {
            1 if dense => opids::identity(),
            2 if dense => opids::add(),
            _ => return Ok(false),
        };
        graph.replace_op(root, &replacement, Attributes::new())?;
        Ok(true)
    }
}
