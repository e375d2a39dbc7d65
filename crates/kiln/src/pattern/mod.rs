//! Local match-and-rewrite rules and the greedy driver applying them.

mod driver;
mod patterns;
mod rules;

use std::collections::BTreeSet;

use crate::error::Result;
use crate::ir::graph::Graph;
use crate::ir::ids::{OpId, TensorId};
use crate::ir::op::Op;

pub use driver::{apply_patterns_greedily, GreedyConfig, GreedyRewriteStats};
pub use patterns::{Patterns, PatternsLevel};
pub use rules::{DoubleNegation, IdentityRemoval, SumSimplify};

/// Names under which patterns are enabled, disabled and excluded per op.
pub mod names {
    pub const INPLACE: &str = "InPlace";
    pub const IDENTITY_REMOVAL: &str = "IdentityRemoval";
    pub const DOUBLE_NEGATION: &str = "DoubleNegation";
    pub const SUM_SIMPLIFY: &str = "SumSimplify";

    /// Every pattern name accepted by [`super::Patterns::enable`].
    pub const ALL: &[&str] = &[INPLACE, IDENTITY_REMOVAL, DOUBLE_NEGATION, SUM_SIMPLIFY];
}

/// Tensors rewrites must keep: anchors, the loss and graph outputs.
#[derive(Debug, Clone, Default)]
pub struct PatternContext {
    protected: BTreeSet<TensorId>,
}

impl PatternContext {
    pub fn new(protected: BTreeSet<TensorId>) -> Self {
        Self { protected }
    }

    pub fn is_protected(&self, graph: &Graph, tensor: &TensorId) -> bool {
        self.protected.contains(tensor) || graph.is_output(tensor)
    }
}

/// Base trait for rewrite patterns operating on one graph.
pub trait Pattern: Send + Sync {
    fn name(&self) -> &'static str;
    fn matches_operation(&self, op: &Op) -> bool {
        let _ = op;
        true
    }
    fn benefit(&self) -> u16 {
        1
    }
    /// Rewrites around `root`; `Ok(false)` when the pattern does not apply.
    fn match_and_rewrite(&self, root: OpId, graph: &mut Graph, cx: &PatternContext)
        -> Result<bool>;
}

/// Mutable set that collects rewrite patterns prior to freezing.
pub struct PatternSet {
    patterns: Vec<Box<dyn Pattern>>,
}

impl PatternSet {
    pub fn new() -> Self {
        Self {
            patterns: Vec::new(),
        }
    }

    pub fn add<P>(&mut self, pattern: P) -> &mut Self
    where
        P: Pattern + 'static,
    {
        self.patterns.push(Box::new(pattern));
        self
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn freeze(mut self) -> FrozenPatternSet {
        self.patterns
            .sort_by_key(|pattern| std::cmp::Reverse(pattern.benefit()));
        FrozenPatternSet {
            patterns: self.patterns,
        }
    }
}

impl Default for PatternSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable collection of rewrite patterns ready for use by the driver.
pub struct FrozenPatternSet {
    patterns: Vec<Box<dyn Pattern>>,
}

impl FrozenPatternSet {
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.patterns.iter().map(|pattern| pattern.name()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &dyn Pattern)> {
        self.patterns.iter().enumerate().map(|(idx, p)| (idx, &**p))
    }

    /// Patterns interested in `op` that `op` does not exclude.
    pub fn matching<'a>(&'a self, op: &'a Op) -> impl Iterator<Item = (usize, &'a dyn Pattern)> + 'a {
        self.patterns
            .iter()
            .enumerate()
            .filter(move |(_, pattern)| {
                pattern.matches_operation(op) && !op.is_excluded_from_pattern(pattern.name())
            })
            .map(|(idx, pattern)| (idx, &**pattern))
    }
}

/// Common op matchers.
pub mod filters {
    use crate::ir::op::Op;
    use crate::ops::types;

    pub fn identity(op: &Op) -> bool {
        op.is(types::IDENTITY)
    }

    pub fn neg(op: &Op) -> bool {
        op.is(types::NEG)
    }

    pub fn sum(op: &Op) -> bool {
        op.is(types::SUM)
    }
}
