//! Whole-graph rewrite passes and the pipeline machinery that sequences them.
//!
//! Every [`Transform`] is identified by a stable numeric id derived from its
//! name, can be disabled on the [`crate::session::Ir`], and reports what it did
//! through a [`PassResult`].

mod autodiff;
mod auto_virtual_graph;
mod batch_serialize;
mod const_fold;
mod inplace;
mod inplace_priorities;
mod inter_ipu_copy;
mod merge_duplicates;
mod outline;
mod pipeline;
mod pipeline_stages;
mod pre_alias;
mod prune;
mod recompute;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use tracing::info;

use crate::error::Result;
use crate::hashing::fnv1a_hash;
use crate::ir::ids::GraphId;
use crate::session::Ir;

pub use autodiff::Autodiff;
pub use auto_virtual_graph::AutoVirtualGraph;
pub use batch_serialize::BatchSerialize;
pub use const_fold::ConstExprFolding;
pub use inplace::Inplace;
pub use inplace_priorities::UpdateInplacePrioritiesForIpu;
pub use inter_ipu_copy::InterIpuCopy;
pub use merge_duplicates::MergeDuplicateOps;
pub use outline::SubgraphOutline;
pub use pipeline::Pipeline;
pub use pipeline_stages::InferPipelineStages;
pub use pre_alias::PreAliasPatterns;
pub use prune::Prune;
pub use recompute::{auto_annotate, ExplicitRecompute};

/// Result returned by a [`Transform`] after it runs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassResult {
    /// Whether the pass changed the IR.
    pub changed: bool,
    /// Number of rewrite iterations executed while applying the pass.
    pub iterations: usize,
    /// Total number of rewrites applied by the pass.
    pub rewrites_applied: usize,
    /// Ops removed by the pass.
    pub erased_ops: usize,
}

impl PassResult {
    /// Merges two run results, accumulating statistics.
    pub fn merge(self, other: PassResult) -> PassResult {
        PassResult {
            changed: self.changed || other.changed,
            iterations: self.iterations + other.iterations,
            rewrites_applied: self.rewrites_applied + other.rewrites_applied,
            erased_ops: self.erased_ops + other.erased_ops,
        }
    }

    pub fn unchanged() -> Self {
        Self::default()
    }
}

/// Global, typically one-shot, rewrite of one graph.
pub trait Transform: Send + Sync {
    fn name(&self) -> &'static str;

    /// Stable id used to enable or disable the transform.
    fn id(&self) -> u64 {
        transform_id(self.name())
    }

    fn apply(&self, ir: &mut Ir, graph: &GraphId) -> Result<PassResult>;
}

pub fn transform_id(name: &str) -> u64 {
    fnv1a_hash(name.as_bytes())
}

/// Built-in transforms keyed by id, with a per-id enable switch.
#[derive(Clone)]
pub struct TransformRegistry {
    transforms: BTreeMap<u64, Arc<dyn Transform>>,
    disabled: BTreeSet<u64>,
}

impl fmt::Debug for TransformRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.transforms.values().map(|t| t.name()).collect();
        f.debug_struct("TransformRegistry")
            .field("transforms", &names)
            .field("disabled", &self.disabled.len())
            .finish()
    }
}

impl TransformRegistry {
    pub fn empty() -> Self {
        Self {
            transforms: BTreeMap::new(),
            disabled: BTreeSet::new(),
        }
    }

    pub fn register(&mut self, transform: Arc<dyn Transform>) -> &mut Self {
        self.transforms.insert(transform.id(), transform);
        self
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry
            .register(Arc::new(Prune))
            .register(Arc::new(ConstExprFolding))
            .register(Arc::new(PreAliasPatterns))
            .register(Arc::new(AutoVirtualGraph))
            .register(Arc::new(InferPipelineStages))
            .register(Arc::new(Autodiff))
            .register(Arc::new(ExplicitRecompute))
            .register(Arc::new(InterIpuCopy))
            .register(Arc::new(BatchSerialize::new(1)))
            .register(Arc::new(BatchSerialize::new(2)))
            .register(Arc::new(Pipeline))
            .register(Arc::new(SubgraphOutline))
            .register(Arc::new(MergeDuplicateOps))
            .register(Arc::new(UpdateInplacePrioritiesForIpu))
            .register(Arc::new(Inplace));
        registry
    }

    pub fn get(&self, id: u64) -> Option<Arc<dyn Transform>> {
        self.transforms.get(&id).cloned()
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<dyn Transform>> {
        self.get(transform_id(name))
    }

    pub fn is_enabled(&self, id: u64) -> bool {
        !self.disabled.contains(&id)
    }

    pub fn set_enabled(&mut self, id: u64, enabled: bool) {
        if enabled {
            self.disabled.remove(&id);
        } else {
            self.disabled.insert(id);
        }
    }
}

impl Default for TransformRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Runs one transform inside its tracing span, logging stats when requested.
pub(crate) fn run_transform(
    transform: &dyn Transform,
    ir: &mut Ir,
    graph: &GraphId,
    log_stats: bool,
) -> Result<PassResult> {
    let _span = tracing::info_span!("transform", name = transform.name(), graph = %graph).entered();
    let stats = ir
        .apply_transform_unchecked(transform, graph)
        .map_err(|err| err.context(format!("transform {}", transform.name())))?;
    if log_stats {
        info!(
            target: "kiln::transform",
            pass = transform.name(),
            graph = %graph,
            changed = stats.changed,
            iterations = stats.iterations,
            rewrites = stats.rewrites_applied,
            erased = stats.erased_ops,
            "pass stats"
        );
    }
    Ok(stats)
}

pub enum Step {
    Pass(Arc<dyn Transform>),
    FixedPoint { max_iters: usize, steps: Vec<Step> },
}

pub struct PipelineBuilder {
    steps: Vec<Step>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn pass(&mut self, pass: Arc<dyn Transform>) {
        self.steps.push(Step::Pass(pass));
    }

    pub fn fixed_point<F>(&mut self, max_iters: usize, build: F)
    where
        F: FnOnce(&mut PipelineBuilder),
    {
        let mut inner = PipelineBuilder::new();
        build(&mut inner);
        self.steps.push(Step::FixedPoint {
            max_iters: max_iters.max(1),
            steps: inner.steps,
        });
    }

    pub fn finish(self) -> Vec<Step> {
        self.steps
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs `steps` on `graph`; disabled transforms are skipped. Returns whether
/// anything changed.
pub fn run_steps(
    steps: &[Step],
    ir: &mut Ir,
    graph: &GraphId,
    totals: &mut PassResult,
    log_stats: bool,
) -> Result<bool> {
    let mut changed_any = false;
    for step in steps {
        match step {
            Step::Pass(pass) => {
                if !ir.transforms().is_enabled(pass.id()) {
                    continue;
                }
                let stats = run_transform(pass.as_ref(), ir, graph, log_stats)?;
                changed_any |= stats.changed;
                *totals = totals.merge(stats);
            }
            Step::FixedPoint { max_iters, steps } => {
                let mut iter = 0usize;
                loop {
                    if iter >= *max_iters {
                        break;
                    }
                    iter += 1;
                    let mut local = PassResult::default();
                    let changed = run_steps(steps, ir, graph, &mut local, log_stats)?;
                    *totals = totals.merge(local);
                    changed_any |= changed;
                    if !changed {
                        break;
                    }
                }
            }
        }
    }
    Ok(changed_any)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_stable_and_distinct() {
        assert_eq!(Prune.id(), transform_id("Prune"));
        assert_ne!(BatchSerialize::new(1).id(), BatchSerialize::new(2).id());
    }

    #[test]
    fn registry_toggles_by_id() {
        let mut registry = TransformRegistry::with_builtins();
        let id = transform_id(Inplace.name());
        assert!(registry.get(id).is_some());
        registry.set_enabled(id, false);
        assert!(!registry.is_enabled(id));
        registry.set_enabled(id, true);
        assert!(registry.is_enabled(id));
    }

    #[test]
    fn merge_accumulates() {
        let a = PassResult {
            changed: false,
            iterations: 1,
            rewrites_applied: 2,
            erased_ops: 0,
        };
        let b = PassResult {
            changed: true,
            iterations: 1,
            rewrites_applied: 0,
            erased_ops: 3,
        };
        let merged = a.merge(b);
        assert!(merged.changed);
        assert_eq!(merged.rewrites_applied, 2);
        assert_eq!(merged.erased_ops, 3);
    }
}
