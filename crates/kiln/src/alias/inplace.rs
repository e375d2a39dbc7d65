//! Greedy, priority ordered replacement of ops by their inplace variants.
//!
//! Every candidate is trialled against the shadow [`AliasModel`]: the proposal
//! is opened, the ordering constraints it implies are derived, a series of
//! safety checks runs, and the constraints must leave the graph schedulable.
//! Only then is the real graph rewritten and the proposal committed.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, trace};

use crate::alias::model::{AliasModel, Proposal};
use crate::error::Result;
use crate::ir::graph::Graph;
use crate::ir::ids::{InIndex, OpId, OutIndex, TensorId};
use crate::ir::op::{Op, OperatorIdentifier, RecomputeType, KILN_DOMAIN};
use crate::ir::scheduler::OpsBeforeKey;
use crate::ir::tensor::TensorType;
use crate::pattern::names;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InplaceConfig {
    pub pipelining: bool,
    pub explicit_recompute: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InplaceStats {
    pub candidates: usize,
    pub applied: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone, PartialEq)]
struct Candidate {
    op: OpId,
    variant: OperatorIdentifier,
    priority: f32,
}

/// Candidates in processing order: priority descending, then op id descending.
/// Non-positive priorities are dropped.
fn collect_candidates(graph: &Graph) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    for op in graph.ops() {
        let mut prioritized = BTreeSet::new();
        for (op_type, priority) in &op.settings.inplace_priority_veto {
            candidates.push(Candidate {
                op: op.id,
                variant: OperatorIdentifier::new(KILN_DOMAIN, op_type.as_str(), 1),
                priority: *priority,
            });
            prioritized.insert(op_type.clone());
        }
        for (variant, priority) in op.def().inplace_variants(op) {
            if !prioritized.contains(&variant.op_type) {
                candidates.push(Candidate {
                    op: op.id,
                    variant,
                    priority,
                });
            }
        }
    }
    candidates.sort_by(|a, b| {
        b.priority
            .total_cmp(&a.priority)
            .then_with(|| b.op.cmp(&a.op))
    });
    candidates.retain(|candidate| candidate.priority > 0.0);
    candidates
}

/// Runs the inplacing algorithm over one graph.
pub fn apply_inplace(graph: &mut Graph, cfg: &InplaceConfig) -> Result<InplaceStats> {
    let _span = tracing::debug_span!("inplace", graph = %graph.id()).entered();
    let candidates = collect_candidates(graph);
    let mut model = AliasModel::from_graph(graph);
    let mut inplaced: BTreeSet<OpId> = BTreeSet::new();
    let mut stats = InplaceStats {
        candidates: candidates.len(),
        ..InplaceStats::default()
    };

    for candidate in candidates {
        if inplaced.contains(&candidate.op) || !graph.contains_op(candidate.op) {
            debug!(target: "kiln::pattern", op = %candidate.op, "[Inplacing] already inplace");
            continue;
        }
        match try_inplace(graph, &mut model, &candidate, cfg)? {
            Some(new_op) => {
                inplaced.insert(candidate.op);
                inplaced.insert(new_op);
                stats.applied += 1;
            }
            None => stats.rejected += 1,
        }
    }
    trace!(target: "kiln::pattern", "completed inplacing");
    Ok(stats)
}

/// Copy of `op` as its inplace variant, not inserted in any graph.
fn variant_of(graph: &Graph, op: &Op, variant: &OperatorIdentifier) -> Result<Op> {
    let (opid, def) = graph.registry().resolve(variant)?;
    let mut copy = Op::new(op.id, opid, op.settings.clone(), op.attrs.clone(), def);
    copy.input = op.input.clone();
    copy.output = op.output.clone();
    Ok(copy)
}

fn try_inplace(
    graph: &mut Graph,
    model: &mut AliasModel,
    candidate: &Candidate,
    cfg: &InplaceConfig,
) -> Result<Option<OpId>> {
    let op = graph.op(candidate.op)?.clone();
    if op.is_excluded_from_pattern(names::INPLACE) {
        debug!(target: "kiln::pattern", op = %op.debug_name(), "[Inplacing] excluded from the inplace pattern");
        return Ok(None);
    }
    if op.flags().inplace {
        debug!(target: "kiln::pattern", op = %op.debug_name(), "[Inplacing] already inplace");
        return Ok(None);
    }
    if op.output.n() != 1 {
        debug!(target: "kiln::pattern", op = %op.debug_name(), outputs = op.output.n(), "[Inplacing] only single-output ops are inplaced");
        return Ok(None);
    }
    let variant = match variant_of(graph, &op, &candidate.variant) {
        Ok(variant) => variant,
        Err(err) => {
            debug!(target: "kiln::pattern", op = %op.debug_name(), error = %err, "[Inplacing] no such variant");
            return Ok(None);
        }
    };

    let pairs = alias_pairs(&variant);
    for (input, output) in &pairs {
        if variant.modifies(*input)
            && graph.info(op.in_id(*input)?)? != graph.info(op.out_id(*output)?)?
        {
            debug!(target: "kiln::pattern", op = %op.debug_name(), input, output, "[Inplacing] modified input differs from output info");
            return Ok(None);
        }
    }

    let mut before = BTreeMap::new();
    for (_, tensor) in op.input.iter().chain(op.output.iter()) {
        before
            .entry(tensor.clone())
            .or_insert_with(|| model.aliases(tensor));
    }
    let closures = Closures { before };

    let proposal = Proposal {
        op: op.id,
        aliases: pairs
            .iter()
            .map(|(input, output)| Ok((op.in_id(*input)?.clone(), op.out_id(*output)?.clone())))
            .collect::<Result<_>>()?,
        modifies: variant
            .modified_indices()
            .into_iter()
            .map(|index| op.in_id(index).cloned())
            .collect::<Result<_>>()?,
    };
    let transaction = match model.propose(proposal) {
        Ok(transaction) => transaction,
        Err(rejection) => {
            debug!(target: "kiln::pattern", op = %op.debug_name(), %rejection, "[Inplacing] proposal invalid");
            return Ok(None);
        }
    };

    let constraints = required_constraints(graph, model, &op, &variant, &pairs, &closures)?;

    if !graph.id().is_main() {
        if let Some(before_op) = constraints
            .values()
            .flatten()
            .find(|before| produces_graph_output(graph, **before))
        {
            debug!(target: "kiln::pattern", op = %op.debug_name(), before = %before_op, "[Inplacing] constraint with a graph output producer");
            model.rollback(transaction);
            return Ok(None);
        }
    }

    if let Some(reason) = blocking_reason(graph, model, &op, &variant, &pairs, &closures, cfg)? {
        trace!(target: "kiln::pattern", op = %op.debug_name(), variant = %candidate.variant, "[Inplacing] not inplacing: {reason}");
        model.rollback(transaction);
        return Ok(None);
    }

    if !constraints.is_empty() && !graph.is_schedulable(&constraints) {
        debug!(target: "kiln::pattern", op = %op.debug_name(), "[Inplacing] new constraints would create a cycle");
        model.rollback(transaction);
        return Ok(None);
    }

    debug!(target: "kiln::pattern", op = %op.debug_name(), variant = %candidate.variant, "[Inplacing] inplacing");
    let new_op = replace_with_variant(graph, op.id, &candidate.variant, &constraints)?;
    model.commit(transaction);
    model.rename_op(op.id, new_op);
    Ok(Some(new_op))
}

/// Alias sets of the candidate's tensors before its proposal was opened.
struct Closures {
    before: BTreeMap<TensorId, BTreeSet<TensorId>>,
}

impl Closures {
    fn of(&self, tensor: &TensorId) -> BTreeSet<TensorId> {
        self.before
            .get(tensor)
            .cloned()
            .unwrap_or_else(|| BTreeSet::from([tensor.clone()]))
    }
}

fn alias_pairs(variant: &Op) -> Vec<(InIndex, OutIndex)> {
    let mut pairs = Vec::new();
    for (input, _) in variant.input.iter() {
        for (output, _) in variant.output.iter() {
            if variant.aliases(input, output) {
                pairs.push((input, output));
            }
        }
    }
    pairs
}

fn consumers_of_all(graph: &Graph, tensors: &BTreeSet<TensorId>) -> Result<BTreeSet<OpId>> {
    let mut consumers = BTreeSet::new();
    for tensor in tensors {
        if graph.tensors().contains(tensor) {
            consumers.extend(graph.consumers(tensor)?);
        }
    }
    Ok(consumers)
}

/// Ops that must run before `op`: producers of its inputs and constraint predecessors.
fn ancestors(graph: &Graph, op: OpId) -> Result<BTreeSet<OpId>> {
    let mut seen = BTreeSet::new();
    let mut stack = direct_befores(graph, op)?;
    while let Some(current) = stack.pop() {
        if seen.insert(current) {
            stack.extend(direct_befores(graph, current)?);
        }
    }
    Ok(seen)
}

fn direct_befores(graph: &Graph, op: OpId) -> Result<Vec<OpId>> {
    let node = graph.op(op)?;
    let mut befores = graph.topo_cons().befores(op);
    for (_, tensor) in node.input.iter() {
        if let Some(producer) = graph.tensor(tensor)?.producer() {
            befores.push(producer);
        }
    }
    Ok(befores)
}

/// Orderings the inplace variant needs so no reader observes a write it did
/// not observe before.
fn required_constraints(
    graph: &Graph,
    model: &AliasModel,
    op: &Op,
    variant: &Op,
    pairs: &[(InIndex, OutIndex)],
    closures: &Closures,
) -> Result<OpsBeforeKey> {
    let mut edges: BTreeSet<(OpId, OpId)> = BTreeSet::new();

    // Readers of what the variant overwrites go first.
    for index in variant.modified_indices() {
        let clobbered = closures.of(op.in_id(index)?);
        for consumer in consumers_of_all(graph, &clobbered)? {
            if consumer != op.id {
                edges.insert((consumer, op.id));
            }
        }
    }

    if !pairs.is_empty() {
        let upstream = ancestors(graph, op.id)?;
        for (input, output) in pairs {
            let in_closure = closures.of(op.in_id(*input)?);
            let out_closure = closures.of(op.out_id(*output)?);

            // Writers of the input's storage now also write the output.
            for writer in model.writers_of(&in_closure) {
                if writer == op.id || upstream.contains(&writer) {
                    continue;
                }
                for consumer in consumers_of_all(graph, &out_closure)? {
                    if consumer != writer {
                        edges.insert((consumer, writer));
                    }
                }
            }

            // Writers of the output's storage now also write the input.
            for writer in model.writers_of(&out_closure) {
                if writer == op.id {
                    continue;
                }
                for consumer in consumers_of_all(graph, &in_closure)? {
                    if consumer != writer && consumer != op.id {
                        edges.insert((consumer, writer));
                    }
                }
            }
        }
    }

    let mut constraints = OpsBeforeKey::new();
    for (before, after) in edges {
        constraints.entry(after).or_default().push(before);
    }
    Ok(constraints)
}

fn produces_graph_output(graph: &Graph, op: OpId) -> bool {
    graph
        .op(op)
        .map(|node| node.output.iter().any(|(_, tensor)| graph.is_output(tensor)))
        .unwrap_or(false)
}

fn is_restore_inplace_tensor(graph: &Graph, tensor: &TensorId) -> Result<bool> {
    for consumer in graph.consumers(tensor)? {
        if graph.op(consumer)?.flags().restore_inplace {
            return Ok(true);
        }
    }
    Ok(false)
}

fn is_unmodifiable(graph: &Graph, tensor: &TensorId, cfg: &InplaceConfig) -> Result<bool> {
    let node = graph.tensor(tensor)?;
    if matches!(node.tensor_type, TensorType::Const | TensorType::Variable) {
        return Ok(true);
    }
    if is_restore_inplace_tensor(graph, tensor)? {
        return Ok(true);
    }
    if cfg.pipelining {
        if let Some(producer) = node.producer() {
            if graph.op(producer)?.settings.recompute_type == RecomputeType::Checkpoint {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Tensors whose value a recomputation reads again later.
fn is_recompute_tensor(graph: &Graph, tensor: &TensorId, cfg: &InplaceConfig) -> Result<bool> {
    let node = graph.tensor(tensor)?;
    if let Some(producer) = node.producer() {
        if !cfg.explicit_recompute
            && graph.op(producer)?.settings.recompute_type == RecomputeType::Recompute
        {
            return Ok(true);
        }
    }
    for consumer in node.consumers.ops() {
        if graph.op(consumer)?.settings.recompute_type == RecomputeType::Recomputed {
            return Ok(true);
        }
    }
    Ok(false)
}

fn is_conflict_tensor(graph: &Graph, tensor: &TensorId, cfg: &InplaceConfig) -> Result<bool> {
    if is_unmodifiable(graph, tensor, cfg)? || is_recompute_tensor(graph, tensor, cfg)? {
        return Ok(true);
    }
    for consumer in graph.consumers(tensor)? {
        if graph.op(consumer)?.is_ipu_copy() {
            return Ok(true);
        }
    }
    Ok(false)
}

fn any_alias<F>(graph: &Graph, closure: &BTreeSet<TensorId>, mut pred: F) -> Result<bool>
where
    F: FnMut(&TensorId) -> Result<bool>,
{
    for tensor in closure {
        if graph.tensors().contains(tensor) && pred(tensor)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Whether a consumer of any alias of `closure` modifies it.
fn has_aliased_modifiers(graph: &Graph, closure: &BTreeSet<TensorId>) -> Result<bool> {
    any_alias(graph, closure, |tensor| {
        for consumer in graph.consumers(tensor)? {
            let node = graph.op(consumer)?;
            if node.input.indices(tensor).iter().any(|index| node.modifies(*index)) {
                return Ok(true);
            }
        }
        Ok(false)
    })
}

#[allow(clippy::too_many_arguments)]
fn blocking_reason(
    graph: &Graph,
    model: &AliasModel,
    op: &Op,
    variant: &Op,
    pairs: &[(InIndex, OutIndex)],
    closures: &Closures,
    cfg: &InplaceConfig,
) -> Result<Option<String>> {
    for (input, in_tensor) in variant.input.iter() {
        let in_closure = closures.of(in_tensor);
        for (output, out_tensor) in variant.output.iter() {
            let out_closure = closures.of(out_tensor);
            let op_aliases = pairs.contains(&(input, output));

            let restore_in = any_alias(graph, &in_closure, |t| is_restore_inplace_tensor(graph, t))?;
            let restore_out =
                any_alias(graph, &out_closure, |t| is_restore_inplace_tensor(graph, t))?;
            let conflict_in = any_alias(graph, &in_closure, |t| is_conflict_tensor(graph, t, cfg))?;
            let conflict_out =
                any_alias(graph, &out_closure, |t| is_conflict_tensor(graph, t, cfg))?;
            if op_aliases && ((restore_in && conflict_out) || (restore_out && conflict_in)) {
                return Ok(Some(format!(
                    "it aliases a restore-inplace tensor and a tensor consumed by a copy: {in_tensor} -> {out_tensor}"
                )));
            }

            let unmodifiable = any_alias(graph, &in_closure, |t| is_unmodifiable(graph, t, cfg))?;
            let indirect_modify = op_aliases && has_aliased_modifiers(graph, &out_closure)?;
            let direct_modify = variant.modifies(input);
            if unmodifiable && (indirect_modify || direct_modify) {
                return Ok(Some(format!(
                    "it aliases an unmodifiable tensor {in_tensor} that would be modified"
                )));
            }

            if (indirect_modify || direct_modify)
                && any_alias(graph, &in_closure, |t| is_recompute_tensor(graph, t, cfg))?
            {
                return Ok(Some(format!(
                    "{in_tensor} would be modified before a recomputation reads it"
                )));
            }

            if cfg.pipelining
                && (op_aliases || direct_modify)
                && recomputation_conflict(graph, op, in_tensor)?
            {
                return Ok(Some(format!(
                    "of an inplace recomputation conflict between {in_tensor} and {out_tensor}"
                )));
            }
        }
    }

    // A modified input must not alias another input of the same op.
    for (index, tensor) in op.input.iter() {
        if !variant.modifies(index) {
            continue;
        }
        let aliases = model.aliases(tensor);
        for (other_index, other) in op.input.iter() {
            if other_index != index && aliases.contains(other) {
                return Ok(Some(format!(
                    "input {other} is an alias of {tensor} which would be changed inplace"
                )));
            }
        }
    }

    // After the rewrite no downstream op may read two aliases while modifying one.
    let mut groups: BTreeSet<Vec<TensorId>> = BTreeSet::new();
    for (_, in_tensor) in op.input.iter() {
        let aliases = model.aliases(in_tensor);
        let mut group = vec![in_tensor.clone()];
        group.extend(
            op.output
                .iter()
                .filter(|(_, out)| aliases.contains(*out))
                .map(|(_, out)| out.clone()),
        );
        if group.len() > 1 {
            groups.insert(group);
        }
    }
    for group in groups {
        let mut reads: BTreeMap<OpId, BTreeSet<InIndex>> = BTreeMap::new();
        let mut tensors = BTreeSet::new();
        for tensor in &group {
            tensors.extend(closures.of(tensor));
        }
        for tensor in &tensors {
            if !graph.tensors().contains(tensor) {
                continue;
            }
            for consumer in graph.consumers(tensor)? {
                if consumer == op.id {
                    continue;
                }
                let indices = graph.op(consumer)?.input.indices(tensor).to_vec();
                reads.entry(consumer).or_default().extend(indices);
            }
        }
        for (consumer, indices) in reads {
            if indices.len() <= 1 {
                continue;
            }
            let node = graph.op(consumer)?;
            if indices.iter().any(|index| node.modifies(*index)) {
                return Ok(Some(format!(
                    "it would introduce a race in the already inplace {}",
                    node.debug_name()
                )));
            }
        }
    }

    Ok(None)
}

/// A recomputed op writing into a tensor that is not itself recomputed.
fn recomputation_conflict(graph: &Graph, op: &Op, input: &TensorId) -> Result<bool> {
    if op.settings.recompute_type != RecomputeType::Recompute {
        return Ok(false);
    }
    match graph.tensor(input)?.producer() {
        Some(producer) => {
            Ok(graph.op(producer)?.settings.recompute_type != RecomputeType::Recompute)
        }
        None => Ok(true),
    }
}

/// Swaps `op` for an op of kind `variant` wired to the same tensors and adds
/// `constraints` (keyed by the old op id) against the new op.
pub(crate) fn replace_with_variant(
    graph: &mut Graph,
    op: OpId,
    variant: &OperatorIdentifier,
    constraints: &OpsBeforeKey,
) -> Result<OpId> {
    let attrs = graph.op(op)?.attrs.clone();
    let new_op = graph.replace_op(op, variant, attrs)?;
    for (after, befores) in constraints {
        let after = if *after == op { new_op } else { *after };
        for before in befores {
            let before = if *before == op { new_op } else { *before };
            if before != after {
                graph.topo_cons_mut().insert(before, after, false)?;
            }
        }
    }
    Ok(new_op)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    use super::*;
    use crate::ir::ids::GraphId;
    use crate::ir::op::{Attributes, Settings};
    use crate::ir::tensor_info::{DataType, TensorInfo};
    use crate::ops::{default_registry, opids, types, OpDef, OpRegistry, SetupContext};

    fn graph() -> Graph {
        Graph::new(GraphId::main(), default_registry(), Arc::new(AtomicU64::new(0)))
    }

    fn info() -> TensorInfo {
        TensorInfo::new(DataType::Float, vec![2, 2])
    }

    fn unary(g: &mut Graph, opid: OperatorIdentifier, input: &str, output: &str) -> OpId {
        g.create_connected_op(
            &opid,
            Settings::new(GraphId::main(), output),
            Attributes::new(),
            &[(0, TensorId::from(input))],
            &[(0, TensorId::from(output))],
        )
        .unwrap()
    }

    #[test]
    fn single_relu_becomes_inplace() {
        let mut g = graph();
        g.tensors_mut().add_stream(TensorId::from("x"), info()).unwrap();
        unary(&mut g, opids::relu(), "x", "y");
        let stats = apply_inplace(&mut g, &InplaceConfig::default()).unwrap();
        assert_eq!(stats.applied, 1);
        assert!(g.ops().all(|op| op.is(types::RELU_INPLACE)));
    }

    #[test]
    fn other_readers_are_ordered_before_the_writer() {
        let mut g = graph();
        g.tensors_mut().add_stream(TensorId::from("x"), info()).unwrap();
        unary(&mut g, opids::relu(), "x", "a");
        let neg = unary(&mut g, opids::neg(), "x", "b");
        let mut vetoed = g.op(neg).unwrap().settings.clone();
        vetoed.inplace_priority_veto = vec![(types::NEG_INPLACE.to_string(), -1.0)];
        g.op_mut(neg).unwrap().settings = vetoed;

        apply_inplace(&mut g, &InplaceConfig::default()).unwrap();
        let relu = g
            .ops()
            .find(|op| op.is(types::RELU_INPLACE))
            .map(|op| op.id)
            .unwrap();
        assert!(g.topo_cons().contains(neg, relu));
        assert!(g.op(neg).unwrap().is(types::NEG));
    }

    #[test]
    fn constants_are_never_modified() {
        let mut g = graph();
        g.tensors_mut()
            .add_const_init(TensorId::from("c"), info(), vec![1.0; 4])
            .unwrap();
        unary(&mut g, opids::relu(), "c", "y");
        let stats = apply_inplace(&mut g, &InplaceConfig::default()).unwrap();
        assert_eq!(stats.applied, 0);
        assert!(g.ops().all(|op| op.is(types::RELU)));
    }

    #[test]
    fn excluded_ops_stay_outplace() {
        let mut g = graph();
        g.tensors_mut().add_stream(TensorId::from("x"), info()).unwrap();
        let relu = unary(&mut g, opids::relu(), "x", "y");
        g.op_mut(relu)
            .unwrap()
            .settings
            .exclude_patterns
            .insert(names::INPLACE.to_string());
        apply_inplace(&mut g, &InplaceConfig::default()).unwrap();
        assert!(g.op(relu).is_ok());
    }

    #[test]
    fn reader_downstream_of_the_writer_blocks_inplacing() {
        // b = neg(x); c = relu(x); d = add(c, b') where b' depends on c.
        // relu inplace would clobber x while neg(x) reads it after relu.
        let mut g = graph();
        g.tensors_mut().add_stream(TensorId::from("x"), info()).unwrap();
        let relu = unary(&mut g, opids::relu(), "x", "c");
        g.create_connected_op(
            &opids::add(),
            Settings::new(GraphId::main(), "d"),
            Attributes::new(),
            &[(0, TensorId::from("c")), (1, TensorId::from("x"))],
            &[(0, TensorId::from("d"))],
        )
        .unwrap();
        for op in g.op_ids() {
            if op != relu {
                g.op_mut(op)
                    .unwrap()
                    .settings
                    .exclude_patterns
                    .insert(names::INPLACE.to_string());
            }
        }
        let stats = apply_inplace(&mut g, &InplaceConfig::default()).unwrap();
        assert_eq!(stats.applied, 0);
        assert!(g.op(relu).unwrap().is(types::RELU));
    }

    /// x -> relu -> a, with `a` overwritten by a restore and optionally `x`
    /// sent to another partition.
    fn restored_relu(copied: bool) -> (Graph, OpId) {
        let mut g = graph();
        g.tensors_mut().add_stream(TensorId::from("x"), info()).unwrap();
        let relu = unary(&mut g, opids::relu(), "x", "a");
        unary(&mut g, opids::restore_inplace(), "a", "restored");
        if copied {
            unary(&mut g, opids::ipu_copy(), "x", "x_copy");
        }
        (g, relu)
    }

    #[test]
    fn restored_output_of_a_copied_input_stays_outplace() {
        let (mut g, relu) = restored_relu(true);
        let stats = apply_inplace(&mut g, &InplaceConfig::default()).unwrap();
        assert_eq!(stats.candidates, 1);
        assert_eq!(stats.applied, 0);
        assert!(g.op(relu).unwrap().is(types::RELU));

        let (mut g, _) = restored_relu(false);
        let stats = apply_inplace(&mut g, &InplaceConfig::default()).unwrap();
        assert_eq!(stats.applied, 1);
        assert!(g.ops().any(|op| op.is(types::RELU_INPLACE)));
    }

    /// Two copies of its input, advertising a single-output inplace variant.
    struct Fork;

    impl OpDef for Fork {
        fn setup(&self, _op: &Op, cx: &SetupContext) -> Result<Vec<TensorInfo>> {
            let input = cx.input(0)?;
            Ok(vec![input.clone(), input.clone()])
        }

        fn inplace_variants(&self, _op: &Op) -> Vec<(OperatorIdentifier, f32)> {
            vec![(opids::relu_inplace(), 10.0)]
        }
    }

    #[test]
    fn multi_output_candidates_are_rejected_not_fatal() {
        let fork = OperatorIdentifier::kiln("Fork");
        let mut registry = OpRegistry::with_builtins();
        registry.register(fork.clone(), Fork);
        let mut g = Graph::new(GraphId::main(), Arc::new(registry), Arc::new(AtomicU64::new(0)));
        g.tensors_mut().add_stream(TensorId::from("x"), info()).unwrap();
        let op = g
            .create_connected_op(
                &fork,
                Settings::new(GraphId::main(), "fork"),
                Attributes::new(),
                &[(0, TensorId::from("x"))],
                &[(0, TensorId::from("a")), (1, TensorId::from("b"))],
            )
            .unwrap();

        let stats = apply_inplace(&mut g, &InplaceConfig::default()).unwrap();
        assert_eq!(stats.candidates, 1);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.applied, 0);
        assert!(g.op(op).unwrap().is("Fork"));
        assert!(!g.tensor(&TensorId::from("x")).unwrap().is_isolated());
    }
}
