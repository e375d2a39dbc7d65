use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::error::Result;
use crate::ir::graph::Graph;
use crate::ir::ids::{GraphId, InIndex, OpId, OutIndex, TensorId};
use crate::ir::op::{Attribute, Attributes, ExecutionContext, Op, RecomputeType};
use crate::ir::scheduler::{OpsBeforeKey, RequireOptimal};
use crate::ir::tensor_info::TensorInfo;
use crate::ops::opids;
use crate::session::Ir;
use crate::transform::{PassResult, Transform};

/// Longest run of ops considered for one subgraph.
const MAX_SEQUENCE: usize = 32;

/// Replaces repeated runs of equivalent ops by calls to one shared subgraph.
///
/// Each round outlines the longest run, in schedule order, that occurs at
/// least twice without overlapping itself. Rounds repeat until no run of two
/// or more ops repeats.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubgraphOutline;

impl SubgraphOutline {
    pub const NAME: &'static str = "SubgraphOutline";
}

impl Transform for SubgraphOutline {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn apply(&self, ir: &mut Ir, graph: &GraphId) -> Result<PassResult> {
        let protected = ir.protected_tensors();
        let mut result = PassResult::unchanged();
        loop {
            result.iterations += 1;
            let Some((signature, instances)) = find_repeat(ir.graph(graph)?)? else {
                break;
            };
            result.erased_ops += outline(ir, graph, &signature, &instances, &protected)?;
            result.rewrites_applied += 1;
            result.changed = true;
        }
        Ok(result)
    }
}

/// Where an op of a run reads one of its inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Source {
    /// Output `index` of the op at `position` in the run.
    Internal { position: usize, index: OutIndex },
    /// External input number `n` of the run.
    External(usize),
}

/// Canonical form of a run: equal signatures compute the same function.
#[derive(Debug, Clone, PartialEq)]
struct Signature {
    keys: Vec<String>,
    wiring: Vec<Vec<(InIndex, Source)>>,
    external_infos: Vec<TensorInfo>,
}

#[derive(Debug, Clone)]
struct Instance {
    start: usize,
    ops: Vec<OpId>,
    externals: Vec<TensorId>,
}

fn outlinable(graph: &Graph, op: &Op) -> bool {
    let flags = op.flags();
    !(flags.side_effect
        || flags.var_update
        || flags.init
        || flags.ipu_copy
        || flags.subgraph
        || flags.loss
        || flags.restore_inplace)
        && !op.modifies_any()
        && op.output.n() > 0
        && op.settings.recompute_type != RecomputeType::Recompute
        && !graph.topo_cons().has_constraints(op.id)
}

fn signature(
    graph: &Graph,
    keys: &[Option<String>],
    schedule: &[OpId],
    start: usize,
    len: usize,
) -> Result<Option<(Signature, Instance)>> {
    let ops = &schedule[start..start + len];
    let placement = graph.op(ops[0])?.placement();
    let mut produced: BTreeMap<&TensorId, (usize, OutIndex)> = BTreeMap::new();
    let mut externals: Vec<TensorId> = Vec::new();
    let mut sig = Signature {
        keys: Vec::with_capacity(len),
        wiring: Vec::with_capacity(len),
        external_infos: Vec::new(),
    };

    for (position, id) in ops.iter().enumerate() {
        let Some(key) = &keys[start + position] else {
            return Ok(None);
        };
        let op = graph.op(*id)?;
        if op.placement() != placement {
            return Ok(None);
        }
        let mut inputs = Vec::with_capacity(op.input.n());
        for (index, tensor) in op.input.iter() {
            let source = match produced.get(tensor) {
                Some((position, out)) => Source::Internal {
                    position: *position,
                    index: *out,
                },
                None => match externals.iter().position(|known| known == tensor) {
                    Some(n) => Source::External(n),
                    None => {
                        externals.push(tensor.clone());
                        Source::External(externals.len() - 1)
                    }
                },
            };
            inputs.push((index, source));
        }
        for (index, tensor) in op.output.iter() {
            produced.insert(tensor, (position, index));
        }
        sig.keys.push(key.clone());
        sig.wiring.push(inputs);
    }
    for tensor in &externals {
        sig.external_infos.push(graph.info(tensor)?.clone());
    }
    Ok(Some((
        sig,
        Instance {
            start,
            ops: ops.to_vec(),
            externals,
        },
    )))
}

/// Longest run with at least two non-overlapping occurrences, with those
/// occurrences in schedule order.
fn find_repeat(graph: &Graph) -> Result<Option<(Signature, Vec<Instance>)>> {
    let schedule = graph.op_schedule(&OpsBeforeKey::new(), RequireOptimal::No)?;
    let mut keys = Vec::with_capacity(schedule.len());
    for id in &schedule {
        let op = graph.op(*id)?;
        keys.push(if outlinable(graph, op) {
            op.def().subgraph_equiv_id(op)
        } else {
            None
        });
    }

    let longest = (schedule.len() / 2).min(MAX_SEQUENCE);
    for len in (2..=longest).rev() {
        let mut groups: Vec<(Signature, Vec<Instance>)> = Vec::new();
        for start in 0..=schedule.len() - len {
            let Some((sig, instance)) = signature(graph, &keys, &schedule, start, len)? else {
                continue;
            };
            match groups.iter_mut().find(|(known, _)| *known == sig) {
                Some((_, instances)) => {
                    let free = instances
                        .last()
                        .map_or(true, |last| last.start + len <= start);
                    if free {
                        instances.push(instance);
                    }
                }
                None => groups.push((sig, vec![instance])),
            }
        }
        let mut best: Option<(Signature, Vec<Instance>)> = None;
        for (sig, instances) in groups {
            let better = best
                .as_ref()
                .map_or(true, |(_, current)| instances.len() > current.len());
            if instances.len() >= 2 && better {
                best = Some((sig, instances));
            }
        }
        if best.is_some() {
            return Ok(best);
        }
    }
    Ok(None)
}

fn body_tensor(body: &GraphId, position: usize, index: OutIndex) -> TensorId {
    body.scoped(&format!("t{position}_{index}"))
}

/// Builds the shared subgraph and swaps every instance for a call to it.
/// Returns the number of erased ops.
fn outline(
    ir: &mut Ir,
    graph_id: &GraphId,
    signature: &Signature,
    instances: &[Instance],
    protected: &BTreeSet<TensorId>,
) -> Result<usize> {
    let graph = ir.graph(graph_id)?;

    // Outputs any instance needs outside its own run.
    let mut escaping: BTreeSet<(usize, OutIndex)> = BTreeSet::new();
    for instance in instances {
        let members: BTreeSet<OpId> = instance.ops.iter().copied().collect();
        for (position, id) in instance.ops.iter().enumerate() {
            for (index, tensor) in graph.op(*id)?.output.iter() {
                let read_outside = graph
                    .consumers(tensor)?
                    .iter()
                    .any(|consumer| !members.contains(consumer));
                if read_outside || graph.is_output(tensor) || protected.contains(tensor) {
                    escaping.insert((position, index));
                }
            }
        }
    }
    let escaping: Vec<(usize, OutIndex)> = escaping.into_iter().collect();
    let template = instances[0]
        .ops
        .iter()
        .map(|id| graph.op(*id).cloned())
        .collect::<Result<Vec<Op>>>()?;

    let mut n = 0;
    let body_id = loop {
        let candidate = GraphId::new(format!("outline_{n}"));
        if !ir.has_graph(&candidate) {
            break candidate;
        }
        n += 1;
    };
    let body = ir.create_graph(body_id.clone())?;
    let mut inputs = Vec::with_capacity(signature.external_infos.len());
    for (n, info) in signature.external_infos.iter().enumerate() {
        let id = body_id.scoped(&format!("in{n}"));
        body.add_input(id.clone(), info.clone())?;
        inputs.push(id);
    }
    for (position, op) in template.iter().enumerate() {
        let mut settings = op.settings.derived(op.settings.name.clone());
        settings.execution_context = ExecutionContext::Subgraph;
        let copy = body.create_op(&op.opid, settings, op.attrs.clone())?;
        for (index, source) in &signature.wiring[position] {
            let tensor = match source {
                Source::Internal { position, index } => body_tensor(&body_id, *position, *index),
                Source::External(n) => inputs[*n].clone(),
            };
            body.connect_in(copy, *index, &tensor)?;
        }
        for (index, _) in op.output.iter() {
            body.create_and_connect_out(copy, index, body_tensor(&body_id, position, index))?;
        }
        body.setup_op(copy)?;
    }
    for (position, index) in &escaping {
        body.mark_as_output(&body_tensor(&body_id, *position, *index))?;
    }

    let graph = ir.graph_mut(graph_id)?;
    let mut erased = 0;
    for instance in instances {
        let mut outputs = Vec::with_capacity(escaping.len());
        for (position, index) in &escaping {
            outputs.push(graph.op(instance.ops[*position])?.out_id(*index)?.clone());
        }
        let settings = graph
            .op(instance.ops[0])?
            .settings
            .derived(format!("Call_{body_id}"));
        let mut internal = Vec::new();
        for id in &instance.ops {
            let op = graph.erase_op(*id)?;
            internal.extend(op.output.tensors());
            erased += 1;
        }

        let mut attrs = Attributes::new();
        attrs.insert("callee".to_string(), Attribute::Graph(body_id.clone()));
        let call = graph.create_op(&opids::call(), settings, attrs)?;
        for (n, tensor) in instance.externals.iter().enumerate() {
            graph.connect_in(call, n, tensor)?;
        }
        for (n, tensor) in outputs.iter().enumerate() {
            graph.connect_out(call, n, tensor)?;
        }
        graph.setup_op(call)?;
        for tensor in internal {
            if !outputs.contains(&tensor) && graph.tensor(&tensor)?.is_isolated() {
                graph.tensors_mut().remove(&tensor)?;
            }
        }
    }
    debug!(
        target: "kiln::transform",
        graph = %graph_id,
        subgraph = %body_id,
        ops = template.len(),
        instances = instances.len(),
        "outlined"
    );
    Ok(erased)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::op::Settings;
    use crate::ir::tensor_info::DataType;
    use crate::model::Model;
    use crate::ops::{opids, types};
    use crate::session::IrBundle;

    fn info() -> TensorInfo {
        TensorInfo::new(DataType::Float, vec![4])
    }

    /// `blocks` repetitions of exp -> sigmoid, chained.
    fn blocks(ir: &mut Ir, blocks: usize) {
        let main = ir.main_graph_mut().unwrap();
        main.tensors_mut().add_stream(TensorId::from("x0"), info()).unwrap();
        main.mark_as_input(&TensorId::from("x0")).unwrap();
        for block in 0..blocks {
            let input = TensorId::new(format!("x{block}"));
            let mid = TensorId::new(format!("e{block}"));
            let output = TensorId::new(format!("x{}", block + 1));
            for (opid, from, to) in [(opids::exp(), &input, &mid), (opids::sigmoid(), &mid, &output)] {
                main.create_connected_op(
                    &opid,
                    Settings::new(GraphId::main(), format!("{to}")),
                    Attributes::new(),
                    &[(0, from.clone())],
                    &[(0, to.clone())],
                )
                .unwrap();
            }
        }
        main.mark_as_output(&TensorId::new(format!("x{blocks}"))).unwrap();
    }

    #[test]
    fn repeated_blocks_become_calls_to_one_subgraph() {
        let mut ir = Ir::new(IrBundle::new(Model::default()));
        blocks(&mut ir, 3);
        let result = SubgraphOutline.apply(&mut ir, &GraphId::main()).unwrap();
        assert!(result.changed);
        assert_eq!(result.rewrites_applied, 1);

        let main = ir.main_graph().unwrap();
        assert_eq!(main.n_ops(), 3);
        assert!(main.ops().all(|op| op.is(types::CALL)));
        assert!(!main.tensors().contains(&TensorId::from("e1")));
        let callee = GraphId::from("outline_0");
        let body = ir.graph(&callee).unwrap();
        assert_eq!(body.n_ops(), 2);
        assert_eq!(body.inputs().len(), 1);
        assert_eq!(body.outputs().len(), 1);
        assert!(body
            .ops()
            .all(|op| op.settings.execution_context == ExecutionContext::Subgraph));

        ir.verify_connectivity().unwrap();
        ir.verify_tensor_infos().unwrap();
        let order = ir.graph_schedule().unwrap();
        assert_eq!(order, vec![callee, GraphId::main()]);
        let last = main.producer(&TensorId::from("x3")).unwrap().unwrap();
        assert_eq!(last.in_id(0).unwrap().as_str(), "x2");
    }

    #[test]
    fn unique_sequences_stay_inline() {
        let mut ir = Ir::new(IrBundle::new(Model::default()));
        blocks(&mut ir, 1);
        let result = SubgraphOutline.apply(&mut ir, &GraphId::main()).unwrap();
        assert!(!result.changed);
        assert_eq!(ir.main_graph().unwrap().n_ops(), 2);
        assert_eq!(ir.graph_ids(), vec![GraphId::main()]);
    }

    #[test]
    fn constrained_ops_are_never_outlined() {
        let mut ir = Ir::new(IrBundle::new(Model::default()));
        blocks(&mut ir, 2);
        let main = ir.main_graph_mut().unwrap();
        let first = main.op_ids()[0];
        let second = main.op_ids()[1];
        main.topo_cons_mut().insert(first, second, false).unwrap();
        let third = main.op_ids()[2];
        let fourth = main.op_ids()[3];
        main.topo_cons_mut().insert(third, fourth, false).unwrap();

        let result = SubgraphOutline.apply(&mut ir, &GraphId::main()).unwrap();
        assert!(!result.changed);
        assert_eq!(ir.main_graph().unwrap().n_ops(), 4);
    }
}
