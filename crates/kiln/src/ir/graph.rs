use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::error::{Error, Result};
use crate::ir::ids::{GraphId, InIndex, OpId, OutIndex, TensorId, VGraphId};
use crate::ir::op::{Attributes, Op, OperatorIdentifier, RecomputeType, Settings};
use crate::ir::scheduler::{OpsBeforeKey, RequireOptimal, ScheduleNode, ScheduleProblem};
use crate::ir::tensor::{Tensor, TensorType};
use crate::ir::tensor_info::TensorInfo;
use crate::ir::tensors::Tensors;
use crate::ir::topocons::TopoCons;
use crate::ops::{IpuCopy, OpRegistry, SetupContext};

/// Which isolated tensors survive [`Graph::remove_isolated_tensors`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetainFlags {
    /// Graph inputs and outputs.
    pub io: bool,
    pub variables: bool,
    pub consts: bool,
}

impl RetainFlags {
    pub const ALL: RetainFlags = RetainFlags {
        io: true,
        variables: true,
        consts: true,
    };

    pub const IO_ONLY: RetainFlags = RetainFlags {
        io: true,
        variables: false,
        consts: false,
    };
}

/// Owns a set of ops, their tensors and the extra ordering constraints between them.
#[derive(Clone)]
pub struct Graph {
    id: GraphId,
    ops: BTreeMap<OpId, Op>,
    tensors: Tensors,
    topo_cons: TopoCons,
    inputs: Vec<TensorId>,
    outputs: Vec<TensorId>,
    loss: Option<TensorId>,
    registry: Arc<OpRegistry>,
    op_counter: Arc<AtomicU64>,
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("id", &self.id)
            .field("ops", &self.ops.len())
            .field("tensors", &self.tensors.len())
            .field("topo_cons", &self.topo_cons.len())
            .finish()
    }
}

impl Graph {
    pub fn new(id: GraphId, registry: Arc<OpRegistry>, op_counter: Arc<AtomicU64>) -> Self {
        Self {
            id,
            ops: BTreeMap::new(),
            tensors: Tensors::new(),
            topo_cons: TopoCons::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            loss: None,
            registry,
            op_counter,
        }
    }

    pub fn id(&self) -> &GraphId {
        &self.id
    }

    pub fn registry(&self) -> &Arc<OpRegistry> {
        &self.registry
    }

    pub(crate) fn op_counter(&self) -> &Arc<AtomicU64> {
        &self.op_counter
    }

    pub fn ops(&self) -> impl Iterator<Item = &Op> + '_ {
        self.ops.values()
    }

    pub fn op_ids(&self) -> Vec<OpId> {
        self.ops.keys().copied().collect()
    }

    pub fn n_ops(&self) -> usize {
        self.ops.len()
    }

    pub fn contains_op(&self, id: OpId) -> bool {
        self.ops.contains_key(&id)
    }

    pub fn op(&self, id: OpId) -> Result<&Op> {
        self.ops
            .get(&id)
            .ok_or_else(|| Error::not_found(format!("no {id} in graph '{}'", self.id)))
    }

    pub fn op_mut(&mut self, id: OpId) -> Result<&mut Op> {
        let graph = &self.id;
        self.ops
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(format!("no {id} in graph '{graph}'")))
    }

    pub fn tensors(&self) -> &Tensors {
        &self.tensors
    }

    pub fn tensors_mut(&mut self) -> &mut Tensors {
        &mut self.tensors
    }

    pub fn tensor(&self, id: &TensorId) -> Result<&Tensor> {
        self.tensors.get(id)
    }

    pub fn info(&self, id: &TensorId) -> Result<&TensorInfo> {
        Ok(&self.tensors.get(id)?.info)
    }

    pub fn topo_cons(&self) -> &TopoCons {
        &self.topo_cons
    }

    pub fn topo_cons_mut(&mut self) -> &mut TopoCons {
        &mut self.topo_cons
    }

    pub fn inputs(&self) -> &[TensorId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorId] {
        &self.outputs
    }

    pub fn is_input(&self, id: &TensorId) -> bool {
        self.inputs.contains(id)
    }

    pub fn is_output(&self, id: &TensorId) -> bool {
        self.outputs.contains(id)
    }

    /// Creates a producer-less tensor and registers it as a graph input.
    pub fn add_input(&mut self, id: TensorId, info: TensorInfo) -> Result<()> {
        self.tensors
            .insert(Tensor::new(id.clone(), TensorType::ActGrad, info))?;
        self.inputs.push(id);
        Ok(())
    }

    pub fn mark_as_input(&mut self, id: &TensorId) -> Result<()> {
        self.tensors.get(id)?;
        if !self.inputs.contains(id) {
            self.inputs.push(id.clone());
        }
        Ok(())
    }

    pub fn mark_as_output(&mut self, id: &TensorId) -> Result<()> {
        self.tensors.get(id)?;
        self.outputs.push(id.clone());
        Ok(())
    }

    pub fn loss(&self) -> Option<&TensorId> {
        self.loss.as_ref()
    }

    pub fn set_loss(&mut self, loss: Option<TensorId>) {
        self.loss = loss;
    }

    /// Reserves the next id from the counter shared by every graph of the `Ir`.
    pub fn next_op_id(&self) -> OpId {
        OpId(self.op_counter.fetch_add(1, Ordering::Relaxed))
    }

    /// Creates an unconnected op of the registered kind closest to `opid`.
    pub fn create_op(
        &mut self,
        opid: &OperatorIdentifier,
        mut settings: Settings,
        attrs: Attributes,
    ) -> Result<OpId> {
        let (resolved, def) = self.registry.resolve(opid)?;
        settings.graph = self.id.clone();
        let id = self.next_op_id();
        self.ops.insert(id, Op::new(id, resolved, settings, attrs, def));
        trace!(target: "kiln::ir", graph = %self.id, op = %id, kind = %opid, "created op");
        Ok(id)
    }

    /// Creates an op, wires its inputs, creates its (new) output tensors and
    /// runs setup.
    pub fn create_connected_op(
        &mut self,
        opid: &OperatorIdentifier,
        settings: Settings,
        attrs: Attributes,
        inputs: &[(InIndex, TensorId)],
        outputs: &[(OutIndex, TensorId)],
    ) -> Result<OpId> {
        let op = self.create_op(opid, settings, attrs)?;
        for (index, tensor) in inputs {
            self.connect_in(op, *index, tensor)?;
        }
        for (index, tensor) in outputs {
            self.create_and_connect_out(op, *index, tensor.clone())?;
        }
        self.setup_op(op)?;
        Ok(op)
    }

    pub fn connect_in(&mut self, op: OpId, index: InIndex, tensor: &TensorId) -> Result<()> {
        self.tensors.get(tensor)?;
        self.op_mut(op)?.input.insert(index, tensor.clone())?;
        self.tensors.get_mut(tensor)?.consumers.increment(op);
        Ok(())
    }

    pub fn disconnect_in(&mut self, op: OpId, index: InIndex) -> Result<TensorId> {
        let tensor = self.op_mut(op)?.input.erase(index).ok_or_else(|| {
            Error::not_found(format!("{op} has no input at index {index}"))
        })?;
        self.tensors.get_mut(&tensor)?.consumers.decrement(op)?;
        Ok(tensor)
    }

    /// Makes `op` the producer of `tensor`. Stream and Const tensors never have
    /// a producer, and only variable updates or inits may produce a Variable.
    pub fn connect_out(&mut self, op: OpId, index: OutIndex, tensor: &TensorId) -> Result<()> {
        let node = self.op(op)?;
        match self.tensors.get(tensor)?.tensor_type {
            tensor_type @ (TensorType::Stream | TensorType::Const) => {
                return Err(Error::internal(format!(
                    "{} cannot produce '{tensor}': {tensor_type:?} tensors have no producer",
                    node.debug_name()
                )));
            }
            TensorType::Variable if !(node.flags().var_update || node.flags().init) => {
                return Err(Error::internal(format!(
                    "{} cannot produce variable '{tensor}': only variable updates and inits can",
                    node.debug_name()
                )));
            }
            _ => {}
        }
        self.tensors.get_mut(tensor)?.set_producer(op)?;
        self.op_mut(op)?.output.insert(index, tensor.clone())
    }

    pub fn create_and_connect_out(&mut self, op: OpId, index: OutIndex, tensor: TensorId) -> Result<()> {
        self.tensors.add_act_grad(tensor.clone())?;
        self.connect_out(op, index, &tensor)
    }

    pub fn disconnect_out(&mut self, op: OpId, index: OutIndex) -> Result<TensorId> {
        let tensor = self.op_mut(op)?.output.erase(index).ok_or_else(|| {
            Error::not_found(format!("{op} has no output at index {index}"))
        })?;
        self.tensors.get_mut(&tensor)?.clear_producer();
        Ok(tensor)
    }

    pub fn disconnect_all_inputs(&mut self, op: OpId) -> Result<Vec<(InIndex, TensorId)>> {
        let indices: Vec<InIndex> = self.op(op)?.input.iter().map(|(i, _)| i).collect();
        indices
            .into_iter()
            .map(|index| Ok((index, self.disconnect_in(op, index)?)))
            .collect()
    }

    pub fn disconnect_all_outputs(&mut self, op: OpId) -> Result<Vec<(OutIndex, TensorId)>> {
        let indices: Vec<OutIndex> = self.op(op)?.output.iter().map(|(i, _)| i).collect();
        indices
            .into_iter()
            .map(|index| Ok((index, self.disconnect_out(op, index)?)))
            .collect()
    }

    pub fn setup_context(&self, op: OpId) -> Result<SetupContext> {
        let op = self.op(op)?;
        let mut cx = SetupContext::default();
        for (index, tensor) in op.input.iter() {
            cx.inputs.insert(index, self.tensors.get(tensor)?.info.clone());
        }
        for (index, tensor) in op.output.iter() {
            cx.outputs.insert(index, self.tensors.get(tensor)?.info.clone());
        }
        Ok(cx)
    }

    /// Recomputes the infos of every connected output of `op`.
    pub fn setup_op(&mut self, op: OpId) -> Result<()> {
        let cx = self.setup_context(op)?;
        let node = self.op(op)?;
        let infos = node
            .def()
            .setup(node, &cx)
            .map_err(|err| err.context(format!("setting up {}", node.debug_name())))?;
        let outputs: Vec<(OutIndex, TensorId)> = node
            .output
            .iter()
            .map(|(index, tensor)| (index, tensor.clone()))
            .collect();
        for (index, tensor) in outputs {
            let Some(info) = infos.get(index) else {
                return Err(Error::internal(format!(
                    "setup of {op} produced no info for output {index}"
                )));
            };
            self.tensors.get_mut(&tensor)?.info = info.clone();
        }
        Ok(())
    }

    /// Disconnects and removes `op`, dropping its constraints. Output tensors stay.
    pub fn erase_op(&mut self, op: OpId) -> Result<Op> {
        self.disconnect_all_inputs(op)?;
        self.disconnect_all_outputs(op)?;
        self.topo_cons.remove(op);
        let removed = self
            .ops
            .remove(&op)
            .ok_or_else(|| Error::not_found(format!("no {op} in graph '{}'", self.id)))?;
        trace!(target: "kiln::ir", graph = %self.id, op = %op, "erased op");
        Ok(removed)
    }

    /// Replaces `op` by a new op of kind `opid` wired to the same tensors at the
    /// same indices. Constraints move to the new op.
    pub fn replace_op(&mut self, op: OpId, opid: &OperatorIdentifier, attrs: Attributes) -> Result<OpId> {
        let settings = self.op(op)?.settings.clone();
        let new_op = self.create_op(opid, settings, attrs)?;
        let inputs = self.disconnect_all_inputs(op)?;
        let outputs = self.disconnect_all_outputs(op)?;
        for (index, tensor) in &inputs {
            self.connect_in(new_op, *index, tensor)?;
        }
        for (index, tensor) in &outputs {
            self.connect_out(new_op, *index, tensor)?;
        }
        self.topo_cons.transfer(op, new_op)?;
        self.erase_op(op)?;
        self.setup_op(new_op)?;
        Ok(new_op)
    }

    /// Rewires every consumer (and graph output slot) of `from` to read `to`.
    pub fn replace_all_uses(&mut self, from: &TensorId, to: &TensorId) -> Result<()> {
        if from == to {
            return Ok(());
        }
        self.tensors.get(to)?;
        for consumer in self.tensors.get(from)?.consumers.ops() {
            let indices = self.op(consumer)?.input.indices(from).to_vec();
            for index in indices {
                self.disconnect_in(consumer, index)?;
                self.connect_in(consumer, index, to)?;
            }
        }
        for output in self.outputs.iter_mut() {
            if output == from {
                *output = to.clone();
            }
        }
        Ok(())
    }

    /// Gives a tensor a new id, updating every op that references it.
    pub fn rename_tensor(&mut self, from: &TensorId, to: TensorId) -> Result<()> {
        if self.tensors.contains(&to) {
            return Err(Error::collision(format!(
                "cannot rename '{from}': tensor '{to}' already exists"
            )));
        }
        let mut tensor = self.tensors.remove(from)?;
        tensor.id = to.clone();
        let producer = tensor.producer();
        let consumers = tensor.consumers.ops();
        self.tensors.insert(tensor)?;

        if let Some(producer) = producer {
            let node = self.op_mut(producer)?;
            for index in node.output.indices(from).to_vec() {
                node.output.erase(index);
                node.output.insert(index, to.clone())?;
            }
        }
        for consumer in consumers {
            let node = self.op_mut(consumer)?;
            for index in node.input.indices(from).to_vec() {
                node.input.erase(index);
                node.input.insert(index, to.clone())?;
            }
        }
        for id in self.inputs.iter_mut().chain(self.outputs.iter_mut()) {
            if id == from {
                *id = to.clone();
            }
        }
        if self.loss.as_ref() == Some(from) {
            self.loss = Some(to);
        }
        Ok(())
    }

    pub fn producer(&self, tensor: &TensorId) -> Result<Option<&Op>> {
        match self.tensors.get(tensor)?.producer() {
            Some(op) => Ok(Some(self.op(op)?)),
            None => Ok(None),
        }
    }

    pub fn consumers(&self, tensor: &TensorId) -> Result<Vec<OpId>> {
        Ok(self.tensors.get(tensor)?.consumers.ops())
    }

    /// Data dependencies plus topological constraints plus `extra`.
    pub fn schedule_problem(&self, extra: &OpsBeforeKey) -> ScheduleProblem {
        let mut problem = ScheduleProblem::new();
        for op in self.ops.values() {
            problem.add_node(ScheduleNode {
                id: op.id,
                priority: op.settings.schedule_priority,
                execution_phase: op.settings.execution_phase,
                batch_serialized_phase: op.settings.batch_serialized_phase,
            });
        }
        for op in self.ops.values() {
            for (_, tensor) in op.input.iter() {
                if let Some(producer) = self.tensors.get(tensor).ok().and_then(Tensor::producer) {
                    problem.add_edge(producer, op.id);
                }
            }
        }
        for (before, after, tied) in self.topo_cons.all() {
            if tied {
                problem.add_tied_edge(before, after);
            } else {
                problem.add_edge(before, after);
            }
        }
        problem.add_ops_before_key(extra);
        problem
    }

    pub fn op_schedule(&self, extra: &OpsBeforeKey, mode: RequireOptimal) -> Result<Vec<OpId>> {
        self.schedule_problem(extra)
            .solve(mode)
            .map_err(|err| err.context(format!("scheduling graph '{}'", self.id)))
    }

    pub fn is_schedulable(&self, extra: &OpsBeforeKey) -> bool {
        self.schedule_problem(extra).is_schedulable()
    }

    /// Graphs called by ops of this graph.
    pub fn called_graphs(&self) -> BTreeSet<GraphId> {
        self.ops
            .values()
            .flat_map(|op| op.called_graphs())
            .collect()
    }

    /// Makes every op modifying a variable run after the variable's other readers.
    pub fn set_var_update_constraints(&mut self) -> Result<usize> {
        let mut added = 0;
        for var in self.tensors.of_type(TensorType::Variable) {
            let consumers = self.tensors.get(&var)?.consumers.ops();
            let mut modifiers = Vec::new();
            let mut readers = Vec::new();
            for consumer in consumers {
                let op = self.op(consumer)?;
                let modifies = op
                    .input
                    .indices(&var)
                    .iter()
                    .any(|index| op.modifies(*index));
                if modifies {
                    modifiers.push(consumer);
                } else {
                    readers.push(consumer);
                }
            }
            for modifier in &modifiers {
                for reader in &readers {
                    if !self.topo_cons.contains(*reader, *modifier) {
                        self.topo_cons.insert(*reader, *modifier, false)?;
                        added += 1;
                    }
                }
            }
        }
        Ok(added)
    }

    /// Removes tensors with neither producer nor consumers, except those retained.
    pub fn remove_isolated_tensors(
        &mut self,
        retain: RetainFlags,
        anchors: &BTreeSet<TensorId>,
    ) -> Result<usize> {
        let doomed: Vec<TensorId> = self
            .tensors
            .iter()
            .filter(|tensor| tensor.is_isolated())
            .filter(|tensor| {
                let io = self.inputs.contains(&tensor.id) || self.outputs.contains(&tensor.id);
                !(retain.io && io)
                    && !(retain.variables && tensor.tensor_type == TensorType::Variable)
                    && !(retain.consts && tensor.tensor_type == TensorType::Const)
                    && !anchors.contains(&tensor.id)
                    && self.loss.as_ref() != Some(&tensor.id)
            })
            .map(|tensor| tensor.id.clone())
            .collect();
        for id in &doomed {
            self.tensors.remove(id)?;
            self.inputs.retain(|input| input != id);
            self.outputs.retain(|output| output != id);
        }
        if !doomed.is_empty() {
            trace!(target: "kiln::ir", graph = %self.id, removed = doomed.len(), "removed isolated tensors");
        }
        Ok(doomed.len())
    }

    /// Partition a tensor lives on: its producer's, the destination of a copy,
    /// or for producer-less tensors the lowest partition reading it.
    pub fn tensor_vgraph_id(&self, id: &TensorId) -> Result<Option<VGraphId>> {
        let tensor = self.tensors.get(id)?;
        if let Some(producer) = tensor.producer() {
            let op = self.op(producer)?;
            if op.is_ipu_copy() {
                return Ok(IpuCopy::dest_ipu(op));
            }
            return Ok(op.settings.vgraph_id);
        }
        let mut best: Option<VGraphId> = None;
        for consumer in tensor.consumers.ops() {
            let op = self.op(consumer)?;
            let candidates: Vec<Option<VGraphId>> = if op.is_ipu_copy() {
                op.input
                    .indices(id)
                    .iter()
                    .map(|index| IpuCopy::source_ipu(op, *index))
                    .collect()
            } else {
                vec![op.settings.vgraph_id]
            };
            for vgid in candidates.into_iter().flatten() {
                best = Some(best.map_or(vgid, |b| b.min(vgid)));
            }
        }
        Ok(best)
    }

    pub fn has_user_recompute_ops(&self) -> bool {
        self.ops
            .values()
            .any(|op| op.settings.recompute_type == RecomputeType::Recompute)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::tensor_info::DataType;
    use crate::ops::{default_registry, opids};

    fn graph() -> Graph {
        Graph::new(GraphId::main(), default_registry(), Arc::new(AtomicU64::new(0)))
    }

    fn info() -> TensorInfo {
        TensorInfo::new(DataType::Float, vec![4])
    }

    #[test]
    fn connected_op_sets_up_outputs_and_bookkeeping() {
        let mut g = graph();
        let x = TensorId::from("x");
        g.tensors_mut().add_stream(x.clone(), info()).unwrap();
        let relu = g
            .create_connected_op(
                &opids::relu(),
                Settings::new(GraphId::main(), "relu"),
                Attributes::new(),
                &[(0, x.clone())],
                &[(0, TensorId::from("y"))],
            )
            .unwrap();
        let y = g.tensor(&TensorId::from("y")).unwrap();
        assert_eq!(y.producer(), Some(relu));
        assert_eq!(y.info, info());
        assert_eq!(g.tensor(&x).unwrap().consumers.n(relu), 1);
    }

    #[test]
    fn erase_op_leaves_no_dangling_references() {
        let mut g = graph();
        let x = TensorId::from("x");
        g.tensors_mut().add_stream(x.clone(), info()).unwrap();
        let a = g
            .create_connected_op(
                &opids::relu(),
                Settings::new(GraphId::main(), ""),
                Attributes::new(),
                &[(0, x.clone())],
                &[(0, TensorId::from("a"))],
            )
            .unwrap();
        let b = g
            .create_connected_op(
                &opids::neg(),
                Settings::new(GraphId::main(), ""),
                Attributes::new(),
                &[(0, x.clone())],
                &[(0, TensorId::from("b"))],
            )
            .unwrap();
        g.topo_cons_mut().insert(a, b, false).unwrap();
        g.erase_op(a).unwrap();
        assert!(g.op(a).is_err());
        assert!(!g.topo_cons().has_constraints(b));
        assert!(!g.tensor(&TensorId::from("a")).unwrap().has_producer());
        assert_eq!(g.tensor(&x).unwrap().consumers.ops(), vec![b]);
    }

    #[test]
    fn rename_updates_producer_and_consumers() {
        let mut g = graph();
        let x = TensorId::from("x");
        g.tensors_mut().add_stream(x.clone(), info()).unwrap();
        let a = g
            .create_connected_op(
                &opids::relu(),
                Settings::new(GraphId::main(), ""),
                Attributes::new(),
                &[(0, x.clone())],
                &[(0, TensorId::from("a"))],
            )
            .unwrap();
        let b = g
            .create_connected_op(
                &opids::neg(),
                Settings::new(GraphId::main(), ""),
                Attributes::new(),
                &[(0, TensorId::from("a"))],
                &[(0, TensorId::from("b"))],
            )
            .unwrap();
        g.rename_tensor(&TensorId::from("a"), TensorId::from("a2")).unwrap();
        assert_eq!(g.op(a).unwrap().out_id(0).unwrap().as_str(), "a2");
        assert_eq!(g.op(b).unwrap().in_id(0).unwrap().as_str(), "a2");
        assert!(g.tensor(&TensorId::from("a")).is_err());
    }

    #[test]
    fn producers_respect_tensor_roles() {
        let mut g = graph();
        let x = TensorId::from("x");
        g.tensors_mut().add_stream(x.clone(), info()).unwrap();
        g.tensors_mut().add_stream(TensorId::from("s"), info()).unwrap();
        g.tensors_mut()
            .add_const_init(TensorId::from("c"), info(), vec![0.0; 4])
            .unwrap();
        g.tensors_mut()
            .add_var_init(TensorId::from("w"), info(), vec![0.0; 4])
            .unwrap();
        g.tensors_mut().add_act_grad(TensorId::from("a")).unwrap();

        let relu = g
            .create_op(&opids::relu(), Settings::new(GraphId::main(), "relu"), Attributes::new())
            .unwrap();
        g.connect_in(relu, 0, &x).unwrap();
        for rejected in ["s", "c", "w"] {
            let id = TensorId::from(rejected);
            let err = g.connect_out(relu, 0, &id).unwrap_err();
            assert_eq!(err.kind(), crate::error::ErrorKind::Internal, "{rejected}");
            assert!(!g.tensor(&id).unwrap().has_producer());
        }
        assert!(g.op(relu).unwrap().output.is_empty());
        g.connect_out(relu, 0, &TensorId::from("a")).unwrap();

        let update = g
            .create_op(
                &opids::sgd_var_update(),
                Settings::new(GraphId::main(), "update"),
                Attributes::new(),
            )
            .unwrap();
        g.connect_out(update, 0, &TensorId::from("w")).unwrap();
        assert_eq!(g.tensor(&TensorId::from("w")).unwrap().producer(), Some(update));
    }

    #[test]
    fn isolated_removal_respects_retention() {
        let mut g = graph();
        g.tensors_mut()
            .add_const_init(TensorId::from("c"), info(), vec![0.0; 4])
            .unwrap();
        g.tensors_mut().add_act_grad(TensorId::from("orphan")).unwrap();
        let removed = g
            .remove_isolated_tensors(RetainFlags::ALL, &BTreeSet::new())
            .unwrap();
        assert_eq!(removed, 1);
        assert!(g.tensors().contains(&TensorId::from("c")));
        let removed = g
            .remove_isolated_tensors(RetainFlags::IO_ONLY, &BTreeSet::new())
            .unwrap();
        assert_eq!(removed, 1);
        assert!(g.tensors().is_empty());
    }
}
