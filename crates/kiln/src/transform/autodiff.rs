//! Backward pass construction.
//!
//! Forward ops on a path to the loss are visited in reverse schedule order.
//! Each asks its kind for gradient op specs; partial gradients of a tensor are
//! summed once every consumer has contributed, and every trainable variable
//! gets an optimizer update reading its final gradient.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::debug;

use crate::error::{Error, Result};
use crate::ir::graph::Graph;
use crate::ir::ids::{reserved, GraphId, OpId, TensorId};
use crate::ir::op::{Attribute, Attributes, Op, RecomputeType, Settings};
use crate::ir::scheduler::{OpsBeforeKey, RequireOptimal};
use crate::ir::tensor::TensorType;
use crate::ir::tensor_info::{DataType, TensorInfo};
use crate::ops::{opids, GradInput, GradOpSpec, SgdVarUpdate};
use crate::session::{Ir, Optimizer};
use crate::transform::{PassResult, Transform};

#[derive(Debug, Clone, Copy, Default)]
pub struct Autodiff;

impl Autodiff {
    pub const NAME: &'static str = "Autodiff";
}

impl Transform for Autodiff {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn apply(&self, ir: &mut Ir, graph: &GraphId) -> Result<PassResult> {
        let loss = ir
            .final_loss()
            .cloned()
            .ok_or_else(|| Error::config("building the backward pass requires a final loss"))?;
        let optimizer = ir
            .optimizer()
            .cloned()
            .ok_or_else(|| Error::config("building the backward pass requires an optimizer"))?;
        let graph = ir.graph_mut(graph)?;
        let mut grower = BackwardGrower::new(graph, loss, optimizer)?;
        let created = grower.grow()?;
        Ok(PassResult {
            changed: created > 0,
            iterations: 1,
            rewrites_applied: created,
            erased_ops: 0,
        })
    }
}

struct BackwardGrower<'g> {
    graph: &'g mut Graph,
    loss: TensorId,
    optimizer: Optimizer,
    to_loss_ops: BTreeSet<OpId>,
    from_variable: BTreeSet<TensorId>,
    partials: BTreeMap<TensorId, Vec<TensorId>>,
    grads: BTreeMap<TensorId, TensorId>,
    created: usize,
}

impl<'g> BackwardGrower<'g> {
    fn new(graph: &'g mut Graph, loss: TensorId, optimizer: Optimizer) -> Result<Self> {
        let to_loss_ops = ops_reaching(graph, &loss)?;
        let from_variable = tensors_from_variables(graph)?;
        Ok(Self {
            graph,
            loss,
            optimizer,
            to_loss_ops,
            from_variable,
            partials: BTreeMap::new(),
            grads: BTreeMap::new(),
            created: 0,
        })
    }

    /// Whether a gradient must be produced for `tensor`.
    fn needs_grad(&self, tensor: &TensorId) -> Result<bool> {
        if !self.from_variable.contains(tensor) {
            return Ok(false);
        }
        let node = self.graph.tensor(tensor)?;
        if !matches!(node.tensor_type, TensorType::ActGrad | TensorType::Variable) {
            return Ok(false);
        }
        Ok(node
            .consumers
            .ops()
            .iter()
            .any(|consumer| self.to_loss_ops.contains(consumer)))
    }

    fn grow(&mut self) -> Result<usize> {
        let loss_info = self.graph.info(&self.loss)?.clone();
        let ones = vec![1.0; loss_info.nelms().max(0) as usize];
        self.graph
            .tensors_mut()
            .add_const_init(self.loss.grad(), loss_info, ones)?;
        self.grads.insert(self.loss.clone(), self.loss.grad());

        let mut schedule = self
            .graph
            .op_schedule(&OpsBeforeKey::new(), RequireOptimal::No)?;
        schedule.reverse();
        for op_id in schedule {
            if self.to_loss_ops.contains(&op_id) {
                self.grow_op(op_id)?;
            }
        }

        for var in self.graph.tensors().of_type(TensorType::Variable) {
            if !self.needs_grad(&var)? {
                continue;
            }
            let Some(grad) = self.finalize(&var)? else {
                continue;
            };
            self.add_var_update(&var, &grad)?;
        }
        self.graph.set_var_update_constraints()?;
        Ok(self.created)
    }

    fn grow_op(&mut self, op_id: OpId) -> Result<()> {
        let outputs: Vec<(usize, TensorId)> = self
            .graph
            .op(op_id)?
            .output
            .iter()
            .map(|(index, tensor)| (index, tensor.clone()))
            .collect();
        let mut out_grads: BTreeMap<usize, TensorId> = BTreeMap::new();
        for (index, tensor) in outputs {
            if let Some(grad) = self.finalize(&tensor)? {
                out_grads.insert(index, grad);
            }
        }
        if out_grads.is_empty() {
            return Ok(());
        }

        let cx = self.graph.setup_context(op_id)?;
        let op = self.graph.op(op_id)?.clone();
        let specs = op.def().grad_ops(&op, &cx)?;
        let n_specs = specs.len();
        for (k, spec) in specs.into_iter().enumerate() {
            let name = if n_specs == 1 {
                format!("{}_grad", op.settings.name)
            } else {
                format!("{}_grad{k}", op.settings.name)
            };
            self.create_grad_op(&op, spec, &out_grads, name)?;
        }
        Ok(())
    }

    fn create_grad_op(
        &mut self,
        op: &Op,
        spec: GradOpSpec,
        out_grads: &BTreeMap<usize, TensorId>,
        name: String,
    ) -> Result<()> {
        let mut outputs = Vec::new();
        for (out_index, grad_of) in &spec.outputs {
            let fwd = op.in_id(*grad_of)?.clone();
            if self.needs_grad(&fwd)? {
                outputs.push((*out_index, fwd));
            }
        }
        if outputs.is_empty() {
            return Ok(());
        }

        let mut inputs = Vec::with_capacity(spec.inputs.len());
        for (index, source) in &spec.inputs {
            let tensor = match source {
                GradInput::FwdIn(i) => op.in_id(*i)?.clone(),
                GradInput::FwdOut(o) => op.out_id(*o)?.clone(),
                GradInput::GradOut(o) => match out_grads.get(o) {
                    Some(grad) => grad.clone(),
                    None => {
                        debug!(target: "kiln::transform", op = %op.debug_name(), output = o, "no gradient reaches this output");
                        return Ok(());
                    }
                },
            };
            inputs.push((*index, tensor));
        }

        let mut partial_outputs = Vec::with_capacity(outputs.len());
        for (out_index, fwd) in outputs {
            let partials = self.partials.entry(fwd.clone()).or_default();
            let partial = fwd.partial_grad(partials.len());
            partials.push(partial.clone());
            partial_outputs.push((out_index, partial));
        }

        let mut settings = op.settings.derived(name);
        settings.recompute_type = RecomputeType::Undefined;
        settings.exclude_patterns.clear();
        self.graph
            .create_connected_op(&spec.opid, settings, spec.attrs, &inputs, &partial_outputs)?;
        self.created += 1;
        Ok(())
    }

    /// Final gradient of `tensor`, summing its partials on first request.
    fn finalize(&mut self, tensor: &TensorId) -> Result<Option<TensorId>> {
        if let Some(grad) = self.grads.get(tensor) {
            return Ok(Some(grad.clone()));
        }
        let partials = self.partials.remove(tensor).unwrap_or_default();
        let grad = tensor.grad();
        match partials.as_slice() {
            [] => return Ok(None),
            [single] => self.graph.rename_tensor(single, grad.clone())?,
            many => {
                let settings = self.sum_settings(tensor, &many[0])?;
                let inputs: Vec<(usize, TensorId)> = many.iter().cloned().enumerate().collect();
                self.graph.create_connected_op(
                    &opids::sum(),
                    settings,
                    Attributes::new(),
                    &inputs,
                    &[(0, grad.clone())],
                )?;
                self.created += 1;
            }
        }
        self.grads.insert(tensor.clone(), grad.clone());
        Ok(Some(grad))
    }

    fn sum_settings(&self, tensor: &TensorId, first_partial: &TensorId) -> Result<Settings> {
        let name = format!("{tensor}_gradsum");
        let template = match self.graph.producer(first_partial)? {
            Some(producer) => producer.settings.derived(name),
            None => Settings::new(self.graph.id().clone(), name),
        };
        Ok(template)
    }

    fn add_var_update(&mut self, var: &TensorId, grad: &TensorId) -> Result<()> {
        let name = format!("{var}_update");
        let mut settings = match self.graph.producer(grad)? {
            Some(producer) => producer.settings.derived(name),
            None => Settings::new(self.graph.id().clone(), name),
        };
        settings.exclude_patterns.clear();

        let mut inputs = vec![
            (SgdVarUpdate::VAR_IN, var.clone()),
            (SgdVarUpdate::GRAD_IN, grad.clone()),
        ];
        let mut attrs = Attributes::new();
        match self.optimizer {
            Optimizer::ConstSgd { learning_rate } => {
                attrs.insert(
                    "learning_rate".to_string(),
                    Attribute::Float(learning_rate),
                );
            }
            Optimizer::Sgd { .. } => {
                let lr = TensorId::new(format!("{}{var}", reserved::LEARNING_RATE));
                self.graph
                    .tensors_mut()
                    .add_stream(lr.clone(), TensorInfo::scalar(DataType::Float))?;
                inputs.push((SgdVarUpdate::LR_IN, lr));
            }
        }
        self.graph.create_connected_op(
            &opids::sgd_var_update(),
            settings,
            attrs,
            &inputs,
            &[(0, var.updated())],
        )?;
        self.created += 1;
        Ok(())
    }
}

/// Ops with a data path to `loss`, the loss producer included.
fn ops_reaching(graph: &Graph, loss: &TensorId) -> Result<BTreeSet<OpId>> {
    let mut reached = BTreeSet::new();
    let mut work = VecDeque::new();
    if let Some(producer) = graph.tensor(loss)?.producer() {
        work.push_back(producer);
    }
    while let Some(op_id) = work.pop_front() {
        if !reached.insert(op_id) {
            continue;
        }
        for tensor in graph.op(op_id)?.input.unique_tensors() {
            if let Some(producer) = graph.tensor(&tensor)?.producer() {
                work.push_back(producer);
            }
        }
    }
    Ok(reached)
}

/// Variables and every tensor computed from one.
fn tensors_from_variables(graph: &Graph) -> Result<BTreeSet<TensorId>> {
    let mut reached = BTreeSet::new();
    let mut work: VecDeque<TensorId> = graph.tensors().of_type(TensorType::Variable).into();
    while let Some(tensor) = work.pop_front() {
        if !reached.insert(tensor.clone()) {
            continue;
        }
        for consumer in graph.consumers(&tensor)? {
            work.extend(graph.op(consumer)?.output.tensors());
        }
    }
    Ok(reached)
}
