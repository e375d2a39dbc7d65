use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use tracing::{debug, info, info_span, warn};

use crate::env;
use crate::error::{Error, Result};
use crate::hashing::{combine, fingerprint_json};
use crate::ir::graph::{Graph, RetainFlags};
use crate::ir::ids::{GraphId, OpId, TensorId};
use crate::ir::scheduler::{OpsBeforeKey, RequireOptimal};
use crate::ir::tensor::{LossPath, Tensor, Vertex};
use crate::model::{import_model, Model};
use crate::ops::{default_registry, OpRegistry};
use crate::pattern::Patterns;
use crate::session::dataflow::{AnchorReturnType, DataFlow, InputShapeInfo};
use crate::session::device::DeviceInfo;
use crate::session::optimizer::Optimizer;
use crate::session::options::{
    BatchSerializationContext, RecomputationType, SessionOptions, VirtualGraphMode,
};
use crate::transform::{
    auto_annotate, run_steps, run_transform, AutoVirtualGraph, Autodiff, BatchSerialize,
    ConstExprFolding, ExplicitRecompute, InferPipelineStages, Inplace, InterIpuCopy,
    MergeDuplicateOps, PassResult, Pipeline, PipelineBuilder, PreAliasPatterns, Prune,
    SubgraphOutline, Transform, TransformRegistry, UpdateInplacePrioritiesForIpu,
};

/// Upper bound on rounds of the constant folding / pre-alias fixed point.
const FOLD_FIXED_POINT_ITERS: usize = 16;

/// Where an `Ir` is in its single pass through [`Ir::prepare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PreparePhase {
    #[default]
    Unprepared,
    InProgress,
    Prepared,
}

/// Everything `prepare` consumes, gathered before the `Ir` is built.
#[derive(Debug, Clone)]
pub struct IrBundle {
    pub model: Model,
    pub data_flow: DataFlow,
    pub input_shapes: InputShapeInfo,
    pub options: SessionOptions,
    pub patterns: Patterns,
    pub device: DeviceInfo,
    /// Scalar loss tensor; together with `optimizer` it enables training.
    pub loss: Option<TensorId>,
    pub optimizer: Option<Optimizer>,
    /// Bundle hashes of previously prepared programs.
    pub cached_hashes: BTreeSet<u64>,
    pub registry: Arc<OpRegistry>,
}

impl IrBundle {
    pub fn new(model: Model) -> Self {
        Self {
            model,
            data_flow: DataFlow::default(),
            input_shapes: InputShapeInfo::default(),
            options: SessionOptions::default(),
            patterns: Patterns::default(),
            device: DeviceInfo::default(),
            loss: None,
            optimizer: None,
            cached_hashes: BTreeSet::new(),
            registry: default_registry(),
        }
    }

    pub fn with_data_flow(mut self, data_flow: DataFlow) -> Self {
        self.data_flow = data_flow;
        self
    }

    /// Anchors every output the model declares on its main graph.
    pub fn anchor_outputs(mut self, art: AnchorReturnType) -> Self {
        for output in &self.model.graph.outputs {
            self.data_flow
                .anchors
                .insert(TensorId::from(output.name.as_str()), art);
        }
        self
    }

    pub fn with_input_shapes(mut self, input_shapes: InputShapeInfo) -> Self {
        self.input_shapes = input_shapes;
        self
    }

    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_patterns(mut self, patterns: Patterns) -> Self {
        self.patterns = patterns;
        self
    }

    pub fn with_device(mut self, device: DeviceInfo) -> Self {
        self.device = device;
        self
    }

    pub fn with_training(mut self, loss: impl Into<TensorId>, optimizer: Optimizer) -> Self {
        self.loss = Some(loss.into());
        self.optimizer = Some(optimizer);
        self
    }

    pub fn with_cached_hashes(mut self, hashes: impl IntoIterator<Item = u64>) -> Self {
        self.cached_hashes.extend(hashes);
        self
    }

    /// Stable fingerprint of everything that determines the prepared program.
    pub fn hash(&self) -> Result<u64> {
        Ok(combine(&[
            fingerprint_json(&self.model)?,
            fingerprint_json(&self.data_flow)?,
            fingerprint_json(&self.input_shapes)?,
            fingerprint_json(&self.options)?,
            fingerprint_json(&self.patterns)?,
            fingerprint_json(&self.optimizer)?,
            fingerprint_json(&self.loss)?,
            fingerprint_json(&self.device)?,
        ]))
    }
}

/// Owns every graph of a program and drives its preparation.
pub struct Ir {
    graphs: BTreeMap<GraphId, Graph>,
    registry: Arc<OpRegistry>,
    op_counter: Arc<AtomicU64>,
    model: Model,
    data_flow: DataFlow,
    input_shapes: InputShapeInfo,
    options: SessionOptions,
    patterns: Patterns,
    device: DeviceInfo,
    loss: Option<TensorId>,
    optimizer: Option<Optimizer>,
    cached_hashes: BTreeSet<u64>,
    transforms: TransformRegistry,
    final_loss: Option<TensorId>,
    phase: PreparePhase,
    bundle_hash: Result<u64>,
    hash: Option<u64>,
}

impl std::fmt::Debug for Ir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ir")
            .field("graphs", &self.graphs.keys().collect::<Vec<_>>())
            .field("phase", &self.phase)
            .field("hash", &self.hash)
            .finish()
    }
}

impl Ir {
    pub fn new(bundle: IrBundle) -> Self {
        let bundle_hash = bundle.hash();
        let op_counter = Arc::new(AtomicU64::new(0));
        let mut graphs = BTreeMap::new();
        graphs.insert(
            GraphId::main(),
            Graph::new(
                GraphId::main(),
                Arc::clone(&bundle.registry),
                Arc::clone(&op_counter),
            ),
        );
        Self {
            graphs,
            registry: bundle.registry,
            op_counter,
            model: bundle.model,
            data_flow: bundle.data_flow,
            input_shapes: bundle.input_shapes,
            options: bundle.options,
            patterns: bundle.patterns,
            device: bundle.device,
            loss: bundle.loss,
            optimizer: bundle.optimizer,
            cached_hashes: bundle.cached_hashes,
            transforms: TransformRegistry::with_builtins(),
            final_loss: None,
            phase: PreparePhase::Unprepared,
            bundle_hash,
            hash: None,
        }
    }

    pub fn graph(&self, id: &GraphId) -> Result<&Graph> {
        self.graphs
            .get(id)
            .ok_or_else(|| Error::not_found(format!("no graph '{id}'")))
    }

    pub fn graph_mut(&mut self, id: &GraphId) -> Result<&mut Graph> {
        self.graphs
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("no graph '{id}'")))
    }

    pub fn main_graph(&self) -> Result<&Graph> {
        self.graph(&GraphId::main())
    }

    pub fn main_graph_mut(&mut self) -> Result<&mut Graph> {
        self.graph_mut(&GraphId::main())
    }

    pub fn graphs(&self) -> impl Iterator<Item = &Graph> + '_ {
        self.graphs.values()
    }

    pub fn graph_ids(&self) -> Vec<GraphId> {
        self.graphs.keys().cloned().collect()
    }

    pub fn has_graph(&self, id: &GraphId) -> bool {
        self.graphs.contains_key(id)
    }

    /// Adds an empty graph sharing this `Ir`'s registry and op id counter.
    pub fn create_graph(&mut self, id: GraphId) -> Result<&mut Graph> {
        if self.graphs.contains_key(&id) {
            return Err(Error::collision(format!("graph '{id}' already exists")));
        }
        let graph = Graph::new(
            id.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.op_counter),
        );
        Ok(self.graphs.entry(id).or_insert(graph))
    }

    /// Copies `original` into a new graph `new_id`, rescoping every tensor id.
    pub fn clone_graph(&mut self, original: &GraphId, new_id: GraphId) -> Result<()> {
        let source = self.graph(original)?.clone();
        let rename = |id: &TensorId| -> TensorId {
            let local = if original.is_main() {
                id.as_str()
            } else {
                id.as_str()
                    .strip_prefix(&format!("{original}/"))
                    .unwrap_or(id.as_str())
            };
            new_id.scoped(local)
        };

        let target = self.create_graph(new_id.clone())?;
        for tensor in source.tensors().iter() {
            let mut copy = Tensor::new(rename(&tensor.id), tensor.tensor_type, tensor.info.clone());
            copy.data = tensor.data.clone();
            target.tensors_mut().insert(copy)?;
        }
        let mut op_map: BTreeMap<OpId, OpId> = BTreeMap::new();
        for op in source.ops() {
            let new_op = target.create_op(&op.opid, op.settings.clone(), op.attrs.clone())?;
            for (index, tensor) in op.input.iter() {
                target.connect_in(new_op, index, &rename(tensor))?;
            }
            for (index, tensor) in op.output.iter() {
                target.connect_out(new_op, index, &rename(tensor))?;
            }
            op_map.insert(op.id, new_op);
        }
        for (before, after, tied) in source.topo_cons().all() {
            if let (Some(before), Some(after)) = (op_map.get(&before), op_map.get(&after)) {
                target.topo_cons_mut().insert(*before, *after, tied)?;
            }
        }
        for input in source.inputs() {
            target.mark_as_input(&rename(input))?;
        }
        for output in source.outputs() {
            target.mark_as_output(&rename(output))?;
        }
        debug!(target: "kiln::ir", from = %original, to = %new_id, ops = op_map.len(), "cloned graph");
        Ok(())
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn patterns(&self) -> &Patterns {
        &self.patterns
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    pub fn data_flow(&self) -> &DataFlow {
        &self.data_flow
    }

    pub fn optimizer(&self) -> Option<&Optimizer> {
        self.optimizer.as_ref()
    }

    pub fn registry(&self) -> &Arc<OpRegistry> {
        &self.registry
    }

    pub fn transforms(&self) -> &TransformRegistry {
        &self.transforms
    }

    pub fn transforms_mut(&mut self) -> &mut TransformRegistry {
        &mut self.transforms
    }

    /// Loss tensor, once `set_final_loss` has run.
    pub fn final_loss(&self) -> Option<&TensorId> {
        self.final_loss.as_ref()
    }

    pub fn can_train(&self) -> bool {
        self.loss.is_some() && self.optimizer.is_some()
    }

    pub fn phase(&self) -> PreparePhase {
        self.phase
    }

    pub fn is_prepared(&self) -> bool {
        self.phase == PreparePhase::Prepared
    }

    /// Bundle hash recorded when preparation finished.
    pub fn hash(&self) -> Option<u64> {
        self.hash
    }

    pub fn anchors(&self) -> BTreeSet<TensorId> {
        self.data_flow.anchor_ids().cloned().collect()
    }

    /// Tensors no rewrite may remove or rename: anchors and the loss.
    pub fn protected_tensors(&self) -> BTreeSet<TensorId> {
        let mut protected = self.anchors();
        if let Some(loss) = self.final_loss.as_ref().or(self.loss.as_ref()) {
            protected.insert(loss.clone());
        }
        protected
    }

    pub(crate) fn apply_transform_unchecked(
        &mut self,
        transform: &dyn Transform,
        graph: &GraphId,
    ) -> Result<PassResult> {
        transform.apply(self, graph)
    }

    /// Runs the registered transform `id` on `graph` unless it is disabled.
    pub fn apply_transform(&mut self, id: u64, graph: &GraphId) -> Result<PassResult> {
        let transform = self
            .transforms
            .get(id)
            .ok_or_else(|| Error::not_found(format!("no transform with id {id:#x}")))?;
        self.apply(transform.as_ref(), graph)
    }

    fn apply(&mut self, transform: &dyn Transform, graph: &GraphId) -> Result<PassResult> {
        if !self.transforms.is_enabled(transform.id()) {
            debug!(target: "kiln::transform", pass = transform.name(), "transform disabled, skipping");
            return Ok(PassResult::unchanged());
        }
        run_transform(transform, self, graph, env::pass_stats_enabled())
    }

    fn apply_main(&mut self, transform: &dyn Transform) -> Result<PassResult> {
        self.apply(transform, &GraphId::main())
    }

    fn apply_all(&mut self, transform: &dyn Transform) -> Result<PassResult> {
        let mut totals = PassResult::unchanged();
        for graph in self.graph_ids() {
            totals = totals.merge(self.apply(transform, &graph)?);
        }
        Ok(totals)
    }

    pub fn unset_all_virtual_graph_ids(&mut self) {
        let mut cleared = 0usize;
        for graph in self.graphs.values_mut() {
            let ids = graph.op_ids();
            for id in ids {
                if let Ok(op) = graph.op_mut(id) {
                    if op.settings.vgraph_id.take().is_some() {
                        cleared += 1;
                    }
                }
            }
        }
        if cleared > 0 {
            info!(target: "kiln::ir", cleared, "virtual graphs disabled, cleared op placements");
        }
    }

    /// Designates the configured loss as the loss of the main graph.
    pub fn set_final_loss(&mut self) -> Result<()> {
        let loss = self
            .loss
            .clone()
            .ok_or_else(|| Error::config("training requires a loss tensor"))?;
        let main = self.main_graph_mut()?;
        if !main.tensors().contains(&loss) {
            return Err(Error::user_model(format!(
                "loss tensor '{loss}' is not produced by the model"
            )));
        }
        main.set_loss(Some(loss.clone()));
        debug!(target: "kiln::ir", loss = %loss, "final loss set");
        self.final_loss = Some(loss);
        Ok(())
    }

    /// Recomputes the loss-path state of every op and tensor.
    pub fn update_vertices(&mut self) -> Result<()> {
        let loss = self.final_loss.clone();
        for graph in self.graphs.values_mut() {
            update_graph_vertices(graph, loss.as_ref())?;
        }
        Ok(())
    }

    /// Keeps phased ops in phase order when that is still satisfiable.
    fn phase_constraints(&self, graph: &Graph) -> OpsBeforeKey {
        let mut extra = OpsBeforeKey::new();
        if !(self.options.respect_execution_phases && self.options.execution_phases_enabled()) {
            return extra;
        }
        let mut by_phase: BTreeMap<i64, Vec<OpId>> = BTreeMap::new();
        for op in graph.ops() {
            if let Some(phase) = op.settings.execution_phase {
                by_phase.entry(phase).or_default().push(op.id);
            }
        }
        let phases: Vec<&Vec<OpId>> = by_phase.values().collect();
        for pair in phases.windows(2) {
            for after in pair[1] {
                extra.entry(*after).or_default().extend(pair[0].iter().copied());
            }
        }
        if graph.is_schedulable(&extra) {
            extra
        } else {
            warn!(target: "kiln::ir", graph = %graph.id(), "execution phases conflict with data dependencies, not enforcing phase order");
            OpsBeforeKey::new()
        }
    }

    /// Schedule of one graph's ops.
    pub fn graph_op_schedule(&self, graph: &GraphId, mode: RequireOptimal) -> Result<Vec<OpId>> {
        let graph = self.graph(graph)?;
        graph.op_schedule(&self.phase_constraints(graph), mode)
    }

    /// One flat order over every op reachable from the main graph, each called
    /// graph expanded once in front of its first caller.
    pub fn get_op_schedule(&self, mode: RequireOptimal) -> Result<Vec<(GraphId, OpId)>> {
        let mut order = Vec::new();
        let mut expanded = BTreeSet::from([GraphId::main()]);
        let mut stack = Vec::new();
        self.expand_schedule(&GraphId::main(), mode, &mut stack, &mut expanded, &mut order)?;
        Ok(order)
    }

    fn expand_schedule(
        &self,
        graph: &GraphId,
        mode: RequireOptimal,
        stack: &mut Vec<GraphId>,
        expanded: &mut BTreeSet<GraphId>,
        order: &mut Vec<(GraphId, OpId)>,
    ) -> Result<()> {
        stack.push(graph.clone());
        let current = self.graph(graph)?;
        for op_id in self.graph_op_schedule(graph, mode)? {
            for callee in current.op(op_id)?.called_graphs() {
                if stack.contains(&callee) {
                    return Err(recursion_error(stack, &callee));
                }
                if expanded.insert(callee.clone()) {
                    self.expand_schedule(&callee, mode, stack, expanded, order)?;
                }
            }
            order.push((graph.clone(), op_id));
        }
        stack.pop();
        Ok(())
    }

    /// Every graph, callees before their callers.
    pub fn graph_schedule(&self) -> Result<Vec<GraphId>> {
        let mut order = Vec::with_capacity(self.graphs.len());
        let mut done = BTreeSet::new();
        let mut roots = vec![GraphId::main()];
        roots.extend(self.graphs.keys().filter(|id| !id.is_main()).cloned());
        for root in roots {
            let mut stack = Vec::new();
            self.visit_graph(&root, &mut stack, &mut done, &mut order)?;
        }
        Ok(order)
    }

    fn visit_graph(
        &self,
        graph: &GraphId,
        stack: &mut Vec<GraphId>,
        done: &mut BTreeSet<GraphId>,
        order: &mut Vec<GraphId>,
    ) -> Result<()> {
        if done.contains(graph) {
            return Ok(());
        }
        if stack.contains(graph) {
            return Err(recursion_error(stack, graph));
        }
        stack.push(graph.clone());
        for callee in self.graph(graph)?.called_graphs() {
            self.visit_graph(&callee, stack, done, order)?;
        }
        stack.pop();
        done.insert(graph.clone());
        order.push(graph.clone());
        Ok(())
    }

    fn remove_isolated_tensors(&mut self) -> Result<usize> {
        let protected = self.protected_tensors();
        let mut removed = 0;
        for graph in self.graphs.values_mut() {
            removed += graph.remove_isolated_tensors(RetainFlags::IO_ONLY, &protected)?;
        }
        Ok(removed)
    }

    fn construct_forward(&mut self) -> Result<()> {
        let main = self.main_graph()?;
        if main.n_ops() > 0 || !main.tensors().is_empty() {
            return Err(Error::internal("forward graph constructed twice"));
        }
        let graphs = import_model(
            &self.model,
            &self.input_shapes,
            self.can_train(),
            &self.registry,
            &self.op_counter,
        )?;
        for graph in graphs {
            self.graphs.insert(graph.id().clone(), graph);
        }
        Ok(())
    }

    fn apply_const_folding_and_pre_alias(&mut self) -> Result<PassResult> {
        let mut pipeline = PipelineBuilder::new();
        pipeline.fixed_point(FOLD_FIXED_POINT_ITERS, |inner| {
            inner.pass(Arc::new(ConstExprFolding));
            inner.pass(Arc::new(PreAliasPatterns));
        });
        let steps = pipeline.finish();
        let mut totals = PassResult::unchanged();
        for graph in self.graph_ids() {
            run_steps(&steps, self, &graph, &mut totals, env::pass_stats_enabled())?;
        }
        Ok(totals)
    }

    /// Runs the whole compilation pipeline once.
    ///
    /// A second call fails with an `AlreadyPrepared` error and leaves the `Ir`
    /// untouched. On failure the partially prepared IR is dumped to
    /// `KILN_IR_DUMP` when that variable is set.
    pub fn prepare(&mut self) -> Result<()> {
        if self.phase != PreparePhase::Unprepared {
            return Err(Error::already_prepared(format!(
                "prepare called on an Ir in phase {:?}",
                self.phase
            )));
        }
        self.phase = PreparePhase::InProgress;
        let _span = info_span!("prepare").entered();
        let result = self.prepare_impl();
        match &result {
            Ok(()) => {
                if let Some(path) = env::ir_dump_path() {
                    if let Err(err) = self.dump_to(&path) {
                        warn!(target: "kiln::ir", path = %path.display(), error = %err, "failed to write IR dump");
                    }
                }
            }
            Err(err) => {
                warn!(target: "kiln::ir", error = %err, "prepare failed");
                if let Some(path) = env::ir_dump_path() {
                    if let Err(dump_err) = self.dump_to(&path) {
                        warn!(target: "kiln::ir", path = %path.display(), error = %dump_err, "failed to write IR dump");
                    }
                }
            }
        }
        result
    }

    fn prepare_impl(&mut self) -> Result<()> {
        self.options.validate()?;
        if self.options.accumulation.enable_gradient_accumulation && !self.can_train() {
            return Err(Error::config(
                "gradient accumulation requires a training session (loss and optimizer)",
            ));
        }
        if !self.can_train() && self.data_flow.anchors.is_empty() {
            return Err(Error::user_model(
                "an inference session must anchor at least one tensor",
            ));
        }

        self.construct_forward()?;

        let bundle_hash = self.bundle_hash.clone()?;
        if self.options.enable_engine_caching && self.cached_hashes.contains(&bundle_hash) {
            info!(target: "kiln::ir", hash = bundle_hash, "cached program found, skipping pipeline");
            self.hash = Some(bundle_hash);
            self.phase = PreparePhase::Prepared;
            return Ok(());
        }

        if self.options.virtual_graph_mode == VirtualGraphMode::Off {
            self.unset_all_virtual_graph_ids();
        }
        self.verify_virtual_graph_ids(false)?;
        self.verify_pipeline_settings()?;
        self.verify_execution_phase_settings()?;
        self.verify_distributed_replicated_graph_settings()?;

        self.apply_const_folding_and_pre_alias()?;

        if self.options.virtual_graph_mode == VirtualGraphMode::Auto {
            self.apply_main(&AutoVirtualGraph)?;
        }
        if self.options.enable_pipelining {
            self.apply_main(&InferPipelineStages)?;
        }

        if self.can_train() {
            self.set_final_loss()?;
            self.update_vertices()?;
        }

        if self.options.execution_phase_settings.phases > 1 {
            self.verify_virtual_graph_ids(true)?;
        }

        let batch_serialize = self.options.batch_serialization_enabled();
        let context = self.options.batch_serialization.transform_context;
        if batch_serialize && context == BatchSerializationContext::Fwd {
            self.apply_main(&BatchSerialize::new(1))?;
            self.remove_isolated_tensors()?;
            self.update_vertices()?;
        }

        // Streaming memory phase 1 belongs here; this compiler keeps every
        // tensor resident.

        let recomputation = self.options.recomputation_type;
        let auto_recompute = recomputation != RecomputationType::None;
        if auto_recompute
            && self.main_graph()?.has_user_recompute_ops()
            && self.options.execution_phase_settings.phases < 2
        {
            return Err(Error::config(
                "automatic recomputation cannot be combined with ops annotated for recomputation",
            ));
        }
        if auto_recompute && !self.options.explicit_recomputation {
            info!(target: "kiln::ir", mode = ?recomputation, "annotating ops for implicit recomputation");
            auto_annotate(self.main_graph_mut()?, recomputation)?;
        }

        self.remove_isolated_tensors()?;
        self.update_vertices()?;
        if self.can_train() {
            self.apply_main(&Autodiff)?;
        }
        self.verify_pipeline_settings()?;
        self.update_vertices()?;

        self.apply_all(&Prune)?;
        self.apply_all(&PreAliasPatterns)?;
        self.remove_isolated_tensors()?;
        self.update_vertices()?;

        if self.options.explicit_recomputation {
            if auto_recompute {
                auto_annotate(self.main_graph_mut()?, recomputation)?;
            }
            self.apply_main(&ExplicitRecompute)?;
            self.update_vertices()?;
        }

        self.apply_all(&Prune)?;

        if self.options.virtual_graphs_enabled() {
            self.apply_all(&InterIpuCopy)?;
        }

        // Streaming memory phase 2 and remote buffer setup belong here.

        self.apply_all(&Prune)?;
        self.verify_replicated_tensor_sharding()?;
        self.verify_virtual_graph_ids(true)?;

        self.apply_all(&PreAliasPatterns)?;

        if context == BatchSerializationContext::Bwd && batch_serialize {
            self.apply_main(&BatchSerialize::new(1))?;
            self.apply_all(&Prune)?;
            self.remove_isolated_tensors()?;
        }
        if batch_serialize {
            self.apply_main(&BatchSerialize::new(2))?;
        }

        self.update_vertices()?;

        if self.options.enable_pipelining && self.can_train() {
            self.apply_main(&Pipeline)?;
            self.update_vertices()?;
        }
        if self.options.enable_outlining {
            self.apply_main(&SubgraphOutline)?;
            self.update_vertices()?;
        }

        self.remove_isolated_tensors()?;
        self.apply_all(&MergeDuplicateOps)?;

        if self.patterns.update_inplace_priorities_for_ipu {
            self.apply_all(&UpdateInplacePrioritiesForIpu)?;
        }
        if self.patterns.inplace_enabled() {
            for graph in self.graph_schedule()? {
                self.apply(&Inplace, &graph)?;
            }
        }

        self.remove_isolated_tensors()?;
        self.validate_anchors()?;

        self.verify_const_expr_folding()?;
        self.verify_connectivity()?;
        self.verify_tensor_ids()?;
        self.verify_tensor_infos()?;
        self.verify_virtual_graph_ids(true)?;
        self.verify_recompute_attributes()?;
        self.verify_execution_contexts()?;
        self.verify_pipeline_stage_attributes()?;
        self.verify_replicated_tensor_sharding()?;

        self.hash = Some(bundle_hash);
        self.phase = PreparePhase::Prepared;
        info!(
            target: "kiln::ir",
            hash = bundle_hash,
            graphs = self.graphs.len(),
            ops = self.graphs.values().map(Graph::n_ops).sum::<usize>(),
            "prepared"
        );
        Ok(())
    }
}

fn recursion_error(stack: &[GraphId], callee: &GraphId) -> Error {
    let chain: Vec<&str> = stack.iter().map(GraphId::as_str).collect();
    Error::unschedulable(format!(
        "recursive graph call: {} -> {callee}",
        chain.join(" -> ")
    ))
}

fn update_graph_vertices(graph: &mut Graph, loss: Option<&TensorId>) -> Result<()> {
    let loss = loss.filter(|loss| graph.tensors().contains(loss));
    let mut to_loss_ops = BTreeSet::new();
    let mut to_loss_tensors = BTreeSet::new();
    let mut from_loss_ops = BTreeSet::new();
    let mut from_loss_tensors = BTreeSet::new();

    if let Some(loss) = loss {
        let mut work = vec![loss.clone()];
        while let Some(tensor) = work.pop() {
            if !to_loss_tensors.insert(tensor.clone()) {
                continue;
            }
            if let Some(producer) = graph.tensor(&tensor)?.producer() {
                if to_loss_ops.insert(producer) {
                    work.extend(graph.op(producer)?.input.unique_tensors());
                }
            }
        }

        let mut work = vec![loss.clone()];
        let seed = loss.grad();
        if graph.tensors().contains(&seed) {
            work.push(seed);
        }
        while let Some(tensor) = work.pop() {
            if !from_loss_tensors.insert(tensor.clone()) {
                continue;
            }
            for consumer in graph.consumers(&tensor)? {
                if from_loss_ops.insert(consumer) {
                    work.extend(graph.op(consumer)?.output.unique_tensors());
                }
            }
        }
    }

    let mark = |set_member: bool| match (loss.is_some(), set_member) {
        (false, _) => LossPath::Undefined,
        (true, true) => LossPath::Yes,
        (true, false) => LossPath::No,
    };
    let pre_loss = |from_loss: bool| {
        if from_loss {
            LossPath::No
        } else {
            LossPath::Yes
        }
    };

    for id in graph.op_ids() {
        let op = graph.op_mut(id)?;
        let state = op.vertex_mut();
        state.to_loss = mark(to_loss_ops.contains(&id));
        state.from_loss = mark(from_loss_ops.contains(&id));
        state.scheduled_pre_loss = pre_loss(from_loss_ops.contains(&id));
    }
    for id in graph.tensors().ids() {
        let producer_pre_loss = match graph.tensor(&id)?.producer() {
            Some(producer) => Some(graph.op(producer)?.vertex().scheduled_pre_loss),
            None => None,
        };
        let from_loss = from_loss_tensors.contains(&id) && loss != Some(&id);
        let tensor = graph.tensors_mut().get_mut(&id)?;
        let state = tensor.vertex_mut();
        state.to_loss = mark(to_loss_tensors.contains(&id));
        state.from_loss = mark(from_loss);
        state.scheduled_pre_loss = producer_pre_loss.unwrap_or_else(|| pre_loss(from_loss));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::ir::op::{Attribute, Attributes, Settings};
    use crate::ir::tensor_info::{DataType, TensorInfo};
    use crate::ops::opids;

    fn empty_ir() -> Ir {
        Ir::new(IrBundle::new(Model::default()))
    }

    fn relu(graph: &mut Graph, name: &str, input: &str, output: &str) -> OpId {
        let settings = Settings::new(graph.id().clone(), name);
        graph
            .create_connected_op(
                &opids::relu(),
                settings,
                Attributes::new(),
                &[(0, TensorId::from(input))],
                &[(0, TensorId::from(output))],
            )
            .unwrap()
    }

    fn call(graph: &mut Graph, name: &str, callee: &GraphId, input: &str, output: &str) {
        let mut attrs = Attributes::new();
        attrs.insert("callee".to_string(), Attribute::Graph(callee.clone()));
        let settings = Settings::new(graph.id().clone(), name);
        let op = graph.create_op(&opids::call(), settings, attrs).unwrap();
        graph.connect_in(op, 0, &TensorId::from(input)).unwrap();
        let out = Tensor::new(
            TensorId::from(output),
            crate::ir::tensor::TensorType::ActGrad,
            TensorInfo::new(DataType::Float, vec![2]),
        );
        graph.tensors_mut().insert(out).unwrap();
        graph.connect_out(op, 0, &TensorId::from(output)).unwrap();
    }

    #[test]
    fn called_graph_is_expanded_once_before_its_callers() {
        let mut ir = empty_ir();
        let body = GraphId::from("body");
        {
            let graph = ir.create_graph(body.clone()).unwrap();
            let info = TensorInfo::new(DataType::Float, vec![2]);
            graph.add_input(body.scoped("x"), info).unwrap();
            relu(graph, "inner", "body/x", "body/y");
            graph.mark_as_output(&TensorId::from("body/y")).unwrap();
        }
        let main = ir.main_graph_mut().unwrap();
        main.tensors_mut()
            .add_stream(TensorId::from("a"), TensorInfo::new(DataType::Float, vec![2]))
            .unwrap();
        call(main, "call0", &body, "a", "b");
        call(main, "call1", &body, "a", "c");

        let schedule = ir.get_op_schedule(RequireOptimal::No).unwrap();
        assert_eq!(schedule.len(), 3);
        assert_eq!(schedule[0].0, body);
        assert!(schedule[1..].iter().all(|(graph, _)| graph.is_main()));
        assert_eq!(ir.graph_schedule().unwrap(), vec![body, GraphId::main()]);
    }

    #[test]
    fn recursive_calls_are_rejected() {
        let mut ir = empty_ir();
        let body = GraphId::from("body");
        let graph = ir.create_graph(body.clone()).unwrap();
        graph
            .add_input(body.scoped("x"), TensorInfo::new(DataType::Float, vec![2]))
            .unwrap();
        call(graph, "self_call", &body, "body/x", "body/y");

        assert_eq!(ir.graph_schedule().unwrap_err().kind(), ErrorKind::Unschedulable);
        let main = ir.main_graph_mut().unwrap();
        main.tensors_mut()
            .add_stream(TensorId::from("a"), TensorInfo::new(DataType::Float, vec![2]))
            .unwrap();
        call(main, "outer", &body, "a", "b");
        assert_eq!(
            ir.get_op_schedule(RequireOptimal::No).unwrap_err().kind(),
            ErrorKind::Unschedulable
        );
    }

    #[test]
    fn clone_graph_rescopes_tensors() {
        let mut ir = empty_ir();
        let body = GraphId::from("body");
        {
            let graph = ir.create_graph(body.clone()).unwrap();
            graph
                .add_input(body.scoped("x"), TensorInfo::new(DataType::Float, vec![3]))
                .unwrap();
            relu(graph, "r", "body/x", "body/y");
            graph.mark_as_output(&TensorId::from("body/y")).unwrap();
        }
        ir.clone_graph(&body, GraphId::from("copy")).unwrap();
        let copy = ir.graph(&GraphId::from("copy")).unwrap();
        assert_eq!(copy.n_ops(), 1);
        assert_eq!(copy.inputs(), &[TensorId::from("copy/x")]);
        assert_eq!(copy.outputs(), &[TensorId::from("copy/y")]);
        assert!(copy.producer(&TensorId::from("copy/y")).unwrap().is_some());
        assert_eq!(
            ir.clone_graph(&body, GraphId::from("copy")).unwrap_err().kind(),
            ErrorKind::TensorIdCollision
        );
    }

    #[test]
    fn unset_virtual_graph_ids_clears_every_op() {
        let mut ir = empty_ir();
        let main = ir.main_graph_mut().unwrap();
        main.tensors_mut()
            .add_stream(TensorId::from("x"), TensorInfo::new(DataType::Float, vec![1]))
            .unwrap();
        let op = relu(main, "r", "x", "y");
        main.op_mut(op).unwrap().settings.vgraph_id = Some(1);
        ir.unset_all_virtual_graph_ids();
        assert!(ir
            .main_graph()
            .unwrap()
            .ops()
            .all(|op| op.settings.vgraph_id.is_none()));
    }

    #[test]
    fn bundle_hash_tracks_options() {
        let a = IrBundle::new(Model::default());
        let mut options = SessionOptions::default();
        options.enable_engine_caching = true;
        let b = IrBundle::new(Model::default()).with_options(options);
        assert_eq!(a.hash().unwrap(), IrBundle::new(Model::default()).hash().unwrap());
        assert_ne!(a.hash().unwrap(), b.hash().unwrap());
    }
}
