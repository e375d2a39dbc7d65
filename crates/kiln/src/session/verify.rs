//! Read-only consistency checks run between and after the `prepare` phases.
//!
//! Every check reports the first violation it finds and never repairs the
//! graph. Placement and configuration checks fail with configuration errors,
//! structural checks with internal errors.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::ir::graph::Graph;
use crate::ir::ids::{GraphId, PipelineStage, TensorId, VGraphId};
use crate::ir::op::{ExecutionContext, Op, RecomputeType};
use crate::ir::tensor::TensorType;
use crate::ir::tensor_info::DataType;
use crate::session::ir::Ir;
use crate::session::options::VirtualGraphMode;

impl Ir {
    /// Virtual graph ids are either on every op or on none, and match the mode.
    ///
    /// `post_placement` is set once automatic placement had its chance to run;
    /// from then on an enabled mode without any placement is an error.
    pub fn verify_virtual_graph_ids(&self, post_placement: bool) -> Result<()> {
        let options = self.options();
        let mut with_id = 0usize;
        let mut without_id = Vec::new();
        let mut seen: BTreeSet<VGraphId> = BTreeSet::new();
        for graph in self.graphs() {
            for op in graph.ops().filter(|op| !op.is_ipu_copy()) {
                match op.settings.vgraph_id {
                    Some(vgid) => {
                        with_id += 1;
                        seen.insert(vgid);
                    }
                    None => without_id.push(op.debug_name()),
                }
            }
        }

        if !options.virtual_graphs_enabled() {
            if with_id > 0 {
                return Err(Error::config(format!(
                    "virtual graphs are disabled but {with_id} ops carry a virtual graph id"
                )));
            }
            return Ok(());
        }
        if with_id == 0 {
            if options.virtual_graph_mode == VirtualGraphMode::Manual {
                return Err(Error::config(
                    "virtual graph mode Manual requires every op to carry a virtual graph id, none do",
                ));
            }
            if post_placement {
                return Err(Error::config(format!(
                    "virtual graph mode {:?} is set but no op was placed on a virtual graph",
                    options.virtual_graph_mode
                )));
            }
            return Ok(());
        }
        if let Some(first) = without_id.first() {
            return Err(Error::config(format!(
                "{with_id} ops have a virtual graph id and {} do not, for example {first}; \
                 either every op or none must be placed",
                without_id.len()
            )));
        }
        if matches!(
            options.virtual_graph_mode,
            VirtualGraphMode::Manual | VirtualGraphMode::Auto
        ) {
            let available = i64::from(self.device().num_ipus);
            if let Some(bad) = seen.iter().find(|vgid| **vgid < 0 || **vgid >= available) {
                return Err(Error::config(format!(
                    "virtual graph id {bad} is out of range for a device with {available} partitions"
                )));
            }
        }
        Ok(())
    }

    /// Pipelining needs several placed partitions and consistent stages.
    pub fn verify_pipeline_settings(&self) -> Result<()> {
        let options = self.options();
        if !options.enable_pipelining {
            return Ok(());
        }
        if !options.virtual_graphs_enabled() || self.device().num_ipus < 2 {
            return Err(Error::config(
                "pipelining requires virtual graphs to be enabled on a device with more than one partition",
            ));
        }

        let mut with_stage = 0usize;
        let mut without_stage = Vec::new();
        let mut stage_vgids: BTreeMap<PipelineStage, BTreeSet<VGraphId>> = BTreeMap::new();
        for graph in self.graphs() {
            for op in graph.ops().filter(|op| !op.is_ipu_copy()) {
                match op.settings.pipeline_stage {
                    Some(stage) => {
                        with_stage += 1;
                        if let Some(vgid) = op.settings.vgraph_id {
                            stage_vgids.entry(stage).or_default().insert(vgid);
                        }
                    }
                    None => without_stage.push(op.debug_name()),
                }
            }
        }
        if with_stage > 0 {
            if let Some(first) = without_stage.first() {
                return Err(Error::config(format!(
                    "only some ops have a pipeline stage ({} without, for example {first})",
                    without_stage.len()
                )));
            }
        }
        for (stage, vgids) in &stage_vgids {
            if vgids.len() > 1 {
                return Err(Error::config(format!(
                    "pipeline stage {stage} is spread over virtual graphs {vgids:?}; \
                     a stage must live on a single virtual graph"
                )));
            }
        }
        Ok(())
    }

    pub fn verify_execution_phase_settings(&self) -> Result<()> {
        let options = self.options();
        let phases = options.execution_phase_settings.phases;
        if phases > 1 && options.virtual_graph_mode != VirtualGraphMode::ExecutionPhases {
            return Err(Error::config(format!(
                "{phases} execution phases requested but virtual graph mode is {:?}, not ExecutionPhases",
                options.virtual_graph_mode
            )));
        }
        if options.virtual_graph_mode == VirtualGraphMode::ExecutionPhases && phases < 2 {
            warn!(target: "kiln::ir", phases, "phased execution with fewer than 2 phases");
        }
        Ok(())
    }

    pub fn verify_distributed_replicated_graph_settings(&self) -> Result<()> {
        let replication = &self.options().replication;
        if !replication.enable_distributed_replicated_graphs {
            return Ok(());
        }
        let global = replication.global_replication_factor;
        let offset = replication.global_replica_offset;
        if global < 1 {
            return Err(Error::config(format!(
                "global replication factor must be at least 1, got {global}"
            )));
        }
        if offset < 0 || offset > global {
            return Err(Error::config(format!(
                "global replica offset {offset} is outside [0, {global}]"
            )));
        }
        if replication.enable_replicated_graphs && replication.replicated_graph_count == 1 {
            return Err(Error::config(
                "local replication is enabled with a replicated graph count of 1",
            ));
        }
        if replication.replicated_graph_count > global {
            return Err(Error::config(format!(
                "local replication factor {} exceeds the global factor {global}",
                replication.replicated_graph_count
            )));
        }
        Ok(())
    }

    /// With explicit recomputation no op may still carry the implicit marker.
    pub fn verify_recompute_attributes(&self) -> Result<()> {
        if !self.options().explicit_recomputation {
            return Ok(());
        }
        for graph in self.graphs() {
            if let Some(op) = graph
                .ops()
                .find(|op| op.settings.recompute_type == RecomputeType::Recompute)
            {
                return Err(Error::internal(format!(
                    "explicit recomputation is enabled but {} is marked for implicit recomputation",
                    op.debug_name()
                )));
            }
        }
        Ok(())
    }

    pub fn verify_execution_contexts(&self) -> Result<()> {
        let accumulation = self.options().accumulation.enable_gradient_accumulation;
        for graph in self.graphs() {
            for op in graph.ops() {
                let context = op.settings.execution_context;
                if context == ExecutionContext::AccumulateOuterFragment && !accumulation {
                    return Err(Error::internal(format!(
                        "{} is in the accumulate outer fragment without gradient accumulation",
                        op.debug_name()
                    )));
                }
                if graph.id().is_main() && context == ExecutionContext::Subgraph {
                    return Err(Error::internal(format!(
                        "{} lives in the main graph but has the Subgraph execution context",
                        op.debug_name()
                    )));
                }
                let host_fragment = matches!(
                    context,
                    ExecutionContext::WeightsFromHostFragment
                        | ExecutionContext::WeightsToHostFragment
                        | ExecutionContext::OptimizerFromHostFragment
                );
                if !graph.id().is_main() && host_fragment {
                    return Err(Error::internal(format!(
                        "{} in graph '{}' has host fragment context {context:?}",
                        op.debug_name(),
                        graph.id()
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn verify_pipeline_stage_attributes(&self) -> Result<()> {
        if !self.options().enable_pipelining {
            return Ok(());
        }
        for graph in self.graphs() {
            if let Some(op) = graph
                .ops()
                .find(|op| !op.is_ipu_copy() && op.settings.pipeline_stage.is_none())
            {
                return Err(Error::internal(format!(
                    "pipelining is enabled but {} has no pipeline stage",
                    op.debug_name()
                )));
            }
        }
        Ok(())
    }

    /// Ops reading replicated-tensor-sharded tensors must declare the index
    /// groups that carry them, and shards in one group must agree on the
    /// full shape.
    pub fn verify_replicated_tensor_sharding(&self) -> Result<()> {
        for graph in self.graphs() {
            for tensor in graph.tensors().iter() {
                if tensor.info.meta_shape.is_empty() {
                    continue;
                }
                for consumer in tensor.consumers.ops() {
                    let op = graph.op(consumer)?;
                    let groups = op.def().rts_indices(op);
                    for index in op.input.indices(&tensor.id) {
                        let Some((inputs, outputs)) =
                            groups.iter().find(|(inputs, _)| inputs.contains(index))
                        else {
                            return Err(Error::internal(format!(
                                "{} reads sharded tensor '{}' at input {index} but declares no sharding group for it",
                                op.debug_name(),
                                tensor.id
                            )));
                        };
                        check_group_meta_shapes(graph, op, inputs, outputs)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Tensor roles agree with their producers: Stream and Const tensors have
    /// none, a Variable is produced only by a variable update or an init, and
    /// an ActGrad without a producer is an anchor or a graph input.
    pub fn verify_tensor_producers(&self) -> Result<()> {
        let anchors = self.anchors();
        for graph in self.graphs() {
            for tensor in graph.tensors().iter() {
                let producer = match tensor.producer() {
                    Some(id) => Some(graph.op(id)?),
                    None => None,
                };
                match (tensor.tensor_type, producer) {
                    (TensorType::Stream | TensorType::Const, Some(op)) => {
                        return Err(Error::internal(format!(
                            "tensor '{}' is a {:?} tensor, but has {} as a producer",
                            tensor.id,
                            tensor.tensor_type,
                            op.debug_name()
                        )));
                    }
                    (TensorType::Variable, Some(op))
                        if !(op.flags().var_update || op.flags().init) =>
                    {
                        return Err(Error::internal(format!(
                            "tensor '{}' is a variable tensor, but has {} as a producer",
                            tensor.id,
                            op.debug_name()
                        )));
                    }
                    (TensorType::ActGrad, None)
                        if !anchors.contains(&tensor.id) && !graph.is_input(&tensor.id) =>
                    {
                        return Err(Error::internal(format!(
                            "tensor '{}' is an actgrad tensor, but has no producer",
                            tensor.id
                        )));
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Every producer and consumer link is recorded on both ends.
    pub fn verify_connectivity(&self) -> Result<()> {
        self.verify_tensor_producers()?;
        for graph in self.graphs() {
            for op in graph.ops() {
                for (index, tensor) in op.output.iter() {
                    let node = graph.tensor(tensor)?;
                    if node.producer() != Some(op.id) {
                        return Err(Error::internal(format!(
                            "{} outputs '{tensor}' at {index} but the tensor's producer is {:?}",
                            op.debug_name(),
                            node.producer()
                        )));
                    }
                    if op.output.indices(tensor) != [index].as_slice() {
                        return Err(Error::internal(format!(
                            "{} outputs '{tensor}' at several indices",
                            op.debug_name()
                        )));
                    }
                }
                for tensor in op.input.unique_tensors() {
                    let recorded = graph.tensor(&tensor)?.consumers.n(op.id);
                    let actual = op.input.indices(&tensor).len();
                    if recorded != actual {
                        return Err(Error::internal(format!(
                            "'{tensor}' records {recorded} uses by {} but the op reads it {actual} times",
                            op.debug_name()
                        )));
                    }
                }
            }
            for tensor in graph.tensors().iter() {
                if let Some(producer) = tensor.producer() {
                    let op = graph.op(producer)?;
                    if !op.output.contains(&tensor.id) {
                        return Err(Error::internal(format!(
                            "'{}' names {} as producer but is not among its outputs",
                            tensor.id,
                            op.debug_name()
                        )));
                    }
                }
                for (consumer, count) in tensor.consumers.iter() {
                    let op = graph.op(consumer)?;
                    if op.input.indices(&tensor.id).len() != count {
                        return Err(Error::internal(format!(
                            "'{}' records {count} uses by {} which reads it {} times",
                            tensor.id,
                            op.debug_name(),
                            op.input.indices(&tensor.id).len()
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Tensor ids are unique across all graphs.
    pub fn verify_tensor_ids(&self) -> Result<()> {
        let mut owners: BTreeMap<TensorId, GraphId> = BTreeMap::new();
        for graph in self.graphs() {
            for id in graph.tensors().ids() {
                if let Some(other) = owners.insert(id.clone(), graph.id().clone()) {
                    return Err(Error::collision(format!(
                        "tensor '{id}' exists in both graph '{other}' and graph '{}'",
                        graph.id()
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn verify_tensor_infos(&self) -> Result<()> {
        for graph in self.graphs() {
            if let Some(tensor) = graph
                .tensors()
                .iter()
                .find(|tensor| tensor.info.dtype == DataType::Undefined)
            {
                return Err(Error::internal(format!(
                    "tensor '{}' in graph '{}' has no data type",
                    tensor.id,
                    graph.id()
                )));
            }
        }
        Ok(())
    }

    /// Reports ops left with only constant inputs. Never fails on its own.
    pub fn verify_const_expr_folding(&self) -> Result<()> {
        for graph in self.graphs() {
            for op in graph.ops() {
                if op.input.is_empty() || op.has_side_effect() {
                    continue;
                }
                let mut all_const = true;
                for tensor in op.input.unique_tensors() {
                    all_const &= graph.tensor(&tensor)?.is_const();
                }
                if all_const {
                    debug!(target: "kiln::ir", op = %op.debug_name(), "op with only constant inputs was not folded");
                }
            }
        }
        Ok(())
    }

    /// Every anchor must name a tensor of the main graph.
    pub fn validate_anchors(&self) -> Result<()> {
        let main = self.main_graph()?;
        for anchor in self.data_flow().anchor_ids() {
            if main.tensors().contains(anchor) {
                continue;
            }
            let mut message = format!("anchor tensor '{anchor}' is not in the IR");
            if let Some(forward) = anchor.non_grad() {
                if main.tensors().contains(&forward) {
                    message.push_str(&format!(
                        "; '{forward}' exists but not all tensors can have their gradients anchored"
                    ));
                }
            } else if main.tensors().contains(&anchor.grad()) {
                message.push_str(&format!(
                    "; did you mean '{}'? Note that not all tensors can have their gradients anchored",
                    anchor.grad()
                ));
            }
            return Err(Error::user_model(message));
        }
        Ok(())
    }
}

fn check_group_meta_shapes(graph: &Graph, op: &Op, inputs: &[usize], outputs: &[usize]) -> Result<()> {
    let mut meta: Option<(TensorId, Vec<i64>)> = None;
    let ids = inputs
        .iter()
        .filter_map(|index| op.input.tensor(*index))
        .chain(outputs.iter().filter_map(|index| op.output.tensor(*index)));
    for id in ids {
        let info = graph.info(id)?;
        if info.meta_shape.is_empty() {
            continue;
        }
        match &meta {
            None => meta = Some((id.clone(), info.meta_shape.clone())),
            Some((first, shape)) if *shape != info.meta_shape => {
                return Err(Error::internal(format!(
                    "{}: sharded tensors '{first}' {shape:?} and '{id}' {:?} in one group disagree on the full shape",
                    op.debug_name(),
                    info.meta_shape
                )));
            }
            Some(_) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::error::ErrorKind;
    use crate::ir::ids::TensorId;
    use crate::ir::op::{Attributes, Settings};
    use crate::ir::tensor::TensorType;
    use crate::ir::tensor_info::{DataType, TensorInfo};
    use crate::model::Model;
    use crate::ops::opids;
    use crate::session::{
        AnchorReturnType, DataFlow, DeviceInfo, Ir, IrBundle, SessionOptions, VirtualGraphMode,
    };
    use crate::GraphId;

    fn chain_ir(bundle: IrBundle, vgids: &[Option<i64>]) -> Ir {
        let mut ir = Ir::new(bundle);
        let main = ir.main_graph_mut().unwrap();
        main.tensors_mut()
            .add_stream(TensorId::from("t0"), TensorInfo::new(DataType::Float, vec![2]))
            .unwrap();
        for (k, vgid) in vgids.iter().enumerate() {
            let mut settings = Settings::new(GraphId::main(), format!("r{k}"));
            settings.vgraph_id = *vgid;
            main.create_connected_op(
                &opids::relu(),
                settings,
                Attributes::new(),
                &[(0, TensorId::new(format!("t{k}")))],
                &[(0, TensorId::new(format!("t{}", k + 1)))],
            )
            .unwrap();
        }
        ir
    }

    fn manual(num_ipus: u32) -> IrBundle {
        let options = SessionOptions {
            virtual_graph_mode: VirtualGraphMode::Manual,
            ..SessionOptions::default()
        };
        IrBundle::new(Model::default())
            .with_options(options)
            .with_device(DeviceInfo::with_ipus(num_ipus))
    }

    #[test]
    fn partial_placement_is_rejected() {
        let ir = chain_ir(manual(2), &[Some(0), None]);
        let err = ir.verify_virtual_graph_ids(false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(chain_ir(manual(2), &[Some(0), Some(1)])
            .verify_virtual_graph_ids(true)
            .is_ok());
    }

    #[test]
    fn manual_mode_without_placement_is_rejected() {
        let ir = chain_ir(manual(2), &[None, None]);
        assert!(ir.verify_virtual_graph_ids(false).is_err());
        let off = chain_ir(IrBundle::new(Model::default()), &[Some(0)]);
        assert!(off.verify_virtual_graph_ids(false).is_err());
    }

    #[test]
    fn out_of_range_partition_is_rejected() {
        let ir = chain_ir(manual(2), &[Some(0), Some(2)]);
        assert!(ir.verify_virtual_graph_ids(true).is_err());
    }

    #[test]
    fn pipelining_on_one_partition_is_rejected() {
        let options = SessionOptions {
            virtual_graph_mode: VirtualGraphMode::Manual,
            enable_pipelining: true,
            ..SessionOptions::default()
        };
        let bundle = IrBundle::new(Model::default())
            .with_options(options)
            .with_device(DeviceInfo::with_ipus(1));
        let ir = chain_ir(bundle, &[Some(0)]);
        assert_eq!(
            ir.verify_pipeline_settings().unwrap_err().kind(),
            ErrorKind::Configuration
        );
    }

    #[test]
    fn stage_on_two_partitions_is_rejected() {
        let options = SessionOptions {
            virtual_graph_mode: VirtualGraphMode::Manual,
            enable_pipelining: true,
            ..SessionOptions::default()
        };
        let bundle = IrBundle::new(Model::default())
            .with_options(options)
            .with_device(DeviceInfo::with_ipus(2));
        let mut ir = chain_ir(bundle, &[Some(0), Some(1)]);
        let main = ir.main_graph_mut().unwrap();
        for id in main.op_ids() {
            main.op_mut(id).unwrap().settings.pipeline_stage = Some(0);
        }
        assert!(ir.verify_pipeline_settings().is_err());
    }

    #[test]
    fn distributed_replication_bounds() {
        let mut options = SessionOptions::default();
        options.replication.enable_distributed_replicated_graphs = true;
        options.replication.global_replication_factor = 4;
        options.replication.global_replica_offset = 5;
        let ir = Ir::new(IrBundle::new(Model::default()).with_options(options.clone()));
        assert!(ir.verify_distributed_replicated_graph_settings().is_err());

        options.replication.global_replica_offset = 2;
        options.replication.enable_replicated_graphs = true;
        options.replication.replicated_graph_count = 2;
        let ir = Ir::new(IrBundle::new(Model::default()).with_options(options));
        assert!(ir.verify_distributed_replicated_graph_settings().is_ok());
    }

    #[test]
    fn connectivity_and_infos_hold_for_built_graphs() {
        let ir = chain_ir(IrBundle::new(Model::default()), &[None, None, None]);
        ir.verify_connectivity().unwrap();
        ir.verify_tensor_ids().unwrap();
        ir.verify_tensor_infos().unwrap();
    }

    #[test]
    fn tensor_roles_match_their_producers() {
        for role in [TensorType::Stream, TensorType::Const, TensorType::Variable] {
            let mut ir = chain_ir(IrBundle::new(Model::default()), &[None]);
            let main = ir.main_graph_mut().unwrap();
            main.tensors_mut()
                .get_mut(&TensorId::from("t1"))
                .unwrap()
                .tensor_type = role;
            let err = ir.verify_connectivity().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Internal, "{role:?}");
            assert!(err.message().contains("'t1'"));
        }
    }

    #[test]
    fn orphan_actgrad_must_be_anchored() {
        let mut ir = chain_ir(IrBundle::new(Model::default()), &[None]);
        ir.main_graph_mut()
            .unwrap()
            .tensors_mut()
            .add_act_grad(TensorId::from("orphan"))
            .unwrap();
        let err = ir.verify_tensor_producers().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.message().contains("has no producer"));

        let data_flow = DataFlow::new(1).anchor("orphan", AnchorReturnType::All);
        let mut ir = chain_ir(
            IrBundle::new(Model::default()).with_data_flow(data_flow),
            &[None],
        );
        ir.main_graph_mut()
            .unwrap()
            .tensors_mut()
            .add_act_grad(TensorId::from("orphan"))
            .unwrap();
        ir.verify_tensor_producers().unwrap();
    }

    #[test]
    fn missing_anchor_suggests_gradient() {
        let data_flow = DataFlow::new(1).anchor("t1", AnchorReturnType::All);
        let mut ir = chain_ir(
            IrBundle::new(Model::default()).with_data_flow(data_flow),
            &[None],
        );
        let main = ir.main_graph_mut().unwrap();
        main.rename_tensor(&TensorId::from("t1"), TensorId::from("t1").grad())
            .unwrap();
        let err = ir.validate_anchors().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UserModel);
        assert!(err.message().contains("Gradient___t1"));
        assert!(err.message().contains("not all tensors can have their gradients anchored"));
    }

    #[test]
    fn sharded_input_needs_a_declared_group() {
        let mut ir = chain_ir(IrBundle::new(Model::default()), &[]);
        let main = ir.main_graph_mut().unwrap();
        let sharded = TensorInfo::new(DataType::Float, vec![2]).with_meta_shape(vec![4]);
        main.tensors_mut()
            .add_stream(TensorId::from("s"), sharded)
            .unwrap();
        main.create_connected_op(
            &opids::add(),
            Settings::new(GraphId::main(), "add"),
            Attributes::new(),
            &[(0, TensorId::from("s")), (1, TensorId::from("t0"))],
            &[(0, TensorId::from("a"))],
        )
        .unwrap();
        ir.verify_replicated_tensor_sharding().unwrap();

        let main = ir.main_graph_mut().unwrap();
        main.create_connected_op(
            &opids::sum(),
            Settings::new(GraphId::main(), "sum"),
            Attributes::new(),
            &[(0, TensorId::from("s")), (1, TensorId::from("t0"))],
            &[(0, TensorId::from("b"))],
        )
        .unwrap();
        assert_eq!(
            ir.verify_replicated_tensor_sharding().unwrap_err().kind(),
            ErrorKind::Internal
        );
    }
}
