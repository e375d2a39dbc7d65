use kiln::ir::{
    DataType, GraphId, LossPath, OpId, OpsBeforeKey, RequireOptimal, TensorId, TensorInfo,
    TensorType, Vertex, KILN_DOMAIN,
};
use kiln::model::{reserved_attrs, AttributeValue, Model, ModelBuilder};
use kiln::ops::types;
use kiln::pattern::{Patterns, PatternsLevel};
use kiln::session::{
    AnchorReturnType, DataFlow, DeviceInfo, InputShapeInfo, IrBundle, Optimizer, PreparePhase,
    VirtualGraphMode,
};
use kiln::transform::{ConstExprFolding, Transform};
use kiln::{ErrorKind, Ir, SessionOptions};

fn float(shape: &[i64]) -> TensorInfo {
    TensorInfo::new(DataType::Float, shape.to_vec())
}

/// `out = Relu(x + c) + c` with a constant `c`.
fn inference_model() -> Model {
    let mut builder = ModelBuilder::new();
    let x = builder.add_input("x", float(&[4]));
    let c = builder.add_initializer("c", float(&[4]), vec![0.5; 4]);
    let a = builder.node("Add", &[&x, &c]);
    let r = builder.node("Relu", &[&a]);
    let out = builder.node("Add", &[&r, &c]);
    builder.add_output(&out);
    builder.build()
}

fn anchored(model: Model) -> IrBundle {
    IrBundle::new(model).anchor_outputs(AnchorReturnType::All)
}

fn count(ir: &Ir, op_type: &str) -> usize {
    ir.graphs()
        .flat_map(|graph| graph.ops())
        .filter(|op| op.opid.op_type == op_type)
        .count()
}

#[test]
fn second_prepare_fails_without_touching_the_ir() {
    let mut ir = Ir::new(anchored(inference_model()));
    assert_eq!(ir.phase(), PreparePhase::Unprepared);
    ir.prepare().unwrap();
    assert!(ir.is_prepared());
    let before = ir.serialise_json().unwrap();
    let hash = ir.hash();
    assert!(hash.is_some());

    let err = ir.prepare().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyPrepared);
    assert_eq!(ir.serialise_json().unwrap(), before);
    assert_eq!(ir.hash(), hash);
    assert_eq!(ir.phase(), PreparePhase::Prepared);
}

#[test]
fn partial_manual_placement_is_rejected() {
    let mut builder = ModelBuilder::new();
    let x = builder.add_input("x", float(&[4]));
    let y = builder.node("Relu", &[&x]);
    let z = builder.node("Neg", &[&y]);
    builder.annotate(&y, reserved_attrs::VIRTUAL_GRAPH, AttributeValue::Int(0));
    builder.add_output(&z);
    let options = SessionOptions {
        virtual_graph_mode: VirtualGraphMode::Manual,
        ..SessionOptions::default()
    };

    let mut ir = Ir::new(anchored(builder.build()).with_options(options));
    let err = ir.prepare().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(!ir.is_prepared());
}

#[test]
fn inplacing_never_writes_constants_and_keeps_the_graph_schedulable() {
    let mut ir = Ir::new(anchored(inference_model()));
    ir.prepare().unwrap();
    let main = ir.main_graph().unwrap();

    assert_eq!(count(&ir, types::RELU_INPLACE), 1);
    assert!(main.is_schedulable(&OpsBeforeKey::new()));
    for op in main.ops() {
        for index in op.modified_indices() {
            let tensor = main.tensor(op.in_id(index).unwrap()).unwrap();
            assert!(
                !matches!(tensor.tensor_type, TensorType::Const | TensorType::Variable),
                "{} modifies {}",
                op.debug_name(),
                tensor.id
            );
        }
    }
    let schedule = ir.get_op_schedule(RequireOptimal::Yes).unwrap();
    assert_eq!(schedule.len(), main.n_ops());
}

#[test]
fn disabled_inplacing_keeps_outplace_ops() {
    let mut patterns = Patterns::new(PatternsLevel::Default);
    patterns.set_inplace(false);
    let mut ir = Ir::new(anchored(inference_model()).with_patterns(patterns));
    ir.prepare().unwrap();
    assert_eq!(count(&ir, types::RELU), 1);
    assert_eq!(count(&ir, types::RELU_INPLACE), 0);
}

#[test]
fn cached_program_skips_the_pipeline() {
    let mut builder = ModelBuilder::new();
    let c0 = builder.add_initializer("c0", float(&[2]), vec![1.0, 2.0]);
    let c1 = builder.add_initializer("c1", float(&[2]), vec![3.0, 4.0]);
    let x = builder.add_input("x", float(&[2]));
    let folded = builder.node("Add", &[&c0, &c1]);
    let y = builder.node("Add", &[&folded, &x]);
    builder.add_output(&y);
    let model = builder.build();

    let options = SessionOptions {
        enable_engine_caching: true,
        ..SessionOptions::default()
    };
    let bundle = anchored(model.clone()).with_options(options.clone());
    let hash = bundle.hash().unwrap();

    let mut cached = Ir::new(bundle.with_cached_hashes([hash]));
    cached.prepare().unwrap();
    assert!(cached.is_prepared());
    assert_eq!(cached.hash(), Some(hash));
    assert_eq!(cached.main_graph().unwrap().n_ops(), 2);

    let mut fresh = Ir::new(anchored(model).with_options(options));
    fresh.prepare().unwrap();
    assert_eq!(fresh.hash(), Some(hash));
    assert_eq!(fresh.main_graph().unwrap().n_ops(), 1);
}

#[test]
fn disabled_transforms_are_skipped() {
    let mut builder = ModelBuilder::new();
    let c0 = builder.add_initializer("c0", float(&[2]), vec![1.0, 2.0]);
    let c1 = builder.add_initializer("c1", float(&[2]), vec![3.0, 4.0]);
    let x = builder.add_input("x", float(&[2]));
    let folded = builder.node("Add", &[&c0, &c1]);
    let y = builder.node("Add", &[&folded, &x]);
    builder.add_output(&y);

    let mut ir = Ir::new(anchored(builder.build()));
    let fold = ir.transforms().by_name(ConstExprFolding::NAME).unwrap().id();
    ir.transforms_mut().set_enabled(fold, false);
    ir.prepare().unwrap();
    assert_eq!(ir.main_graph().unwrap().n_ops(), 2);

    let skipped = ir.apply_transform(fold, &GraphId::main()).unwrap();
    assert!(!skipped.changed);
    assert_eq!(ir.main_graph().unwrap().n_ops(), 2);

    ir.transforms_mut().set_enabled(fold, true);
    let applied = ir.apply_transform(fold, &GraphId::main()).unwrap();
    assert!(applied.changed);
    assert_eq!(ir.main_graph().unwrap().n_ops(), 1);

    let err = ir.apply_transform(0, &GraphId::main()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn training_builds_a_backward_pass_and_variable_updates() {
    let mut builder = ModelBuilder::new();
    let x = builder.add_input("x", float(&[4]));
    let w = builder.add_initializer("w", float(&[4]), vec![0.1; 4]);
    let y = builder.node("Mul", &[&x, &w]);
    let loss = builder.node_with("L1", KILN_DOMAIN, &[&y], Default::default());
    builder.add_output(&loss);

    let bundle = IrBundle::new(builder.build())
        .with_training(loss.as_str(), Optimizer::ConstSgd { learning_rate: 0.01 })
        .with_data_flow(DataFlow::new(1).anchor(loss.as_str(), AnchorReturnType::All));
    assert!(bundle.data_flow.is_anchored(&TensorId::from(loss.as_str())));
    let mut ir = Ir::new(bundle);
    assert!(ir.can_train());
    ir.prepare().unwrap();

    let main = ir.main_graph().unwrap();
    let w = TensorId::from("w");
    assert_eq!(main.tensor(&w).unwrap().tensor_type, TensorType::Variable);
    assert_eq!(ir.final_loss(), Some(&TensorId::from(loss.as_str())));
    assert_eq!(count(&ir, types::SGD_VAR_UPDATE), 1);
    assert_eq!(count(&ir, types::L1_GRAD), 1);

    let update = main
        .ops()
        .find(|op| op.opid.op_type == types::SGD_VAR_UPDATE)
        .unwrap();
    assert_eq!(update.in_id(0).unwrap(), &w);
    assert!(update.modifies(0));
    assert_eq!(update.from_loss(), LossPath::Yes);
    let loss_op = main.producer(&TensorId::from(loss.as_str())).unwrap().unwrap();
    assert_eq!(loss_op.to_loss(), LossPath::Yes);

    // Every reader of the variable runs before its update.
    let schedule = ir.graph_op_schedule(main.id(), RequireOptimal::Yes).unwrap();
    let at = |id: OpId| schedule.iter().position(|op| *op == id).unwrap();
    for reader in main.consumers(&w).unwrap() {
        if reader != update.id {
            assert!(at(reader) < at(update.id));
        }
    }
}

#[test]
fn missing_anchor_is_a_model_error() {
    let data_flow = DataFlow::new(1).anchor("nowhere", AnchorReturnType::Final);
    let mut ir = Ir::new(IrBundle::new(inference_model()).with_data_flow(data_flow));
    let err = ir.prepare().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UserModel);
    assert!(err.message().contains("nowhere"));
}

#[test]
fn untyped_inputs_take_their_shape_from_the_session() {
    let mut builder = ModelBuilder::new();
    let x = builder.add_untyped_input("x");
    let y = builder.node("Relu", &[&x]);
    builder.add_output(&y);
    let model = builder.build();

    let mut missing = Ir::new(anchored(model.clone()));
    assert_eq!(missing.prepare().unwrap_err().kind(), ErrorKind::UserModel);

    let mut shapes = InputShapeInfo::new();
    shapes.add("x", float(&[3, 5]));
    let mut ir = Ir::new(anchored(model).with_input_shapes(shapes));
    ir.prepare().unwrap();
    let main = ir.main_graph().unwrap();
    assert_eq!(main.info(&TensorId::from(y.as_str())).unwrap().shape, vec![3, 5]);
}

#[test]
fn gradient_accumulation_needs_training() {
    let mut options = SessionOptions::default();
    options.accumulation.enable_gradient_accumulation = true;
    options.accumulation.accumulation_factor = 4;
    let mut ir = Ir::new(anchored(inference_model()).with_options(options));
    assert_eq!(ir.prepare().unwrap_err().kind(), ErrorKind::Configuration);
}

#[test]
fn inference_without_anchors_is_rejected() {
    let mut ir = Ir::new(IrBundle::new(inference_model()));
    let err = ir.prepare().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UserModel);
    assert!(err.message().contains("anchor"));
    assert!(!ir.is_prepared());
    assert_eq!(ir.main_graph().unwrap().n_ops(), 0);

    let mut ir = Ir::new(anchored(inference_model()));
    ir.prepare().unwrap();
    assert!(ir.is_prepared());
}

/// `loss = L1(Relu(x * w) + x * w)` split over two partitions.
fn two_partition_training(pipelined: bool) -> Ir {
    let mut builder = ModelBuilder::new();
    let x = builder.add_input("x", float(&[4]));
    let w = builder.add_initializer("w", float(&[4]), vec![0.1; 4]);
    let y = builder.node("Mul", &[&x, &w]);
    let r = builder.node("Relu", &[&y]);
    let s = builder.node("Add", &[&r, &y]);
    let loss = builder.node_with("L1", KILN_DOMAIN, &[&s], Default::default());
    for (tensor, vgid) in [(&y, 0), (&r, 0), (&s, 1), (&loss, 1)] {
        builder.annotate(tensor, reserved_attrs::VIRTUAL_GRAPH, AttributeValue::Int(vgid));
    }
    builder.add_output(&loss);

    let options = SessionOptions {
        virtual_graph_mode: VirtualGraphMode::Manual,
        enable_pipelining: pipelined,
        ..SessionOptions::default()
    };
    let bundle = IrBundle::new(builder.build())
        .with_options(options)
        .with_device(DeviceInfo::with_ipus(2))
        .with_training(loss.as_str(), Optimizer::ConstSgd { learning_rate: 0.01 })
        .with_data_flow(DataFlow::new(1).anchor(loss.as_str(), AnchorReturnType::All));
    let mut ir = Ir::new(bundle);
    ir.prepare().unwrap();
    ir
}

#[test]
fn pipelined_training_restores_stashed_activations() {
    let ir = two_partition_training(true);
    let main = ir.main_graph().unwrap();
    let stashes = count(&ir, types::STASH);
    assert!(stashes > 0);
    assert_eq!(count(&ir, types::RESTORE_INPLACE), stashes);

    // The relu output is restored while its input is copied across partitions,
    // so the relu may not write into its input.
    assert_eq!(count(&ir, types::RELU), 1);
    assert_eq!(count(&ir, types::RELU_INPLACE), 0);

    let relu_grad = main
        .ops()
        .find(|op| op.opid.op_type == types::RELU_GRAD)
        .unwrap();
    let restored = main.producer(relu_grad.in_id(1).unwrap()).unwrap().unwrap();
    assert_eq!(restored.opid.op_type, types::RESTORE_INPLACE);
    assert_eq!(restored.settings.pipeline_stage, Some(0));
    ir.verify_pipeline_stage_attributes().unwrap();
}

#[test]
fn unpipelined_training_stashes_nothing() {
    let ir = two_partition_training(false);
    assert_eq!(count(&ir, types::STASH), 0);
    assert_eq!(count(&ir, types::RESTORE_INPLACE), 0);
}
