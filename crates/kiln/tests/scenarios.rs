use std::collections::{BTreeMap, BTreeSet};

use kiln::ir::{DataType, GraphId, TensorInfo, TensorType, KILN_DOMAIN};
use kiln::model::{reserved_attrs, AttributeValue, GraphTransformer, Model, ModelBuilder};
use kiln::ops::types;
use kiln::session::{AnchorReturnType, DeviceInfo, IrBundle, VirtualGraphMode};
use kiln::{Ir, SessionOptions};

fn float(shape: &[i64]) -> TensorInfo {
    TensorInfo::new(DataType::Float, shape.to_vec())
}

fn count_ops(ir: &Ir, op_type: &str) -> usize {
    ir.graphs()
        .flat_map(|graph| graph.ops())
        .filter(|op| op.opid.op_type == op_type)
        .count()
}

fn prepared(bundle: IrBundle) -> Ir {
    let mut ir = Ir::new(bundle.anchor_outputs(AnchorReturnType::Final));
    ir.prepare().unwrap();
    ir
}

#[test]
fn constant_concat_is_folded_into_its_consumer() {
    let mut builder = ModelBuilder::new();
    let c0 = builder.add_initializer("const0", float(&[2, 2, 3]), vec![1.0; 12]);
    let c1 = builder.add_initializer("const1", float(&[2, 2, 3]), vec![2.0; 12]);
    let external = builder.add_input("external_in", float(&[1, 1, 1]));
    let mut axis = BTreeMap::new();
    axis.insert("axis".to_string(), AttributeValue::Int(1));
    let concat = builder.node_with("Concat", "", &[&c0, &c1], axis);
    let sum = builder.node("Add", &[&concat, &external]);
    builder.add_output(&sum);

    let ir = prepared(IrBundle::new(builder.build()));
    let main = ir.main_graph().unwrap();
    assert_eq!(count_ops(&ir, types::CONCAT), 0);
    assert_eq!(main.n_ops(), 1);

    let add = main.ops().next().unwrap();
    assert_eq!(add.opid.op_type, types::ADD);
    assert!(add.has_input(1) && !add.has_input(2));
    let folded = main.tensor(add.in_id(0).unwrap()).unwrap();
    assert_eq!(folded.tensor_type, TensorType::Const);
    assert_eq!(folded.info.shape, vec![2, 4, 3]);
    assert_eq!(folded.data.as_ref().map(Vec::len), Some(24));
    assert_eq!(add.in_id(1).unwrap().as_str(), "external_in");
    assert_eq!(main.info(add.out_id(0).unwrap()).unwrap().shape, vec![2, 4, 3]);
}

#[test]
fn duplicate_relus_merge_then_go_inplace() {
    let mut builder = ModelBuilder::new();
    let x = builder.add_input("x", float(&[4]));
    let a = builder.node("Relu", &[&x]);
    let b = builder.node("Relu", &[&x]);
    let c = builder.node("Relu", &[&x]);
    let total = builder.node("Sum", &[&a, &b, &c]);
    builder.add_output(&total);

    let ir = prepared(IrBundle::new(builder.build()));
    assert_eq!(count_ops(&ir, types::RELU), 0);
    assert_eq!(count_ops(&ir, types::RELU_INPLACE), 1);

    let main = ir.main_graph().unwrap();
    let relu = main
        .ops()
        .find(|op| op.opid.op_type == types::RELU_INPLACE)
        .unwrap();
    let out = relu.out_id(0).unwrap();
    let consumers = main.consumers(out).unwrap();
    assert_eq!(consumers.len(), 1);
    let sum = main.op(consumers[0]).unwrap();
    assert_eq!(sum.input.indices(out), [0, 1, 2].as_slice());
}

#[test]
fn unused_initializers_are_removed_from_the_model() {
    let build = || {
        let mut builder = ModelBuilder::new();
        let x = builder.add_input("x", float(&[3]));
        builder.add_initializer("w0", float(&[3]), vec![0.0; 3]);
        let w1 = builder.add_initializer("w1", float(&[3]), vec![1.0; 3]);
        builder.add_initializer("w2", float(&[3]), vec![2.0; 3]);
        let y = builder.node("Add", &[&x, &w1]);
        builder.add_output(&y);
        builder.build()
    };

    let untouched: Model = build();
    assert_eq!(untouched.graph.inputs.len(), 4);
    assert_eq!(untouched.graph.initializers.len(), 3);

    let mut transformer = GraphTransformer::new(build());
    assert_eq!(transformer.remove_unused_inputs(), 2);
    let model = transformer.into_model();
    let inputs: Vec<&str> = model.graph.inputs.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(inputs, vec!["x", "w1"]);
    assert_eq!(model.graph.initializers.len(), 1);
    assert_eq!(model.graph.initializers[0].name, "w1");
}

#[test]
fn pruned_model_survives_a_json_round_trip() {
    let mut builder = ModelBuilder::new();
    let x = builder.add_input("x", float(&[2]));
    builder.add_initializer("unused", float(&[2]), vec![0.0; 2]);
    let y = builder.node("Relu", &[&x]);
    builder.add_output(&y);
    let json = builder.build().to_json().unwrap();

    let mut transformer = GraphTransformer::from_json(&json).unwrap();
    transformer.remove_unused_inputs();
    let reparsed = Model::from_json(&transformer.to_json().unwrap()).unwrap();
    assert_eq!(&reparsed, transformer.model());
    assert!(reparsed.graph.initializers.is_empty());
}

fn layered_model(layers: usize) -> Model {
    let mut builder = ModelBuilder::new();
    let mut current = builder.add_input("x", float(&[8]));
    for _ in 0..layers {
        current = builder.node("Relu", &[&current]);
    }
    builder.add_output(&current);
    builder.build()
}

#[test]
fn auto_sharding_places_every_op_on_one_of_three_partitions() {
    let options = SessionOptions {
        virtual_graph_mode: VirtualGraphMode::Auto,
        ..SessionOptions::default()
    };
    let bundle = IrBundle::new(layered_model(6))
        .with_options(options)
        .with_device(DeviceInfo::with_ipus(3));
    let ir = prepared(bundle);
    let main = ir.main_graph().unwrap();

    let seen: BTreeSet<i64> = main.ops().filter_map(|op| op.settings.vgraph_id).collect();
    assert_eq!(seen, [0, 1, 2].into_iter().collect());
    assert!(count_ops(&ir, types::IPU_COPY) > 0);

    for op in main.ops().filter(|op| !op.is_ipu_copy()) {
        let vgid = op.settings.vgraph_id;
        assert!(vgid.is_some(), "{} was not placed", op.debug_name());
        for (_, tensor) in op.input.iter().chain(op.output.iter()) {
            assert_eq!(
                main.tensor_vgraph_id(tensor).unwrap(),
                vgid,
                "{tensor} is not on the partition of {}",
                op.debug_name()
            );
        }
    }
}

#[test]
fn disabled_sharding_drops_annotated_placement() {
    let mut builder = ModelBuilder::new();
    let x = builder.add_input("x", float(&[8]));
    let y = builder.node("Relu", &[&x]);
    let z = builder.node("Relu", &[&y]);
    builder.annotate(&y, reserved_attrs::VIRTUAL_GRAPH, AttributeValue::Int(0));
    builder.annotate(&z, reserved_attrs::VIRTUAL_GRAPH, AttributeValue::Int(1));
    builder.add_output(&z);

    let ir = prepared(IrBundle::new(builder.build()).with_device(DeviceInfo::with_ipus(3)));
    assert_eq!(count_ops(&ir, types::IPU_COPY), 0);
    for graph in ir.graphs() {
        assert!(graph.ops().all(|op| op.settings.vgraph_id.is_none()));
        for tensor in graph.tensors().ids() {
            assert_eq!(graph.tensor_vgraph_id(&tensor).unwrap(), None);
        }
    }
}

#[test]
fn called_bodies_are_prepared_alongside_the_main_graph() {
    let mut body = ModelBuilder::new();
    let bx = body.add_input("x", float(&[4]));
    let by = body.node("Relu", &[&bx]);
    let bz = body.node("Neg", &[&by]);
    body.add_output(&bz);
    let body = body.build_graph("body");

    let mut builder = ModelBuilder::new();
    let x = builder.add_input("x", float(&[4]));
    let out = builder.call(&body, &[&x]);
    builder.add_output(&out[0]);

    let ir = prepared(IrBundle::new(builder.build()));
    let callee = GraphId::from("body");
    assert!(ir.has_graph(&callee));
    let order = ir.graph_schedule().unwrap();
    assert_eq!(order.last(), Some(&GraphId::main()));
    let schedule = ir.get_op_schedule(kiln::ir::RequireOptimal::No).unwrap();
    let calls = schedule
        .iter()
        .filter(|(graph, op)| {
            let opid = &ir.graph(graph).unwrap().op(*op).unwrap().opid;
            opid.domain == KILN_DOMAIN && opid.op_type == types::CALL
        })
        .count();
    assert_eq!(calls, 1);
    assert_eq!(schedule.len(), ir.graph(&callee).unwrap().n_ops() + 1);
}

#[test]
fn partition_crossings_inside_called_bodies_get_copies() {
    let mut body = ModelBuilder::new();
    let bx = body.add_input("x", float(&[4]));
    let by = body.node("Relu", &[&bx]);
    let bz = body.node("Neg", &[&by]);
    body.annotate(&by, reserved_attrs::VIRTUAL_GRAPH, AttributeValue::Int(0));
    body.annotate(&bz, reserved_attrs::VIRTUAL_GRAPH, AttributeValue::Int(1));
    body.add_output(&bz);
    let body = body.build_graph("body");

    let mut builder = ModelBuilder::new();
    let x = builder.add_input("x", float(&[4]));
    let out = builder.call(&body, &[&x]);
    builder.annotate(&out[0], reserved_attrs::VIRTUAL_GRAPH, AttributeValue::Int(0));
    builder.add_output(&out[0]);

    let options = SessionOptions {
        virtual_graph_mode: VirtualGraphMode::Manual,
        ..SessionOptions::default()
    };
    let ir = prepared(
        IrBundle::new(builder.build())
            .with_options(options)
            .with_device(DeviceInfo::with_ipus(2)),
    );

    let callee = ir.graph(&GraphId::from("body")).unwrap();
    let copies: Vec<_> = callee.ops().filter(|op| op.is_ipu_copy()).collect();
    assert_eq!(copies.len(), 1);
    assert_eq!(copies[0].settings.vgraph_id, Some(0));
    let copied = copies[0].out_id(0).unwrap();
    assert_eq!(callee.tensor_vgraph_id(copied).unwrap(), Some(1));
    for reader in callee.consumers(copied).unwrap() {
        assert_eq!(callee.op(reader).unwrap().settings.vgraph_id, Some(1));
    }
    assert!(ir.main_graph().unwrap().ops().all(|op| !op.is_ipu_copy()));
}

#[test]
fn repeated_blocks_share_one_outlined_body() {
    let mut builder = ModelBuilder::new();
    let mut x = builder.add_input("x", float(&[4]));
    for _ in 0..3 {
        let e = builder.node("Exp", &[&x]);
        x = builder.node("Sigmoid", &[&e]);
    }
    builder.add_output(&x);

    let options = SessionOptions {
        enable_outlining: true,
        ..SessionOptions::default()
    };
    let ir = prepared(IrBundle::new(builder.build()).with_options(options));

    let main = ir.main_graph().unwrap();
    assert_eq!(main.n_ops(), 3);
    assert!(main.ops().all(|op| op.opid.op_type == types::CALL));
    let callees: BTreeSet<GraphId> = main.ops().flat_map(|op| op.called_graphs()).collect();
    assert_eq!(callees.len(), 1);
    let body = ir.graph(callees.iter().next().unwrap()).unwrap();
    assert_eq!(body.n_ops(), 2);
    assert_eq!(body.inputs().len(), 1);
    assert_eq!(body.outputs().len(), 1);
    assert_eq!(ir.graph_schedule().unwrap().last(), Some(&GraphId::main()));
}

#[test]
fn outlining_is_off_by_default() {
    let mut builder = ModelBuilder::new();
    let mut x = builder.add_input("x", float(&[4]));
    for _ in 0..2 {
        let e = builder.node("Exp", &[&x]);
        x = builder.node("Sigmoid", &[&e]);
    }
    builder.add_output(&x);

    let ir = prepared(IrBundle::new(builder.build()));
    assert_eq!(count_ops(&ir, types::CALL), 0);
    assert_eq!(ir.graph_ids(), vec![GraphId::main()]);
}
