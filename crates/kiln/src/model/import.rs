//! Construction of the forward graphs from a [`Model`].

use std::collections::BTreeSet;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::ir::graph::Graph;
use crate::ir::ids::{reserved, GraphId, TensorId};
use crate::ir::op::{Attribute, Attributes, OperatorIdentifier, RecomputeType, Settings};
use crate::ir::tensor::{Tensor, TensorType};
use crate::ir::tensor_info::TensorInfo;
use crate::model::format::{canonical_domain, AttributeValue, GraphDef, Model, NodeDef};
use crate::ops::OpRegistry;
use crate::session::InputShapeInfo;

/// Node attributes that carry op settings rather than operator attributes.
pub mod reserved_attrs {
    pub const VIRTUAL_GRAPH: &str = "__virtual_graph";
    pub const PIPELINE_STAGE: &str = "__pipeline_stage";
    pub const EXECUTION_PHASE: &str = "__execution_phase";
    pub const RECOMPUTE: &str = "__recompute";
    pub const SCHEDULE_PRIORITY: &str = "__schedule_priority";
    pub const EXCLUDE_PATTERNS: &str = "__exclude_patterns";

    pub fn is_reserved(name: &str) -> bool {
        name.starts_with("__")
    }
}

/// Builds the main graph and every graph called from it.
///
/// Initializers become variables when `training`, constants otherwise; other
/// graph inputs become streams whose info comes from `shapes` or the model.
/// The main graph is the first element of the result.
pub fn import_model(
    model: &Model,
    shapes: &InputShapeInfo,
    training: bool,
    registry: &Arc<OpRegistry>,
    op_counter: &Arc<AtomicU64>,
) -> Result<Vec<Graph>> {
    let mut importer = Importer {
        model,
        shapes,
        training,
        registry,
        op_counter,
        subgraphs: Vec::new(),
        graph_ids: BTreeSet::from([GraphId::main()]),
    };
    let main = importer.import_main(&model.graph)?;
    let mut graphs = Vec::with_capacity(importer.subgraphs.len() + 1);
    graphs.push(main);
    graphs.append(&mut importer.subgraphs);
    debug!(target: "kiln::ir", graphs = graphs.len(), ops = graphs.iter().map(Graph::n_ops).sum::<usize>(), "imported model");
    Ok(graphs)
}

struct Importer<'a> {
    model: &'a Model,
    shapes: &'a InputShapeInfo,
    training: bool,
    registry: &'a Arc<OpRegistry>,
    op_counter: &'a Arc<AtomicU64>,
    subgraphs: Vec<Graph>,
    graph_ids: BTreeSet<GraphId>,
}

fn check_user_name(name: &str) -> Result<()> {
    if let Some(prefix) = reserved::prefix_of(name) {
        return Err(Error::user_model(format!(
            "tensor name '{name}' uses the reserved prefix '{prefix}'"
        )));
    }
    Ok(())
}

impl Importer<'_> {
    fn new_graph(&self, id: GraphId) -> Graph {
        Graph::new(id, Arc::clone(self.registry), Arc::clone(self.op_counter))
    }

    fn import_main(&mut self, def: &GraphDef) -> Result<Graph> {
        let mut graph = self.new_graph(GraphId::main());
        self.add_initializers(&mut graph, def, self.training)?;

        let mut seen = BTreeSet::new();
        for input in &def.inputs {
            if !seen.insert(input.name.as_str()) {
                return Err(Error::user_model(format!(
                    "duplicate graph input '{}'",
                    input.name
                )));
            }
            if def.is_initializer(&input.name) {
                continue;
            }
            check_user_name(&input.name)?;
            let id = TensorId::new(input.name.as_str());
            let info = self
                .shapes
                .get(&id)
                .cloned()
                .or_else(|| input.info())
                .ok_or_else(|| {
                    Error::user_model(format!(
                        "no shape or type for input '{}'; declare it in the model or pass it in the input shape info",
                        input.name
                    ))
                })?;
            graph.tensors_mut().add_stream(id.clone(), info)?;
            graph.mark_as_input(&id)?;
        }

        self.add_nodes(&mut graph, def)?;
        self.mark_outputs(&mut graph, def)?;
        Ok(graph)
    }

    fn import_subgraph(&mut self, def: &GraphDef, id: GraphId) -> Result<Graph> {
        let mut graph = self.new_graph(id.clone());
        self.add_initializers(&mut graph, def, false)?;
        for input in &def.inputs {
            if def.is_initializer(&input.name) {
                continue;
            }
            check_user_name(&input.name)?;
            let info = input.info().ok_or_else(|| {
                Error::user_model(format!(
                    "input '{}' of graph '{id}' has no shape or type",
                    input.name
                ))
            })?;
            graph.add_input(id.scoped(&input.name), info)?;
        }
        self.add_nodes(&mut graph, def)?;
        self.mark_outputs(&mut graph, def)?;
        Ok(graph)
    }

    fn add_initializers(&self, graph: &mut Graph, def: &GraphDef, variables: bool) -> Result<()> {
        for init in &def.initializers {
            check_user_name(&init.name)?;
            let id = graph.id().scoped(&init.name);
            if graph.tensors().contains(&id) {
                return Err(Error::user_model(format!(
                    "duplicate initializer '{}'",
                    init.name
                )));
            }
            if variables {
                graph
                    .tensors_mut()
                    .add_var_init(id, init.info(), init.data.clone())?;
            } else {
                graph
                    .tensors_mut()
                    .add_const_init(id, init.info(), init.data.clone())?;
            }
        }
        Ok(())
    }

    fn mark_outputs(&self, graph: &mut Graph, def: &GraphDef) -> Result<()> {
        for output in &def.outputs {
            let id = graph.id().scoped(&output.name);
            if !graph.tensors().contains(&id) {
                return Err(Error::user_model(format!(
                    "graph '{}' declares output '{}' which nothing produces",
                    graph.id(),
                    output.name
                )));
            }
            graph.mark_as_output(&id)?;
        }
        Ok(())
    }

    fn add_nodes(&mut self, graph: &mut Graph, def: &GraphDef) -> Result<()> {
        for (position, node) in def.nodes.iter().enumerate() {
            self.add_node(graph, node)
                .map_err(|err| err.context(format!("importing node {position} ('{}')", node.name)))?;
        }
        Ok(())
    }

    fn add_node(&mut self, graph: &mut Graph, node: &NodeDef) -> Result<()> {
        let domain = canonical_domain(&node.domain);
        let opid = OperatorIdentifier::new(
            domain,
            node.op_type.as_str(),
            self.model.opset_version(&node.domain),
        );
        let settings = node_settings(graph.id(), node)?;

        let mut attrs = Attributes::new();
        let mut callee_outputs: Option<Vec<TensorInfo>> = None;
        for (name, value) in &node.attributes {
            if reserved_attrs::is_reserved(name) {
                continue;
            }
            let attr = match value {
                AttributeValue::Int(v) => Attribute::Int(*v),
                AttributeValue::Float(v) => Attribute::Float(*v),
                AttributeValue::Ints(v) => Attribute::Ints(v.clone()),
                AttributeValue::Floats(v) => Attribute::Floats(v.clone()),
                AttributeValue::String(v) => Attribute::String(v.clone()),
                AttributeValue::Strings(v) => Attribute::Strings(v.clone()),
                AttributeValue::Graph(body) => {
                    let id = self.subgraph_id(node, name, body)?;
                    let sub = self.import_subgraph(body, id.clone())?;
                    if callee_outputs.is_none() {
                        let mut infos = Vec::with_capacity(sub.outputs().len());
                        for output in sub.outputs() {
                            infos.push(sub.info(output)?.clone());
                        }
                        callee_outputs = Some(infos);
                    }
                    self.subgraphs.push(sub);
                    Attribute::Graph(id)
                }
            };
            attrs.insert(name.clone(), attr);
        }

        let mut inputs = Vec::with_capacity(node.inputs.len());
        for (index, name) in node.inputs.iter().enumerate() {
            if name.is_empty() {
                continue;
            }
            let id = graph.id().scoped(name);
            if !graph.tensors().contains(&id) {
                return Err(Error::user_model(format!(
                    "{} reads '{name}' which is neither an input nor produced earlier",
                    node.op_type
                )));
            }
            inputs.push((index, id));
        }
        let mut outputs = Vec::with_capacity(node.outputs.len());
        for (index, name) in node.outputs.iter().enumerate() {
            if name.is_empty() {
                continue;
            }
            check_user_name(name)?;
            let id = graph.id().scoped(name);
            if graph.tensors().contains(&id) {
                return Err(Error::user_model(format!(
                    "tensor '{name}' is defined more than once"
                )));
            }
            outputs.push((index, id));
        }

        match callee_outputs {
            None => {
                graph.create_connected_op(&opid, settings, attrs, &inputs, &outputs)?;
            }
            Some(infos) => {
                let op = graph.create_op(&opid, settings, attrs)?;
                for (index, id) in &inputs {
                    graph.connect_in(op, *index, id)?;
                }
                for (index, id) in outputs {
                    let info = infos.get(index).cloned().ok_or_else(|| {
                        Error::user_model(format!(
                            "{} has output {index} but the called graph has only {} outputs",
                            node.op_type,
                            infos.len()
                        ))
                    })?;
                    graph
                        .tensors_mut()
                        .insert(Tensor::new(id.clone(), TensorType::ActGrad, info))?;
                    graph.connect_out(op, index, &id)?;
                }
                graph.setup_op(op)?;
            }
        }
        Ok(())
    }

    fn subgraph_id(&mut self, node: &NodeDef, attr: &str, body: &GraphDef) -> Result<GraphId> {
        let id = if body.name.is_empty() {
            let owner = if node.name.is_empty() {
                node.op_type.as_str()
            } else {
                node.name.as_str()
            };
            GraphId::new(format!("{owner}_{attr}"))
        } else {
            GraphId::new(body.name.as_str())
        };
        if !self.graph_ids.insert(id.clone()) {
            return Err(Error::user_model(format!("graph name '{id}' is used twice")));
        }
        Ok(id)
    }
}

fn int_attr(node: &NodeDef, name: &str) -> Result<Option<i64>> {
    match node.attributes.get(name) {
        None => Ok(None),
        Some(AttributeValue::Int(value)) => Ok(Some(*value)),
        Some(other) => Err(Error::user_model(format!(
            "attribute '{name}' of '{}' must be an integer, got {other:?}",
            node.name
        ))),
    }
}

/// Op settings carried by the reserved `__*` attributes of `node`.
fn node_settings(graph: &GraphId, node: &NodeDef) -> Result<Settings> {
    let mut settings = Settings::new(graph.clone(), node.name.as_str());
    settings.vgraph_id = int_attr(node, reserved_attrs::VIRTUAL_GRAPH)?;
    settings.pipeline_stage = int_attr(node, reserved_attrs::PIPELINE_STAGE)?;
    settings.execution_phase = int_attr(node, reserved_attrs::EXECUTION_PHASE)?;
    settings.recompute_type = match node.attributes.get(reserved_attrs::RECOMPUTE) {
        None => RecomputeType::Undefined,
        Some(AttributeValue::Int(0)) => RecomputeType::Undefined,
        Some(AttributeValue::Int(1)) => RecomputeType::Checkpoint,
        Some(AttributeValue::Int(2)) => RecomputeType::Recompute,
        Some(AttributeValue::String(name)) => match name.as_str() {
            "Undefined" => RecomputeType::Undefined,
            "Checkpoint" => RecomputeType::Checkpoint,
            "Recompute" => RecomputeType::Recompute,
            other => {
                return Err(Error::user_model(format!(
                    "unknown recompute type '{other}' on '{}'",
                    node.name
                )))
            }
        },
        Some(other) => {
            return Err(Error::user_model(format!(
                "invalid recompute annotation {other:?} on '{}'",
                node.name
            )))
        }
    };
    match node.attributes.get(reserved_attrs::SCHEDULE_PRIORITY) {
        None => {}
        Some(AttributeValue::Float(priority)) => settings.schedule_priority = *priority,
        Some(AttributeValue::Int(priority)) => settings.schedule_priority = *priority as f64,
        Some(other) => {
            return Err(Error::user_model(format!(
                "invalid schedule priority {other:?} on '{}'",
                node.name
            )))
        }
    }
    if let Some(value) = node.attributes.get(reserved_attrs::EXCLUDE_PATTERNS) {
        match value {
            AttributeValue::Strings(names) => settings.exclude_patterns.extend(names.iter().cloned()),
            AttributeValue::String(name) => {
                settings.exclude_patterns.insert(name.clone());
            }
            other => {
                return Err(Error::user_model(format!(
                    "invalid pattern exclusion {other:?} on '{}'",
                    node.name
                )))
            }
        }
    }
    for name in node.attributes.keys() {
        let known = [
            reserved_attrs::VIRTUAL_GRAPH,
            reserved_attrs::PIPELINE_STAGE,
            reserved_attrs::EXECUTION_PHASE,
            reserved_attrs::RECOMPUTE,
            reserved_attrs::SCHEDULE_PRIORITY,
            reserved_attrs::EXCLUDE_PATTERNS,
        ];
        if reserved_attrs::is_reserved(name) && !known.contains(&name.as_str()) {
            warn!(target: "kiln::ir", node = %node.name, attribute = %name, "ignoring unknown reserved attribute");
        }
    }
    Ok(settings)
}
