use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ir::ids::{
    BatchSerializedPhase, ExecutionPhase, GraphId, InIndex, OpId, OutIndex, PipelineStage,
    TensorId, VGraphId,
};
use crate::ir::index_map::TensorIndexMap;
use crate::ir::tensor::{Vertex, VertexState};
use crate::ops::{OpDef, OpFlags};

pub const ONNX_DOMAIN: &str = "ai.onnx";
pub const KILN_DOMAIN: &str = "ai.kiln";

/// `(domain, type, version)` triple naming an operator kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperatorIdentifier {
    pub domain: String,
    pub op_type: String,
    pub version: u32,
}

impl OperatorIdentifier {
    pub fn new(domain: impl Into<String>, op_type: impl Into<String>, version: u32) -> Self {
        Self {
            domain: domain.into(),
            op_type: op_type.into(),
            version,
        }
    }

    pub fn onnx(op_type: &str, version: u32) -> Self {
        Self::new(ONNX_DOMAIN, op_type, version)
    }

    pub fn kiln(op_type: &str) -> Self {
        Self::new(KILN_DOMAIN, op_type, 1)
    }
}

impl fmt::Display for OperatorIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}:{}", self.domain, self.op_type, self.version)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RecomputeType {
    #[default]
    Undefined,
    /// Output is stashed for the backward pass.
    Checkpoint,
    /// Forward op is re-run during the backward pass (implicit marker).
    Recompute,
    /// Op is an explicit clone created for recomputation.
    Recomputed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ExecutionContext {
    #[default]
    Normal,
    AccumulateOuterFragment,
    WeightsFromHostFragment,
    WeightsToHostFragment,
    OptimizerFromHostFragment,
    Subgraph,
}

/// Per-op configuration: placement, scheduling hints and pattern exclusions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
    pub graph: GraphId,
    pub name: String,
    pub scope: String,
    pub recompute_type: RecomputeType,
    pub vgraph_id: Option<VGraphId>,
    pub pipeline_stage: Option<PipelineStage>,
    pub execution_phase: Option<ExecutionPhase>,
    pub batch_serialized_phase: Option<BatchSerializedPhase>,
    pub schedule_priority: f64,
    pub execution_context: ExecutionContext,
    /// Names of patterns that must not touch this op.
    pub exclude_patterns: BTreeSet<String>,
    /// Explicit inplace priorities by variant type; overrides the defaults.
    pub inplace_priority_veto: Vec<(String, f32)>,
}

impl Settings {
    pub fn new(graph: GraphId, name: impl Into<String>) -> Self {
        Self {
            graph,
            name: name.into(),
            scope: String::new(),
            recompute_type: RecomputeType::Undefined,
            vgraph_id: None,
            pipeline_stage: None,
            execution_phase: None,
            batch_serialized_phase: None,
            schedule_priority: 0.0,
            execution_context: ExecutionContext::Normal,
            exclude_patterns: BTreeSet::new(),
            inplace_priority_veto: Vec::new(),
        }
    }

    /// Copy of these settings for an op derived from this one (gradient, clone,
    /// inplace variant) with a fresh name.
    pub fn derived(&self, name: impl Into<String>) -> Self {
        let mut settings = self.clone();
        settings.name = name.into();
        settings.inplace_priority_veto.clear();
        settings
    }
}

/// Attribute values attached to ops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Attribute {
    Int(i64),
    Float(f64),
    Ints(Vec<i64>),
    Floats(Vec<f64>),
    String(String),
    Strings(Vec<String>),
    Graph(GraphId),
}

pub type Attributes = BTreeMap<String, Attribute>;

/// One operator instance in a graph.
#[derive(Clone, Serialize)]
pub struct Op {
    pub id: OpId,
    pub opid: OperatorIdentifier,
    pub settings: Settings,
    pub input: TensorIndexMap,
    pub output: TensorIndexMap,
    pub attrs: Attributes,
    #[serde(skip)]
    vertex: VertexState,
    #[serde(skip)]
    def: Arc<dyn OpDef>,
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Op")
            .field("id", &self.id)
            .field("opid", &self.opid)
            .field("name", &self.settings.name)
            .field("input", &self.input)
            .field("output", &self.output)
            .finish()
    }
}

impl Op {
    pub(crate) fn new(
        id: OpId,
        opid: OperatorIdentifier,
        settings: Settings,
        attrs: Attributes,
        def: Arc<dyn OpDef>,
    ) -> Self {
        Self {
            id,
            opid,
            settings,
            input: TensorIndexMap::new(),
            output: TensorIndexMap::new(),
            attrs,
            vertex: VertexState::default(),
            def,
        }
    }

    pub fn def(&self) -> &dyn OpDef {
        self.def.as_ref()
    }

    pub fn flags(&self) -> OpFlags {
        self.def.flags()
    }

    pub fn op_type(&self) -> &str {
        &self.opid.op_type
    }

    pub fn is(&self, op_type: &str) -> bool {
        self.opid.op_type == op_type
    }

    /// Short human readable name used in diagnostics.
    pub fn debug_name(&self) -> String {
        if self.settings.name.is_empty() {
            format!("{}({})", self.opid.op_type, self.id)
        } else {
            format!("{}({}, '{}')", self.opid.op_type, self.id, self.settings.name)
        }
    }

    pub fn has_input(&self, index: InIndex) -> bool {
        self.input.has_index(index)
    }

    pub fn has_output(&self, index: OutIndex) -> bool {
        self.output.has_index(index)
    }

    pub fn in_id(&self, index: InIndex) -> Result<&TensorId> {
        self.input
            .tensor(index)
            .ok_or_else(|| Error::not_found(format!("{} has no input {index}", self.debug_name())))
    }

    pub fn out_id(&self, index: OutIndex) -> Result<&TensorId> {
        self.output
            .tensor(index)
            .ok_or_else(|| Error::not_found(format!("{} has no output {index}", self.debug_name())))
    }

    pub fn aliases(&self, input: InIndex, output: OutIndex) -> bool {
        self.def.aliases(self, input, output)
    }

    pub fn modifies(&self, input: InIndex) -> bool {
        self.def.modifies(self, input)
    }

    pub fn modifies_any(&self) -> bool {
        self.input.iter().any(|(index, _)| self.modifies(index))
    }

    /// Input indices this op modifies.
    pub fn modified_indices(&self) -> Vec<InIndex> {
        self.input
            .iter()
            .map(|(index, _)| index)
            .filter(|index| self.modifies(*index))
            .collect()
    }

    pub fn is_excluded_from_pattern(&self, pattern: &str) -> bool {
        self.settings.exclude_patterns.contains(pattern)
    }

    pub fn has_side_effect(&self) -> bool {
        self.flags().side_effect
    }

    pub fn attr(&self, name: &str) -> Option<&Attribute> {
        self.attrs.get(name)
    }

    pub fn attr_int(&self, name: &str) -> Option<i64> {
        match self.attrs.get(name) {
            Some(Attribute::Int(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn attr_ints(&self, name: &str) -> Option<&[i64]> {
        match self.attrs.get(name) {
            Some(Attribute::Ints(values)) => Some(values),
            _ => None,
        }
    }

    pub fn attr_float(&self, name: &str) -> Option<f64> {
        match self.attrs.get(name) {
            Some(Attribute::Float(value)) => Some(*value),
            Some(Attribute::Int(value)) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn require_int(&self, name: &str) -> Result<i64> {
        self.attr_int(name).ok_or_else(|| {
            Error::user_model(format!(
                "{} is missing integer attribute '{name}'",
                self.debug_name()
            ))
        })
    }

    /// Graphs this op calls, in attribute-name order.
    pub fn called_graphs(&self) -> Vec<GraphId> {
        self.attrs
            .values()
            .filter_map(|attr| match attr {
                Attribute::Graph(graph) => Some(graph.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn is_ipu_copy(&self) -> bool {
        self.flags().ipu_copy
    }

    /// Placement key used when comparing ops for equivalence.
    pub fn placement(&self) -> (Option<VGraphId>, Option<PipelineStage>, Option<ExecutionPhase>) {
        (
            self.settings.vgraph_id,
            self.settings.pipeline_stage,
            self.settings.execution_phase,
        )
    }
}

impl Vertex for Op {
    fn vertex(&self) -> &VertexState {
        &self.vertex
    }

    fn vertex_mut(&mut self) -> &mut VertexState {
        &mut self.vertex
    }
}
