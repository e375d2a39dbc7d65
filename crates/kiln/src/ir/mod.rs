//! In-memory graph IR.
//!
//! Ops and tensors live in per-graph arenas keyed by [`OpId`] and
//! [`TensorId`]; every cross reference (producer, consumers, called graph) is a
//! lookup through the owning [`Graph`], so erasing an op never leaves a
//! dangling reference behind.

pub mod graph;
pub mod ids;
pub mod index_map;
pub mod op;
pub mod scheduler;
pub mod tensor;
pub mod tensor_info;
pub mod tensors;
pub mod topocons;

pub use graph::{Graph, RetainFlags};
pub use ids::{
    reserved, BatchSerializedPhase, ExecutionPhase, GraphId, InIndex, OpId, OutIndex,
    PipelineStage, TensorId, VGraphId,
};
pub use index_map::TensorIndexMap;
pub use op::{
    Attribute, Attributes, ExecutionContext, Op, OperatorIdentifier, RecomputeType, Settings,
    KILN_DOMAIN, ONNX_DOMAIN,
};
pub use scheduler::{OpsBeforeKey, RequireOptimal, ScheduleNode, ScheduleProblem};
pub use tensor::{Consumers, LossPath, Tensor, TensorType, Vertex, VertexState};
pub use tensor_info::{broadcast_info, broadcast_shapes, DataType, TensorInfo};
pub use tensors::Tensors;
pub use topocons::TopoCons;
