//! The `Ir` orchestrator and the configuration it is prepared against.

mod dataflow;
mod device;
mod dump;
mod ir;
mod optimizer;
mod options;
mod verify;

pub use dataflow::{AnchorReturnType, DataFlow, InputShapeInfo};
pub use device::DeviceInfo;
pub use ir::{Ir, IrBundle, PreparePhase};
pub use optimizer::Optimizer;
pub use options::{
    AccumulationSettings, BatchSerializationContext, BatchSerializationSettings,
    ExecutionPhaseSettings, RecomputationType, ReplicatedGraphSettings, SessionOptions,
    VirtualGraphMode,
};
