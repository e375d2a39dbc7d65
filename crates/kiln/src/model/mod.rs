//! Model description consumed by `prepare`, plus helpers to build and edit it.

mod builder;
mod format;
mod import;
mod transformer;

pub use builder::ModelBuilder;
pub use format::{
    canonical_domain, AttributeValue, GraphDef, Initializer, Model, NodeDef, ValueInfo,
};
pub use import::{import_model, reserved_attrs};
pub use transformer::GraphTransformer;
