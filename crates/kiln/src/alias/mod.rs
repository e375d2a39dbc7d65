//! Alias analysis and the inplacing engine.

pub mod inplace;
pub mod model;

pub use inplace::{apply_inplace, InplaceConfig, InplaceStats};
pub use model::{AliasModel, Proposal, Rejection, Transaction};
