//! Graph IR, rewrite pipeline and scheduler for dataflow training graphs.
//!
//! An imported model becomes a [`session::Ir`] holding one or more
//! [`ir::Graph`]s. [`session::Ir::prepare`] then runs the ordered pipeline of
//! patterns and transforms (constant folding, autodiff, placement, batch
//! serialization, recomputation, duplicate merging, inplacing) and verifies
//! the result, leaving every graph with a deterministic op schedule.

pub mod alias;
pub mod error;
pub mod hashing;
pub mod ir;
pub mod model;
pub mod ops;
pub mod pattern;
pub mod session;
pub mod transform;

mod env;

pub use error::{Error, ErrorKind, Result};
pub use ir::{Graph, GraphId, Op, OpId, Tensor, TensorId, TensorInfo, TensorType};
pub use session::{Ir, SessionOptions};
