//! Operator capability table.
//!
//! Every operator kind implements [`OpDef`]; the IR core never matches on
//! concrete kinds and instead asks the capability table (aliasing, modified
//! inputs, inplace variants, gradients, constant folding). New kinds are added
//! by registering a definition in an [`OpRegistry`] under their
//! `(domain, type, version)` identifier.

mod elementwise;
mod fold;
mod grad;
mod misc;
mod shape;
mod subgraph;
mod training;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::error::{Error, Result};
use crate::ir::ids::{InIndex, OutIndex};
use crate::ir::op::{Attributes, Op, OperatorIdentifier};
use crate::ir::tensor_info::TensorInfo;

pub use elementwise::{BinaryElementwise, BinaryKind, InplaceSide, UnaryElementwise, UnaryKind};
pub use fold::ConstValue;
pub use grad::{GradKind, GradOp};
pub use misc::{L1Loss, MatMul, Sum};
pub use shape::{Concat, Reshape, Slice, Transpose};
pub use subgraph::{SubgraphCall, SubgraphKind};
pub use training::{Init, IpuCopy, RestoreInplace, SgdVarUpdate, Stash};

/// Operator type names known to the built-in registry.
pub mod types {
    pub const RELU: &str = "Relu";
    pub const RELU_INPLACE: &str = "ReluInplace";
    pub const NEG: &str = "Neg";
    pub const NEG_INPLACE: &str = "NegInplace";
    pub const EXP: &str = "Exp";
    pub const EXP_INPLACE: &str = "ExpInplace";
    pub const SIGMOID: &str = "Sigmoid";
    pub const SIGMOID_INPLACE: &str = "SigmoidInplace";
    pub const SCALE: &str = "Scale";
    pub const SCALE_INPLACE: &str = "ScaleInplace";
    pub const IDENTITY: &str = "Identity";
    pub const IDENTITY_INPLACE: &str = "IdentityInplace";
    pub const CAST: &str = "Cast";

    pub const ADD: &str = "Add";
    pub const ADD_LHS_INPLACE: &str = "AddLhsInplace";
    pub const ADD_RHS_INPLACE: &str = "AddRhsInplace";
    pub const SUB: &str = "Sub";
    pub const MUL: &str = "Mul";
    pub const MUL_LHS_INPLACE: &str = "MulLhsInplace";
    pub const MUL_RHS_INPLACE: &str = "MulRhsInplace";

    pub const CONCAT: &str = "Concat";
    pub const CONCAT_INPLACE: &str = "ConcatInplace";
    pub const RESHAPE: &str = "Reshape";
    pub const RESHAPE_INPLACE: &str = "ReshapeInplace";
    pub const TRANSPOSE: &str = "Transpose";
    pub const TRANSPOSE_INPLACE: &str = "TransposeInplace";
    pub const SLICE: &str = "Slice";
    pub const SLICE_INPLACE: &str = "SliceInplace";

    pub const MATMUL: &str = "MatMul";
    pub const SUM: &str = "Sum";
    pub const L1_LOSS: &str = "L1";

    pub const RELU_GRAD: &str = "ReluGrad";
    pub const EXP_GRAD: &str = "ExpGrad";
    pub const SIGMOID_GRAD: &str = "SigmoidGrad";
    pub const REDUCE_SUM_TO_SHAPE: &str = "ReduceSumToShape";
    pub const MUL_ARG_GRAD: &str = "MulArgGrad";
    pub const MATMUL_LHS_GRAD: &str = "MatMulLhsGrad";
    pub const MATMUL_RHS_GRAD: &str = "MatMulRhsGrad";
    pub const L1_GRAD: &str = "L1Grad";
    pub const SLICE_GRAD: &str = "SliceGrad";

    pub const SGD_VAR_UPDATE: &str = "SGDVarUpdate";
    pub const INIT: &str = "Init";
    pub const IPU_COPY: &str = "IpuCopy";
    pub const STASH: &str = "Stash";
    pub const RESTORE_INPLACE: &str = "RestoreInplace";

    pub const CALL: &str = "Call";
    pub const IF: &str = "If";
    pub const LOOP: &str = "Loop";
}

/// Boolean traits of an operator kind, consulted by transforms and checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpFlags {
    /// Must never be pruned even without live consumers.
    pub side_effect: bool,
    /// Updates a variable in place (optimizer step).
    pub var_update: bool,
    /// Initialises a variable.
    pub init: bool,
    /// Copies tensors between compute partitions.
    pub ipu_copy: bool,
    /// Produces the scalar loss.
    pub loss: bool,
    /// Restores a stashed activation in place.
    pub restore_inplace: bool,
    /// May be split along the batch axis.
    pub batch_serializable: bool,
    /// Numpy-broadcasting binary op.
    pub elementwise_binary: bool,
    /// Calls one or more subgraphs.
    pub subgraph: bool,
    /// Inplace variant of some outplace kind.
    pub inplace: bool,
    /// Compute heavy op (matmul-like) whose output is a good inplace target.
    pub heavy: bool,
    /// Normalisation op, checkpointed under `NormOnly` recomputation.
    pub norm: bool,
    /// Gradient op created by autodiff.
    pub gradient: bool,
}

/// Input and (current) output infos of an op being set up.
#[derive(Debug, Clone, Default)]
pub struct SetupContext {
    pub inputs: BTreeMap<InIndex, TensorInfo>,
    pub outputs: BTreeMap<OutIndex, TensorInfo>,
}

impl SetupContext {
    pub fn input(&self, index: InIndex) -> Result<&TensorInfo> {
        self.inputs
            .get(&index)
            .ok_or_else(|| Error::internal(format!("setup: no input at index {index}")))
    }

    pub fn output(&self, index: OutIndex) -> Option<&TensorInfo> {
        self.outputs.get(&index)
    }

    /// Inputs in index order.
    pub fn input_list(&self) -> Vec<&TensorInfo> {
        self.inputs.values().collect()
    }
}

/// Where a gradient op reads each of its inputs from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GradInput {
    /// Input of the forward op.
    FwdIn(InIndex),
    /// Output of the forward op.
    FwdOut(OutIndex),
    /// Gradient of an output of the forward op.
    GradOut(OutIndex),
}

/// Description of one gradient op to create for a forward op.
#[derive(Debug, Clone, PartialEq)]
pub struct GradOpSpec {
    pub opid: OperatorIdentifier,
    pub inputs: Vec<(InIndex, GradInput)>,
    /// Gradient op output index to the forward input it is the gradient of.
    pub outputs: Vec<(OutIndex, InIndex)>,
    pub attrs: Attributes,
}

impl GradOpSpec {
    pub fn new(opid: OperatorIdentifier) -> Self {
        Self {
            opid,
            inputs: Vec::new(),
            outputs: Vec::new(),
            attrs: Attributes::new(),
        }
    }

    pub fn input(mut self, index: InIndex, source: GradInput) -> Self {
        self.inputs.push((index, source));
        self
    }

    pub fn output(mut self, index: OutIndex, grad_of: InIndex) -> Self {
        self.outputs.push((index, grad_of));
        self
    }

    pub fn attr(mut self, name: &str, value: crate::ir::op::Attribute) -> Self {
        self.attrs.insert(name.to_string(), value);
        self
    }
}

/// Capabilities of one operator kind.
pub trait OpDef: Send + Sync {
    /// Computes output infos in output-index order.
    fn setup(&self, op: &Op, cx: &SetupContext) -> Result<Vec<TensorInfo>>;

    fn flags(&self) -> OpFlags {
        OpFlags::default()
    }

    /// Whether output `output` shares storage with input `input`.
    fn aliases(&self, op: &Op, input: InIndex, output: OutIndex) -> bool {
        let _ = (op, input, output);
        false
    }

    /// Whether the op writes into input `input`.
    fn modifies(&self, op: &Op, input: InIndex) -> bool {
        let _ = (op, input);
        false
    }

    /// Default inplace variants with their priorities.
    fn inplace_variants(&self, op: &Op) -> Vec<(OperatorIdentifier, f32)> {
        let _ = op;
        Vec::new()
    }

    /// Outplace kind this inplace kind was derived from.
    fn outplace(&self) -> Option<OperatorIdentifier> {
        None
    }

    fn grad_ops(&self, op: &Op, cx: &SetupContext) -> Result<Vec<GradOpSpec>> {
        let _ = cx;
        Err(Error::unsupported(format!(
            "{} has no gradient definition",
            op.debug_name()
        )))
    }

    /// Evaluates the op on constant inputs; `None` when folding is not supported.
    fn const_fold(&self, op: &Op, inputs: &[ConstValue<'_>]) -> Result<Option<Vec<f64>>> {
        let _ = (op, inputs);
        Ok(None)
    }

    /// Input/output index groups that may carry replicated-tensor-sharded tensors.
    fn rts_indices(&self, op: &Op) -> Vec<(Vec<InIndex>, Vec<OutIndex>)> {
        let _ = op;
        Vec::new()
    }

    /// Key under which outlining treats two ops as the same computation.
    ///
    /// Ops with equal keys reading equally typed inputs compute the same
    /// function. `None` keeps the op out of every outlined subgraph.
    fn subgraph_equiv_id(&self, op: &Op) -> Option<String> {
        Some(format!(
            "{}{:?}{:?}{:?}",
            op.opid,
            op.attrs,
            op.placement(),
            op.settings.recompute_type
        ))
    }
}

/// Operator definitions keyed by `(domain, type)` and version.
#[derive(Default, Clone)]
pub struct OpRegistry {
    defs: BTreeMap<(String, String), BTreeMap<u32, Arc<dyn OpDef>>>,
}

impl fmt::Debug for OpRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpRegistry")
            .field("kinds", &self.defs.len())
            .finish()
    }
}

impl OpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<D>(&mut self, opid: OperatorIdentifier, def: D) -> &mut Self
    where
        D: OpDef + 'static,
    {
        self.register_arc(opid, Arc::new(def))
    }

    pub fn register_arc(&mut self, opid: OperatorIdentifier, def: Arc<dyn OpDef>) -> &mut Self {
        self.defs
            .entry((opid.domain, opid.op_type))
            .or_default()
            .insert(opid.version, def);
        self
    }

    /// Greatest registered version not above `opid.version`.
    pub fn lookup(&self, opid: &OperatorIdentifier) -> Option<(u32, Arc<dyn OpDef>)> {
        let versions = self
            .defs
            .get(&(opid.domain.clone(), opid.op_type.clone()))?;
        versions
            .range(..=opid.version)
            .next_back()
            .map(|(version, def)| (*version, Arc::clone(def)))
    }

    /// Resolves `opid` to the registered identifier and definition.
    pub fn resolve(&self, opid: &OperatorIdentifier) -> Result<(OperatorIdentifier, Arc<dyn OpDef>)> {
        let (version, def) = self.lookup(opid).ok_or_else(|| {
            Error::unsupported(format!("no operator registered for {opid}"))
        })?;
        Ok((
            OperatorIdentifier::new(opid.domain.clone(), opid.op_type.clone(), version),
            def,
        ))
    }

    pub fn contains(&self, domain: &str, op_type: &str) -> bool {
        self.defs
            .contains_key(&(domain.to_string(), op_type.to_string()))
    }

    /// Registry with every built-in kind.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        elementwise::register(&mut registry);
        shape::register(&mut registry);
        misc::register(&mut registry);
        grad::register(&mut registry);
        training::register(&mut registry);
        subgraph::register(&mut registry);
        registry
    }
}

static DEFAULT_REGISTRY: OnceLock<Arc<OpRegistry>> = OnceLock::new();

/// Shared registry of built-in operator kinds.
pub fn default_registry() -> Arc<OpRegistry> {
    Arc::clone(DEFAULT_REGISTRY.get_or_init(|| Arc::new(OpRegistry::with_builtins())))
}

/// Identifiers of the built-in kinds, at the version they are registered under.
pub mod opids {
    use super::types;
    use crate::ir::op::OperatorIdentifier;

    pub fn relu() -> OperatorIdentifier {
        OperatorIdentifier::onnx(types::RELU, 6)
    }
    pub fn relu_inplace() -> OperatorIdentifier {
        OperatorIdentifier::kiln(types::RELU_INPLACE)
    }
    pub fn neg() -> OperatorIdentifier {
        OperatorIdentifier::onnx(types::NEG, 6)
    }
    pub fn neg_inplace() -> OperatorIdentifier {
        OperatorIdentifier::kiln(types::NEG_INPLACE)
    }
    pub fn exp() -> OperatorIdentifier {
        OperatorIdentifier::onnx(types::EXP, 6)
    }
    pub fn exp_inplace() -> OperatorIdentifier {
        OperatorIdentifier::kiln(types::EXP_INPLACE)
    }
    pub fn sigmoid() -> OperatorIdentifier {
        OperatorIdentifier::onnx(types::SIGMOID, 6)
    }
    pub fn sigmoid_inplace() -> OperatorIdentifier {
        OperatorIdentifier::kiln(types::SIGMOID_INPLACE)
    }
    pub fn scale() -> OperatorIdentifier {
        OperatorIdentifier::kiln(types::SCALE)
    }
    pub fn scale_inplace() -> OperatorIdentifier {
        OperatorIdentifier::kiln(types::SCALE_INPLACE)
    }
    pub fn identity() -> OperatorIdentifier {
        OperatorIdentifier::onnx(types::IDENTITY, 1)
    }
    pub fn identity_inplace() -> OperatorIdentifier {
        OperatorIdentifier::kiln(types::IDENTITY_INPLACE)
    }
    pub fn cast() -> OperatorIdentifier {
        OperatorIdentifier::onnx(types::CAST, 9)
    }
    pub fn add() -> OperatorIdentifier {
        OperatorIdentifier::onnx(types::ADD, 7)
    }
    pub fn add_lhs_inplace() -> OperatorIdentifier {
        OperatorIdentifier::kiln(types::ADD_LHS_INPLACE)
    }
    pub fn add_rhs_inplace() -> OperatorIdentifier {
        OperatorIdentifier::kiln(types::ADD_RHS_INPLACE)
    }
    pub fn sub() -> OperatorIdentifier {
        OperatorIdentifier::onnx(types::SUB, 7)
    }
    pub fn mul() -> OperatorIdentifier {
        OperatorIdentifier::onnx(types::MUL, 7)
    }
    pub fn mul_lhs_inplace() -> OperatorIdentifier {
        OperatorIdentifier::kiln(types::MUL_LHS_INPLACE)
    }
    pub fn mul_rhs_inplace() -> OperatorIdentifier {
        OperatorIdentifier::kiln(types::MUL_RHS_INPLACE)
    }
    pub fn concat() -> OperatorIdentifier {
        OperatorIdentifier::onnx(types::CONCAT, 4)
    }
    pub fn concat_inplace() -> OperatorIdentifier {
        OperatorIdentifier::kiln(types::CONCAT_INPLACE)
    }
    pub fn reshape() -> OperatorIdentifier {
        OperatorIdentifier::onnx(types::RESHAPE, 5)
    }
    pub fn reshape_inplace() -> OperatorIdentifier {
        OperatorIdentifier::kiln(types::RESHAPE_INPLACE)
    }
    pub fn transpose() -> OperatorIdentifier {
        OperatorIdentifier::onnx(types::TRANSPOSE, 1)
    }
    pub fn transpose_inplace() -> OperatorIdentifier {
        OperatorIdentifier::kiln(types::TRANSPOSE_INPLACE)
    }
    pub fn slice() -> OperatorIdentifier {
        OperatorIdentifier::onnx(types::SLICE, 1)
    }
    pub fn slice_inplace() -> OperatorIdentifier {
        OperatorIdentifier::kiln(types::SLICE_INPLACE)
    }
    pub fn matmul() -> OperatorIdentifier {
        OperatorIdentifier::onnx(types::MATMUL, 9)
    }
    pub fn sum() -> OperatorIdentifier {
        OperatorIdentifier::onnx(types::SUM, 8)
    }
    pub fn l1_loss() -> OperatorIdentifier {
        OperatorIdentifier::kiln(types::L1_LOSS)
    }
    pub fn reduce_sum_to_shape() -> OperatorIdentifier {
        OperatorIdentifier::kiln(types::REDUCE_SUM_TO_SHAPE)
    }
    pub fn sgd_var_update() -> OperatorIdentifier {
        OperatorIdentifier::kiln(types::SGD_VAR_UPDATE)
    }
    pub fn init() -> OperatorIdentifier {
        OperatorIdentifier::kiln(types::INIT)
    }
    pub fn ipu_copy() -> OperatorIdentifier {
        OperatorIdentifier::kiln(types::IPU_COPY)
    }
    pub fn stash() -> OperatorIdentifier {
        OperatorIdentifier::kiln(types::STASH)
    }
    pub fn restore_inplace() -> OperatorIdentifier {
        OperatorIdentifier::kiln(types::RESTORE_INPLACE)
    }
    pub fn call() -> OperatorIdentifier {
        OperatorIdentifier::kiln(types::CALL)
    }
    pub fn if_op() -> OperatorIdentifier {
        OperatorIdentifier::onnx(types::IF, 1)
    }
    pub fn loop_op() -> OperatorIdentifier {
        OperatorIdentifier::onnx(types::LOOP, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_picks_greatest_version_not_above_request() {
        let registry = default_registry();
        let (version, _) = registry
            .lookup(&OperatorIdentifier::onnx(types::ADD, 11))
            .unwrap();
        assert_eq!(version, 7);
        assert!(registry
            .lookup(&OperatorIdentifier::onnx(types::ADD, 6))
            .is_none());
    }

    #[test]
    fn unknown_kind_is_unsupported() {
        let registry = default_registry();
        let err = registry
            .resolve(&OperatorIdentifier::onnx("Conv", 11))
            .err()
            .unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::Unsupported);
    }
}
