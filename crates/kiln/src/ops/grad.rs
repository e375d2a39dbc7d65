use crate::error::{Error, Result};
use crate::ir::ids::{InIndex, OutIndex};
use crate::ir::op::{Op, OperatorIdentifier};
use crate::ir::tensor_info::TensorInfo;

use super::{opids, types, OpDef, OpFlags, OpRegistry, SetupContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradKind {
    /// `grad * (fwd_out > 0)`
    Relu,
    /// `grad * fwd_out`
    Exp,
    /// `grad * fwd_out * (1 - fwd_out)`
    Sigmoid,
    /// Sums the broadcast axes of `grad` away to reach `shape`.
    ReduceSumToShape,
    /// `reduce_to_shape(grad * other_arg)`
    MulArg,
    MatMulLhs,
    MatMulRhs,
    /// `lambda * sign(fwd_in) * grad`
    L1,
    /// Zero-pads the gradient of a slice back to the input `shape`.
    Slice,
}

/// Ops created by autodiff only.
#[derive(Debug, Clone, Copy)]
pub struct GradOp {
    pub kind: GradKind,
}

fn shape_attr(op: &Op) -> Result<Vec<i64>> {
    op.attr_ints("shape").map(<[i64]>::to_vec).ok_or_else(|| {
        Error::internal(format!("{} is missing attribute 'shape'", op.debug_name()))
    })
}

impl OpDef for GradOp {
    fn setup(&self, op: &Op, cx: &SetupContext) -> Result<Vec<TensorInfo>> {
        let grad = cx.input(0)?;
        let out = match self.kind {
            GradKind::Relu | GradKind::Exp | GradKind::Sigmoid => grad.clone(),
            // Input 0 is the forward input here.
            GradKind::L1 => grad.clone(),
            GradKind::ReduceSumToShape
            | GradKind::MulArg
            | GradKind::MatMulLhs
            | GradKind::Slice => grad.with_shape(shape_attr(op)?),
            GradKind::MatMulRhs => cx.input(1)?.with_shape(shape_attr(op)?),
        };
        Ok(vec![out])
    }

    fn flags(&self) -> OpFlags {
        OpFlags {
            gradient: true,
            batch_serializable: matches!(
                self.kind,
                GradKind::Relu | GradKind::Exp | GradKind::Sigmoid
            ),
            ..OpFlags::default()
        }
    }

    fn rts_indices(&self, _op: &Op) -> Vec<(Vec<InIndex>, Vec<OutIndex>)> {
        match self.kind {
            GradKind::Relu | GradKind::Exp | GradKind::Sigmoid => vec![(vec![0, 1], vec![0])],
            _ => Vec::new(),
        }
    }
}

pub(super) fn register(registry: &mut OpRegistry) {
    for (name, kind) in [
        (types::RELU_GRAD, GradKind::Relu),
        (types::EXP_GRAD, GradKind::Exp),
        (types::SIGMOID_GRAD, GradKind::Sigmoid),
        (types::MUL_ARG_GRAD, GradKind::MulArg),
        (types::MATMUL_LHS_GRAD, GradKind::MatMulLhs),
        (types::MATMUL_RHS_GRAD, GradKind::MatMulRhs),
        (types::L1_GRAD, GradKind::L1),
        (types::SLICE_GRAD, GradKind::Slice),
    ] {
        registry.register(OperatorIdentifier::kiln(name), GradOp { kind });
    }
    registry.register(
        opids::reduce_sum_to_shape(),
        GradOp {
            kind: GradKind::ReduceSumToShape,
        },
    );
}
