use crate::error::{Error, Result};
use crate::ir::op::{Attribute, Op, OperatorIdentifier};
use crate::ir::tensor_info::{broadcast_info, broadcast_shapes, TensorInfo};

use super::fold::{self, ConstValue};
use super::{opids, types, GradInput, GradOpSpec, OpDef, OpFlags, OpRegistry, SetupContext};

/// Batched matrix product with numpy broadcasting over the leading dims.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatMul;

pub(crate) fn matmul_shape(op: &Op, lhs: &TensorInfo, rhs: &TensorInfo) -> Result<Vec<i64>> {
    if lhs.rank() < 2 || rhs.rank() < 2 {
        return Err(Error::unsupported(format!(
            "{}: matmul of rank {} by rank {} inputs",
            op.debug_name(),
            lhs.rank(),
            rhs.rank()
        )));
    }
    let (lhs_batch, lhs_mat) = lhs.shape.split_at(lhs.rank() - 2);
    let (rhs_batch, rhs_mat) = rhs.shape.split_at(rhs.rank() - 2);
    if lhs_mat[1] != rhs_mat[0] {
        return Err(Error::user_model(format!(
            "{}: contraction dims differ ({lhs} x {rhs})",
            op.debug_name()
        )));
    }
    let mut shape = broadcast_shapes(lhs_batch, rhs_batch)?;
    shape.push(lhs_mat[0]);
    shape.push(rhs_mat[1]);
    Ok(shape)
}

impl OpDef for MatMul {
    fn setup(&self, op: &Op, cx: &SetupContext) -> Result<Vec<TensorInfo>> {
        let lhs = cx.input(0)?;
        let rhs = cx.input(1)?;
        Ok(vec![lhs.with_shape(matmul_shape(op, lhs, rhs)?)])
    }

    fn flags(&self) -> OpFlags {
        OpFlags {
            heavy: true,
            batch_serializable: true,
            ..OpFlags::default()
        }
    }

    fn grad_ops(&self, _op: &Op, cx: &SetupContext) -> Result<Vec<GradOpSpec>> {
        Ok(vec![
            GradOpSpec::new(OperatorIdentifier::kiln(types::MATMUL_LHS_GRAD))
                .input(0, GradInput::GradOut(0))
                .input(1, GradInput::FwdIn(1))
                .attr("shape", Attribute::Ints(cx.input(0)?.shape.clone()))
                .output(0, 0),
            GradOpSpec::new(OperatorIdentifier::kiln(types::MATMUL_RHS_GRAD))
                .input(0, GradInput::FwdIn(0))
                .input(1, GradInput::GradOut(0))
                .attr("shape", Attribute::Ints(cx.input(1)?.shape.clone()))
                .output(0, 1),
        ])
    }
}

/// Variadic broadcasting sum.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sum;

impl OpDef for Sum {
    fn setup(&self, op: &Op, cx: &SetupContext) -> Result<Vec<TensorInfo>> {
        let mut inputs = cx.inputs.values();
        let Some(first) = inputs.next() else {
            return Err(Error::user_model(format!(
                "{} has no inputs",
                op.debug_name()
            )));
        };
        let mut out = first.clone();
        for input in inputs {
            out = broadcast_info(&out, input)?;
        }
        Ok(vec![out])
    }

    fn flags(&self) -> OpFlags {
        OpFlags {
            batch_serializable: true,
            ..OpFlags::default()
        }
    }

    fn grad_ops(&self, _op: &Op, cx: &SetupContext) -> Result<Vec<GradOpSpec>> {
        Ok(cx
            .inputs
            .iter()
            .map(|(index, info)| {
                GradOpSpec::new(opids::reduce_sum_to_shape())
                    .input(0, GradInput::GradOut(0))
                    .attr("shape", Attribute::Ints(info.shape.clone()))
                    .output(0, *index)
            })
            .collect())
    }

    fn const_fold(&self, _op: &Op, inputs: &[ConstValue<'_>]) -> Result<Option<Vec<f64>>> {
        let Some(first) = inputs.first() else {
            return Ok(None);
        };
        let mut info = first.info.clone();
        let mut acc = first.data.to_vec();
        for input in &inputs[1..] {
            let lhs = ConstValue {
                info: &info,
                data: &acc,
            };
            let next = fold::binary(&lhs, input, |a, b| a + b)?;
            info = info.with_shape(broadcast_shapes(&info.shape, &input.info.shape)?);
            acc = next;
        }
        Ok(Some(acc))
    }
}

/// `lambda * |x|`, reduced by sum, mean or not at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct L1Loss;

impl L1Loss {
    fn reduction(op: &Op) -> &str {
        match op.attr("reduction") {
            Some(Attribute::String(reduction)) => reduction.as_str(),
            _ => "Sum",
        }
    }
}

impl OpDef for L1Loss {
    fn setup(&self, op: &Op, cx: &SetupContext) -> Result<Vec<TensorInfo>> {
        let input = cx.input(0)?;
        match Self::reduction(op) {
            "Sum" | "Mean" => Ok(vec![TensorInfo::scalar(input.dtype)]),
            "None" => Ok(vec![input.clone()]),
            other => Err(Error::unsupported(format!(
                "{}: reduction '{other}'",
                op.debug_name()
            ))),
        }
    }

    fn flags(&self) -> OpFlags {
        OpFlags {
            loss: true,
            ..OpFlags::default()
        }
    }

    fn grad_ops(&self, op: &Op, _cx: &SetupContext) -> Result<Vec<GradOpSpec>> {
        let lambda = op.attr_float("lambda").unwrap_or(1.0);
        Ok(vec![GradOpSpec::new(OperatorIdentifier::kiln(types::L1_GRAD))
            .input(0, GradInput::FwdIn(0))
            .input(1, GradInput::GradOut(0))
            .attr("lambda", Attribute::Float(lambda))
            .attr(
                "reduction",
                Attribute::String(Self::reduction(op).to_string()),
            )
            .output(0, 0)])
    }
}

pub(super) fn register(registry: &mut OpRegistry) {
    registry.register(opids::matmul(), MatMul);
    registry.register(opids::sum(), Sum);
    registry.register(opids::l1_loss(), L1Loss);
}
