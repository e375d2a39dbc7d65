use crate::error::{Error, Result};
use crate::ir::ids::{InIndex, OutIndex};
use crate::ir::op::{Attribute, Op, OperatorIdentifier};
use crate::ir::tensor_info::TensorInfo;

use super::fold::{self, ConstValue};
use super::{opids, types, GradInput, GradOpSpec, OpDef, OpFlags, OpRegistry, SetupContext};

const VIEW_INPLACE_PRIORITY: f32 = 10.0;

fn normalize_axis(op: &Op, axis: i64, rank: usize) -> Result<usize> {
    let rank = rank as i64;
    let normalized = if axis < 0 { axis + rank } else { axis };
    if normalized < 0 || normalized >= rank {
        return Err(Error::user_model(format!(
            "{}: axis {axis} out of range for rank {rank}",
            op.debug_name()
        )));
    }
    Ok(normalized as usize)
}

/// Joins its inputs along `axis`. The inplace variant is a view of its inputs.
#[derive(Debug, Clone, Copy)]
pub struct Concat {
    pub inplace: bool,
}

impl Concat {
    fn axis(op: &Op, rank: usize) -> Result<usize> {
        normalize_axis(op, op.require_int("axis")?, rank)
    }
}

impl OpDef for Concat {
    fn setup(&self, op: &Op, cx: &SetupContext) -> Result<Vec<TensorInfo>> {
        let inputs = cx.input_list();
        let Some(first) = inputs.first() else {
            return Err(Error::user_model(format!(
                "{} has no inputs",
                op.debug_name()
            )));
        };
        let axis = Self::axis(op, first.rank())?;
        let mut shape = first.shape.clone();
        shape[axis] = 0;
        for input in &inputs {
            if input.rank() != first.rank() || input.dtype != first.dtype {
                return Err(Error::user_model(format!(
                    "{}: inputs {first} and {input} cannot be concatenated",
                    op.debug_name()
                )));
            }
            for (dim, (a, b)) in first.shape.iter().zip(&input.shape).enumerate() {
                if dim != axis && a != b {
                    return Err(Error::user_model(format!(
                        "{}: inputs {first} and {input} differ outside axis {axis}",
                        op.debug_name()
                    )));
                }
            }
            shape[axis] += input.shape[axis];
        }
        Ok(vec![first.with_shape(shape)])
    }

    fn flags(&self) -> OpFlags {
        OpFlags {
            inplace: self.inplace,
            ..OpFlags::default()
        }
    }

    fn aliases(&self, _op: &Op, _input: InIndex, output: OutIndex) -> bool {
        self.inplace && output == 0
    }

    fn inplace_variants(&self, _op: &Op) -> Vec<(OperatorIdentifier, f32)> {
        if self.inplace {
            Vec::new()
        } else {
            vec![(opids::concat_inplace(), VIEW_INPLACE_PRIORITY)]
        }
    }

    fn outplace(&self) -> Option<OperatorIdentifier> {
        self.inplace.then(opids::concat)
    }

    fn grad_ops(&self, op: &Op, cx: &SetupContext) -> Result<Vec<GradOpSpec>> {
        let Some(first) = cx.inputs.values().next() else {
            return Ok(Vec::new());
        };
        let axis = Self::axis(op, first.rank())?;
        let mut offset = 0;
        let mut specs = Vec::with_capacity(cx.inputs.len());
        for (index, info) in &cx.inputs {
            let width = info.shape[axis];
            specs.push(
                GradOpSpec::new(opids::slice())
                    .input(0, GradInput::GradOut(0))
                    .attr("starts", Attribute::Ints(vec![offset]))
                    .attr("ends", Attribute::Ints(vec![offset + width]))
                    .attr("axes", Attribute::Ints(vec![axis as i64]))
                    .output(0, *index),
            );
            offset += width;
        }
        Ok(specs)
    }

    fn const_fold(&self, op: &Op, inputs: &[ConstValue<'_>]) -> Result<Option<Vec<f64>>> {
        let Some(first) = inputs.first() else {
            return Ok(None);
        };
        let axis = Self::axis(op, first.info.rank())?;
        Ok(Some(fold::concat(inputs, axis)?))
    }
}

/// Reshape to the `shape` attribute (`0` copies a dim, `-1` is inferred).
#[derive(Debug, Clone, Copy)]
pub struct Reshape {
    pub inplace: bool,
}

pub(crate) fn resolve_reshape(op: &Op, input: &TensorInfo) -> Result<Vec<i64>> {
    let Some(target) = op.attr_ints("shape") else {
        return Err(Error::user_model(format!(
            "{} is missing attribute 'shape'",
            op.debug_name()
        )));
    };
    let mut shape: Vec<i64> = target
        .iter()
        .enumerate()
        .map(|(axis, dim)| {
            if *dim == 0 {
                input.dim(axis).unwrap_or(0)
            } else {
                *dim
            }
        })
        .collect();
    let inferred: Vec<usize> = shape
        .iter()
        .enumerate()
        .filter(|(_, dim)| **dim == -1)
        .map(|(axis, _)| axis)
        .collect();
    match inferred.as_slice() {
        [] => {}
        [axis] => {
            let known: i64 = shape.iter().filter(|dim| **dim != -1).product();
            if known == 0 || input.nelms() % known != 0 {
                return Err(Error::user_model(format!(
                    "{}: cannot infer -1 in {target:?} from {input}",
                    op.debug_name()
                )));
            }
            shape[*axis] = input.nelms() / known;
        }
        _ => {
            return Err(Error::user_model(format!(
                "{}: at most one -1 allowed in {target:?}",
                op.debug_name()
            )))
        }
    }
    if shape.iter().product::<i64>() != input.nelms() {
        return Err(Error::user_model(format!(
            "{}: cannot reshape {input} to {shape:?}",
            op.debug_name()
        )));
    }
    Ok(shape)
}

impl OpDef for Reshape {
    fn setup(&self, op: &Op, cx: &SetupContext) -> Result<Vec<TensorInfo>> {
        let input = cx.input(0)?;
        Ok(vec![input.with_shape(resolve_reshape(op, input)?)])
    }

    fn flags(&self) -> OpFlags {
        OpFlags {
            inplace: self.inplace,
            ..OpFlags::default()
        }
    }

    fn aliases(&self, _op: &Op, input: InIndex, output: OutIndex) -> bool {
        self.inplace && input == 0 && output == 0
    }

    fn inplace_variants(&self, _op: &Op) -> Vec<(OperatorIdentifier, f32)> {
        if self.inplace {
            Vec::new()
        } else {
            vec![(opids::reshape_inplace(), VIEW_INPLACE_PRIORITY)]
        }
    }

    fn outplace(&self) -> Option<OperatorIdentifier> {
        self.inplace.then(opids::reshape)
    }

    fn grad_ops(&self, _op: &Op, cx: &SetupContext) -> Result<Vec<GradOpSpec>> {
        Ok(vec![GradOpSpec::new(opids::reshape())
            .input(0, GradInput::GradOut(0))
            .attr("shape", Attribute::Ints(cx.input(0)?.shape.clone()))
            .output(0, 0)])
    }

    fn const_fold(&self, _op: &Op, inputs: &[ConstValue<'_>]) -> Result<Option<Vec<f64>>> {
        Ok(inputs.first().map(|input| input.data.to_vec()))
    }
}

/// Axis permutation; the default permutation reverses the axes.
#[derive(Debug, Clone, Copy)]
pub struct Transpose {
    pub inplace: bool,
}

impl Transpose {
    fn perm(op: &Op, rank: usize) -> Result<Vec<usize>> {
        let perm: Vec<usize> = match op.attr_ints("perm") {
            Some(perm) => perm.iter().map(|axis| *axis as usize).collect(),
            None => (0..rank).rev().collect(),
        };
        let mut seen = vec![false; rank];
        for axis in &perm {
            match seen.get_mut(*axis) {
                Some(slot) if !*slot => *slot = true,
                _ => {
                    return Err(Error::user_model(format!(
                        "{}: invalid permutation {perm:?} for rank {rank}",
                        op.debug_name()
                    )))
                }
            }
        }
        if perm.len() != rank {
            return Err(Error::user_model(format!(
                "{}: permutation {perm:?} does not match rank {rank}",
                op.debug_name()
            )));
        }
        Ok(perm)
    }
}

impl OpDef for Transpose {
    fn setup(&self, op: &Op, cx: &SetupContext) -> Result<Vec<TensorInfo>> {
        let input = cx.input(0)?;
        let perm = Self::perm(op, input.rank())?;
        let shape: Vec<i64> = perm.iter().map(|axis| input.shape[*axis]).collect();
        Ok(vec![input.with_shape(shape)])
    }

    fn flags(&self) -> OpFlags {
        OpFlags {
            inplace: self.inplace,
            ..OpFlags::default()
        }
    }

    fn aliases(&self, _op: &Op, input: InIndex, output: OutIndex) -> bool {
        self.inplace && input == 0 && output == 0
    }

    fn inplace_variants(&self, _op: &Op) -> Vec<(OperatorIdentifier, f32)> {
        if self.inplace {
            Vec::new()
        } else {
            vec![(opids::transpose_inplace(), VIEW_INPLACE_PRIORITY)]
        }
    }

    fn outplace(&self) -> Option<OperatorIdentifier> {
        self.inplace.then(opids::transpose)
    }

    fn grad_ops(&self, op: &Op, cx: &SetupContext) -> Result<Vec<GradOpSpec>> {
        let perm = Self::perm(op, cx.input(0)?.rank())?;
        let mut inverse = vec![0i64; perm.len()];
        for (axis, source) in perm.iter().enumerate() {
            inverse[*source] = axis as i64;
        }
        Ok(vec![GradOpSpec::new(opids::transpose())
            .input(0, GradInput::GradOut(0))
            .attr("perm", Attribute::Ints(inverse))
            .output(0, 0)])
    }

    fn const_fold(&self, op: &Op, inputs: &[ConstValue<'_>]) -> Result<Option<Vec<f64>>> {
        let Some(input) = inputs.first() else {
            return Ok(None);
        };
        let perm = Self::perm(op, input.info.rank())?;
        Ok(Some(fold::transpose(input, &perm)?))
    }
}

/// Static slice described by `starts`/`ends`/`axes` attributes.
#[derive(Debug, Clone, Copy)]
pub struct Slice {
    pub inplace: bool,
}

/// Full-rank, clamped `(starts, ends)` of a slice op applied to `shape`.
pub(crate) fn slice_bounds(op: &Op, shape: &[i64]) -> Result<(Vec<i64>, Vec<i64>)> {
    let starts = op.attr_ints("starts").unwrap_or(&[]);
    let ends = op.attr_ints("ends").unwrap_or(&[]);
    let axes: Vec<i64> = match op.attr_ints("axes") {
        Some(axes) => axes.to_vec(),
        None => (0..starts.len() as i64).collect(),
    };
    if starts.len() != ends.len() || starts.len() != axes.len() {
        return Err(Error::user_model(format!(
            "{}: starts, ends and axes must have equal lengths",
            op.debug_name()
        )));
    }
    let mut lo = vec![0i64; shape.len()];
    let mut hi = shape.to_vec();
    for ((start, end), axis) in starts.iter().zip(ends).zip(&axes) {
        let axis = normalize_axis(op, *axis, shape.len())?;
        let dim = shape[axis];
        let clamp = |value: i64| -> i64 {
            let value = if value < 0 { value + dim } else { value };
            value.clamp(0, dim)
        };
        lo[axis] = clamp(*start);
        hi[axis] = clamp(*end).max(lo[axis]);
    }
    Ok((lo, hi))
}

impl OpDef for Slice {
    fn setup(&self, op: &Op, cx: &SetupContext) -> Result<Vec<TensorInfo>> {
        let input = cx.input(0)?;
        let (lo, hi) = slice_bounds(op, &input.shape)?;
        let shape: Vec<i64> = lo.iter().zip(&hi).map(|(l, h)| h - l).collect();
        Ok(vec![input.with_shape(shape)])
    }

    fn flags(&self) -> OpFlags {
        OpFlags {
            inplace: self.inplace,
            ..OpFlags::default()
        }
    }

    fn aliases(&self, _op: &Op, input: InIndex, output: OutIndex) -> bool {
        self.inplace && input == 0 && output == 0
    }

    fn inplace_variants(&self, _op: &Op) -> Vec<(OperatorIdentifier, f32)> {
        if self.inplace {
            Vec::new()
        } else {
            vec![(opids::slice_inplace(), VIEW_INPLACE_PRIORITY)]
        }
    }

    fn outplace(&self) -> Option<OperatorIdentifier> {
        self.inplace.then(opids::slice)
    }

    fn grad_ops(&self, op: &Op, cx: &SetupContext) -> Result<Vec<GradOpSpec>> {
        let input = cx.input(0)?;
        let (lo, hi) = slice_bounds(op, &input.shape)?;
        Ok(vec![GradOpSpec::new(OperatorIdentifier::kiln(types::SLICE_GRAD))
            .input(0, GradInput::GradOut(0))
            .attr("starts", Attribute::Ints(lo))
            .attr("ends", Attribute::Ints(hi))
            .attr("shape", Attribute::Ints(input.shape.clone()))
            .output(0, 0)])
    }

    fn const_fold(&self, op: &Op, inputs: &[ConstValue<'_>]) -> Result<Option<Vec<f64>>> {
        let Some(input) = inputs.first() else {
            return Ok(None);
        };
        let (lo, hi) = slice_bounds(op, &input.info.shape)?;
        Ok(Some(fold::slice(input, &lo, &hi)?))
    }
}

pub(super) fn register(registry: &mut OpRegistry) {
    registry.register(opids::concat(), Concat { inplace: false });
    registry.register(opids::concat_inplace(), Concat { inplace: true });
    registry.register(opids::reshape(), Reshape { inplace: false });
    registry.register(opids::reshape_inplace(), Reshape { inplace: true });
    registry.register(opids::transpose(), Transpose { inplace: false });
    registry.register(opids::transpose_inplace(), Transpose { inplace: true });
    registry.register(opids::slice(), Slice { inplace: false });
    registry.register(opids::slice_inplace(), Slice { inplace: true });
}
