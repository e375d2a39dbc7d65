use crate::error::{Error, Result};
use crate::ir::tensor_info::{broadcast_shapes, TensorInfo};

/// Constant input handed to [`super::OpDef::const_fold`].
#[derive(Debug, Clone, Copy)]
pub struct ConstValue<'a> {
    pub info: &'a TensorInfo,
    pub data: &'a [f64],
}

fn strides(shape: &[i64]) -> Vec<usize> {
    let mut strides = vec![1usize; shape.len()];
    for axis in (0..shape.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * shape[axis + 1].max(0) as usize;
    }
    strides
}

fn nelms(shape: &[i64]) -> usize {
    shape.iter().map(|d| (*d).max(0) as usize).product()
}

pub(crate) fn unary(input: &ConstValue<'_>, f: impl Fn(f64) -> f64) -> Vec<f64> {
    input.data.iter().map(|x| f(*x)).collect()
}

/// Numpy-broadcasting elementwise binary evaluation.
pub(crate) fn binary(
    lhs: &ConstValue<'_>,
    rhs: &ConstValue<'_>,
    f: impl Fn(f64, f64) -> f64,
) -> Result<Vec<f64>> {
    let out_shape = broadcast_shapes(&lhs.info.shape, &rhs.info.shape)?;
    let rank = out_shape.len();
    let lhs_strides = broadcast_strides(&lhs.info.shape, rank);
    let rhs_strides = broadcast_strides(&rhs.info.shape, rank);
    let out_strides = strides(&out_shape);
    let total = nelms(&out_shape);
    let mut out = Vec::with_capacity(total);
    for flat in 0..total {
        let mut rem = flat;
        let mut li = 0;
        let mut ri = 0;
        for axis in 0..rank {
            let coord = rem / out_strides[axis];
            rem %= out_strides[axis];
            li += coord * lhs_strides[axis];
            ri += coord * rhs_strides[axis];
        }
        let (Some(a), Some(b)) = (lhs.data.get(li), rhs.data.get(ri)) else {
            return Err(Error::internal("constant payload shorter than its shape"));
        };
        out.push(f(*a, *b));
    }
    Ok(out)
}

/// Strides of `shape` right-aligned to `rank`, zero on broadcast axes.
fn broadcast_strides(shape: &[i64], rank: usize) -> Vec<usize> {
    let own = strides(shape);
    let offset = rank - shape.len();
    (0..rank)
        .map(|axis| {
            if axis < offset {
                0
            } else {
                let local = axis - offset;
                if shape[local] == 1 {
                    0
                } else {
                    own[local]
                }
            }
        })
        .collect()
}

pub(crate) fn concat(inputs: &[ConstValue<'_>], axis: usize) -> Result<Vec<f64>> {
    let Some(first) = inputs.first() else {
        return Ok(Vec::new());
    };
    let outer: usize = nelms(&first.info.shape[..axis]);
    let mut out = Vec::with_capacity(inputs.iter().map(|i| i.data.len()).sum());
    for block in 0..outer {
        for input in inputs {
            let inner = nelms(&input.info.shape[axis..]);
            let start = block * inner;
            let chunk = input
                .data
                .get(start..start + inner)
                .ok_or_else(|| Error::internal("constant payload shorter than its shape"))?;
            out.extend_from_slice(chunk);
        }
    }
    Ok(out)
}

pub(crate) fn transpose(input: &ConstValue<'_>, perm: &[usize]) -> Result<Vec<f64>> {
    let shape = &input.info.shape;
    let out_shape: Vec<i64> = perm.iter().map(|axis| shape[*axis]).collect();
    let in_strides = strides(shape);
    let out_strides = strides(&out_shape);
    let total = nelms(&out_shape);
    let mut out = Vec::with_capacity(total);
    for flat in 0..total {
        let mut rem = flat;
        let mut src = 0;
        for (axis, stride) in out_strides.iter().enumerate() {
            let coord = rem / stride;
            rem %= stride;
            src += coord * in_strides[perm[axis]];
        }
        out.push(
            *input
                .data
                .get(src)
                .ok_or_else(|| Error::internal("constant payload shorter than its shape"))?,
        );
    }
    Ok(out)
}

/// Copies the box `starts..ends` (per axis) out of a row-major tensor.
pub(crate) fn slice(input: &ConstValue<'_>, starts: &[i64], ends: &[i64]) -> Result<Vec<f64>> {
    let shape = &input.info.shape;
    let out_shape: Vec<i64> = starts.iter().zip(ends).map(|(s, e)| e - s).collect();
    let in_strides = strides(shape);
    let out_strides = strides(&out_shape);
    let total = nelms(&out_shape);
    let mut out = Vec::with_capacity(total);
    for flat in 0..total {
        let mut rem = flat;
        let mut src = 0;
        for axis in 0..shape.len() {
            let coord = rem / out_strides[axis];
            rem %= out_strides[axis];
            src += (coord + starts[axis] as usize) * in_strides[axis];
        }
        out.push(
            *input
                .data
                .get(src)
                .ok_or_else(|| Error::internal("constant payload shorter than its shape"))?,
        );
    }
    Ok(out)
}
