use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataType {
    Undefined,
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Float16,
    Float,
    Double,
}

impl DataType {
    pub fn is_defined(self) -> bool {
        self != DataType::Undefined
    }

    pub fn is_float(self) -> bool {
        matches!(self, DataType::Float16 | DataType::Float | DataType::Double)
    }

    pub fn size_in_bytes(self) -> usize {
        match self {
            DataType::Undefined => 0,
            DataType::Bool | DataType::Int8 | DataType::Uint8 => 1,
            DataType::Int16 | DataType::Uint16 | DataType::Float16 => 2,
            DataType::Int32 | DataType::Uint32 | DataType::Float => 4,
            DataType::Int64 | DataType::Double => 8,
        }
    }

    /// Parses the upper-case names used by model files (`"FLOAT"`, `"INT32"`, ...).
    pub fn from_name(name: &str) -> Option<Self> {
        let dtype = match name.to_ascii_uppercase().as_str() {
            "UNDEFINED" => DataType::Undefined,
            "BOOL" => DataType::Bool,
            "INT8" => DataType::Int8,
            "INT16" => DataType::Int16,
            "INT32" => DataType::Int32,
            "INT64" => DataType::Int64,
            "UINT8" => DataType::Uint8,
            "UINT16" => DataType::Uint16,
            "UINT32" => DataType::Uint32,
            "FLOAT16" => DataType::Float16,
            "FLOAT" => DataType::Float,
            "DOUBLE" => DataType::Double,
            _ => return None,
        };
        Some(dtype)
    }

    pub fn name(self) -> &'static str {
        match self {
            DataType::Undefined => "UNDEFINED",
            DataType::Bool => "BOOL",
            DataType::Int8 => "INT8",
            DataType::Int16 => "INT16",
            DataType::Int32 => "INT32",
            DataType::Int64 => "INT64",
            DataType::Uint8 => "UINT8",
            DataType::Uint16 => "UINT16",
            DataType::Uint32 => "UINT32",
            DataType::Float16 => "FLOAT16",
            DataType::Float => "FLOAT",
            DataType::Double => "DOUBLE",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Data type plus shape of a tensor.
///
/// `meta_shape` is only set on replicated-tensor-sharded tensors, where it
/// records the shape of the full (unsharded) tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorInfo {
    pub dtype: DataType,
    pub shape: Vec<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub meta_shape: Vec<i64>,
}

impl TensorInfo {
    pub fn new(dtype: DataType, shape: impl Into<Vec<i64>>) -> Self {
        Self {
            dtype,
            shape: shape.into(),
            meta_shape: Vec::new(),
        }
    }

    pub fn undefined() -> Self {
        Self::new(DataType::Undefined, Vec::new())
    }

    pub fn scalar(dtype: DataType) -> Self {
        Self::new(dtype, Vec::new())
    }

    pub fn with_meta_shape(mut self, meta_shape: impl Into<Vec<i64>>) -> Self {
        self.meta_shape = meta_shape.into();
        self
    }

    pub fn with_shape(&self, shape: impl Into<Vec<i64>>) -> Self {
        Self {
            dtype: self.dtype,
            shape: shape.into(),
            meta_shape: self.meta_shape.clone(),
        }
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn nelms(&self) -> i64 {
        self.shape.iter().product()
    }

    pub fn nbytes(&self) -> i64 {
        self.nelms() * self.dtype.size_in_bytes() as i64
    }

    pub fn dim(&self, axis: usize) -> Option<i64> {
        self.shape.get(axis).copied()
    }

    pub fn is_set(&self) -> bool {
        self.dtype.is_defined()
    }
}

impl fmt::Display for TensorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:?}", self.dtype, self.shape)
    }
}

/// Numpy-style broadcast of two shapes.
pub fn broadcast_shapes(lhs: &[i64], rhs: &[i64]) -> Result<Vec<i64>> {
    let rank = lhs.len().max(rhs.len());
    let mut out = vec![0; rank];
    for axis in 0..rank {
        let l = dim_from_back(lhs, rank - 1 - axis);
        let r = dim_from_back(rhs, rank - 1 - axis);
        out[axis] = match (l, r) {
            (a, b) if a == b => a,
            (1, b) => b,
            (a, 1) => a,
            (a, b) => {
                return Err(Error::user_model(format!(
                    "shapes {lhs:?} and {rhs:?} are not broadcast compatible (dims {a} and {b})"
                )))
            }
        };
    }
    Ok(out)
}

fn dim_from_back(shape: &[i64], from_back: usize) -> i64 {
    if from_back < shape.len() {
        shape[shape.len() - 1 - from_back]
    } else {
        1
    }
}

/// Output info of a numpy-broadcasting binary op.
pub fn broadcast_info(lhs: &TensorInfo, rhs: &TensorInfo) -> Result<TensorInfo> {
    if lhs.dtype != rhs.dtype && lhs.dtype.is_defined() && rhs.dtype.is_defined() {
        return Err(Error::user_model(format!(
            "binary op inputs have mismatched types {} and {}",
            lhs.dtype, rhs.dtype
        )));
    }
    let shape = broadcast_shapes(&lhs.shape, &rhs.shape)?;
    Ok(TensorInfo::new(lhs.dtype, shape))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_against_unit_tensor() {
        let out = broadcast_shapes(&[2, 4, 3], &[1, 1, 1]).unwrap();
        assert_eq!(out, vec![2, 4, 3]);
    }

    #[test]
    fn broadcast_pads_lower_rank() {
        assert_eq!(broadcast_shapes(&[3], &[2, 1]).unwrap(), vec![2, 3]);
    }

    #[test]
    fn broadcast_rejects_mismatch() {
        let err = broadcast_shapes(&[2, 3], &[4, 3]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::UserModel);
    }

    #[test]
    fn dtype_names_parse() {
        assert_eq!(DataType::from_name("float"), Some(DataType::Float));
        assert_eq!(DataType::from_name("COMPLEX"), None);
    }
}
