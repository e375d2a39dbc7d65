use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ir::ids::{OpId, TensorId};
use crate::ir::tensor_info::TensorInfo;

/// Closed set of tensor roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TensorType {
    /// Activation or gradient, produced by an op (or a root anchor).
    ActGrad,
    /// Compile-time constant. Never produced, never modified.
    Const,
    /// Host-fed input. Never produced.
    Stream,
    /// Trainable or otherwise persistent weight.
    Variable,
}

impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TensorType::ActGrad => "ActGrad",
            TensorType::Const => "Const",
            TensorType::Stream => "Stream",
            TensorType::Variable => "Variable",
        };
        f.write_str(name)
    }
}

/// Whether a vertex lies on a path to (or from) the final loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LossPath {
    Yes,
    No,
    #[default]
    Undefined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VertexState {
    pub to_loss: LossPath,
    pub from_loss: LossPath,
    pub scheduled_pre_loss: LossPath,
}

/// Loss-path bookkeeping shared by ops and tensors.
pub trait Vertex {
    fn vertex(&self) -> &VertexState;
    fn vertex_mut(&mut self) -> &mut VertexState;

    fn to_loss(&self) -> LossPath {
        self.vertex().to_loss
    }

    fn from_loss(&self) -> LossPath {
        self.vertex().from_loss
    }
}

/// Multiset of ops reading a tensor, keyed by op id for deterministic iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Consumers {
    counts: BTreeMap<OpId, usize>,
}

impl Consumers {
    pub fn increment(&mut self, op: OpId) {
        *self.counts.entry(op).or_insert(0) += 1;
    }

    pub fn decrement(&mut self, op: OpId) -> Result<()> {
        match self.counts.get_mut(&op) {
            Some(count) if *count > 1 => {
                *count -= 1;
                Ok(())
            }
            Some(_) => {
                self.counts.remove(&op);
                Ok(())
            }
            None => Err(Error::internal(format!(
                "cannot decrement consumer count of {op}: not a consumer"
            ))),
        }
    }

    /// Number of times `op` reads the tensor.
    pub fn n(&self, op: OpId) -> usize {
        self.counts.get(&op).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn ops(&self) -> Vec<OpId> {
        self.counts.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn contains(&self, op: OpId) -> bool {
        self.counts.contains_key(&op)
    }

    pub fn iter(&self) -> impl Iterator<Item = (OpId, usize)> + '_ {
        self.counts.iter().map(|(op, n)| (*op, *n))
    }
}

/// A value flowing between ops.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tensor {
    pub id: TensorId,
    pub info: TensorInfo,
    pub tensor_type: TensorType,
    producer: Option<OpId>,
    pub consumers: Consumers,
    /// Constant payload for `Const` and initialised `Variable` tensors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<f64>>,
    #[serde(skip)]
    vertex: VertexState,
}

impl Tensor {
    pub fn new(id: TensorId, tensor_type: TensorType, info: TensorInfo) -> Self {
        Self {
            id,
            info,
            tensor_type,
            producer: None,
            consumers: Consumers::default(),
            data: None,
            vertex: VertexState::default(),
        }
    }

    pub fn with_data(mut self, data: Vec<f64>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn producer(&self) -> Option<OpId> {
        self.producer
    }

    pub fn has_producer(&self) -> bool {
        self.producer.is_some()
    }

    pub(crate) fn set_producer(&mut self, op: OpId) -> Result<()> {
        if let Some(existing) = self.producer {
            if existing != op {
                return Err(Error::internal(format!(
                    "tensor {} already has producer {existing}, cannot set {op}",
                    self.id
                )));
            }
        }
        self.producer = Some(op);
        Ok(())
    }

    pub(crate) fn clear_producer(&mut self) {
        self.producer = None;
    }

    pub fn is_isolated(&self) -> bool {
        self.producer.is_none() && self.consumers.is_empty()
    }

    pub fn is_const(&self) -> bool {
        self.tensor_type == TensorType::Const
    }
}

impl Vertex for Tensor {
    fn vertex(&self) -> &VertexState {
        &self.vertex
    }

    fn vertex_mut(&mut self) -> &mut VertexState {
        &mut self.vertex
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumers_count_repeated_reads() {
        let mut consumers = Consumers::default();
        consumers.increment(OpId(3));
        consumers.increment(OpId(3));
        consumers.increment(OpId(1));
        assert_eq!(consumers.n(OpId(3)), 2);
        assert_eq!(consumers.total(), 3);
        assert_eq!(consumers.ops(), vec![OpId(1), OpId(3)]);

        consumers.decrement(OpId(3)).unwrap();
        assert_eq!(consumers.n(OpId(3)), 1);
        consumers.decrement(OpId(3)).unwrap();
        assert!(!consumers.contains(OpId(3)));
        assert!(consumers.decrement(OpId(3)).is_err());
    }

    #[test]
    fn second_producer_is_rejected() {
        let mut t = Tensor::new(
            TensorId::from("t"),
            TensorType::ActGrad,
            TensorInfo::undefined(),
        );
        t.set_producer(OpId(0)).unwrap();
        assert!(t.set_producer(OpId(1)).is_err());
        assert_eq!(t.producer(), Some(OpId(0)));
    }
}
