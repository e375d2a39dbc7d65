use std::collections::BTreeMap;

use serde::Serialize;
use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::ir::ids::TensorId;

/// Ordered bidirectional mapping between op slots and tensors.
///
/// A slot holds at most one tensor; a tensor may occupy several slots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TensorIndexMap {
    by_index: BTreeMap<usize, TensorId>,
    #[serde(skip)]
    by_tensor: BTreeMap<TensorId, SmallVec<[usize; 2]>>,
}

impl TensorIndexMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, index: usize, tensor: TensorId) -> Result<()> {
        if let Some(existing) = self.by_index.get(&index) {
            return Err(Error::internal(format!(
                "index {index} already holds tensor {existing}, cannot insert {tensor}"
            )));
        }
        let slots = self.by_tensor.entry(tensor.clone()).or_default();
        let pos = slots.partition_point(|slot| *slot < index);
        slots.insert(pos, index);
        self.by_index.insert(index, tensor);
        Ok(())
    }

    /// Removes the tensor at `index`, returning it.
    pub fn erase(&mut self, index: usize) -> Option<TensorId> {
        let tensor = self.by_index.remove(&index)?;
        if let Some(slots) = self.by_tensor.get_mut(&tensor) {
            slots.retain(|slot| *slot != index);
            if slots.is_empty() {
                self.by_tensor.remove(&tensor);
            }
        }
        Some(tensor)
    }

    pub fn has_index(&self, index: usize) -> bool {
        self.by_index.contains_key(&index)
    }

    pub fn contains(&self, tensor: &TensorId) -> bool {
        self.by_tensor.contains_key(tensor)
    }

    pub fn tensor(&self, index: usize) -> Option<&TensorId> {
        self.by_index.get(&index)
    }

    /// Sorted slots occupied by `tensor`.
    pub fn indices(&self, tensor: &TensorId) -> &[usize] {
        self.by_tensor
            .get(tensor)
            .map(|slots| slots.as_slice())
            .unwrap_or(&[])
    }

    /// Number of occupied slots.
    pub fn n(&self) -> usize {
        self.by_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_index.is_empty()
    }

    /// Tensors in slot order, with repeats.
    pub fn tensors(&self) -> Vec<TensorId> {
        self.by_index.values().cloned().collect()
    }

    /// Each distinct tensor once, in id order.
    pub fn unique_tensors(&self) -> Vec<TensorId> {
        self.by_tensor.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &TensorId)> + '_ {
        self.by_index.iter().map(|(index, tensor)| (*index, tensor))
    }

    pub fn max_index(&self) -> Option<usize> {
        self.by_index.keys().next_back().copied()
    }

    pub fn clear(&mut self) {
        self.by_index.clear();
        self.by_tensor.clear();
    }
}
