use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ir::ids::TensorId;
use crate::ir::tensor_info::TensorInfo;

/// How an anchored tensor is returned to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AnchorReturnType {
    /// Value after the last batch of a step.
    #[default]
    Final,
    /// Every batch.
    All,
    /// Every N-th batch.
    EveryN(u32),
    /// Sum over the batches of a step.
    Sum,
}

/// Tensors the caller wants back and how often the program runs per step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataFlow {
    pub batches_per_step: u32,
    pub anchors: BTreeMap<TensorId, AnchorReturnType>,
}

impl Default for DataFlow {
    fn default() -> Self {
        Self {
            batches_per_step: 1,
            anchors: BTreeMap::new(),
        }
    }
}

impl DataFlow {
    pub fn new(batches_per_step: u32) -> Self {
        Self {
            batches_per_step,
            anchors: BTreeMap::new(),
        }
    }

    pub fn anchor(mut self, tensor: impl Into<TensorId>, art: AnchorReturnType) -> Self {
        self.anchors.insert(tensor.into(), art);
        self
    }

    pub fn is_anchored(&self, tensor: &TensorId) -> bool {
        self.anchors.contains_key(tensor)
    }

    pub fn anchor_ids(&self) -> impl Iterator<Item = &TensorId> + '_ {
        self.anchors.keys()
    }
}

/// Shape and type overrides for model inputs, keyed by input name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InputShapeInfo {
    infos: BTreeMap<TensorId, TensorInfo>,
}

impl InputShapeInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, tensor: impl Into<TensorId>, info: TensorInfo) -> &mut Self {
        self.infos.insert(tensor.into(), info);
        self
    }

    pub fn get(&self, tensor: &TensorId) -> Option<&TensorInfo> {
        self.infos.get(tensor)
    }

    pub fn contains(&self, tensor: &TensorId) -> bool {
        self.infos.contains_key(tensor)
    }
}
