use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::ir::ids::TensorId;
use crate::ir::tensor::{Tensor, TensorType};
use crate::ir::tensor_info::TensorInfo;

/// Owning store of a graph's tensors, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct Tensors {
    tensors: BTreeMap<TensorId, Tensor>,
}

impl Tensors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a fully formed tensor. Fails if the id is already taken.
    pub fn insert(&mut self, tensor: Tensor) -> Result<()> {
        if self.tensors.contains_key(&tensor.id) {
            return Err(Error::collision(format!(
                "tensor '{}' already exists",
                tensor.id
            )));
        }
        self.tensors.insert(tensor.id.clone(), tensor);
        Ok(())
    }

    pub fn add_const_init(&mut self, id: TensorId, info: TensorInfo, data: Vec<f64>) -> Result<()> {
        check_payload(&id, &info, &data)?;
        self.insert(Tensor::new(id, TensorType::Const, info).with_data(data))
    }

    pub fn add_var_init(&mut self, id: TensorId, info: TensorInfo, data: Vec<f64>) -> Result<()> {
        check_payload(&id, &info, &data)?;
        self.insert(Tensor::new(id, TensorType::Variable, info).with_data(data))
    }

    pub fn add_stream(&mut self, id: TensorId, info: TensorInfo) -> Result<()> {
        self.insert(Tensor::new(id, TensorType::Stream, info))
    }

    /// Placeholder for an activation or gradient; its info is set when the
    /// producer is set up.
    pub fn add_act_grad(&mut self, id: TensorId) -> Result<()> {
        self.insert(Tensor::new(id, TensorType::ActGrad, TensorInfo::undefined()))
    }

    pub fn contains(&self, id: &TensorId) -> bool {
        self.tensors.contains_key(id)
    }

    pub fn get(&self, id: &TensorId) -> Result<&Tensor> {
        self.tensors
            .get(id)
            .ok_or_else(|| Error::not_found(format!("no tensor '{id}'")))
    }

    pub fn get_mut(&mut self, id: &TensorId) -> Result<&mut Tensor> {
        self.tensors
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("no tensor '{id}'")))
    }

    pub fn remove(&mut self, id: &TensorId) -> Result<Tensor> {
        self.tensors
            .remove(id)
            .ok_or_else(|| Error::not_found(format!("cannot remove tensor '{id}': not present")))
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// All ids, sorted.
    pub fn ids(&self) -> Vec<TensorId> {
        self.tensors.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tensor> + '_ {
        self.tensors.values()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Tensor> + '_ {
        self.tensors.values_mut()
    }

    /// Ids of tensors of the given type, sorted.
    pub fn of_type(&self, tensor_type: TensorType) -> Vec<TensorId> {
        self.tensors
            .values()
            .filter(|tensor| tensor.tensor_type == tensor_type)
            .map(|tensor| tensor.id.clone())
            .collect()
    }

    pub fn no_producer_ids(&self) -> Vec<TensorId> {
        self.tensors
            .values()
            .filter(|tensor| !tensor.has_producer())
            .map(|tensor| tensor.id.clone())
            .collect()
    }

    /// Replaces a tensor's value with folded constant data. The tensor's
    /// producer must already be gone.
    pub fn make_const(&mut self, id: &TensorId, data: Vec<f64>) -> Result<()> {
        let tensor = self.get_mut(id)?;
        if let Some(producer) = tensor.producer() {
            return Err(Error::internal(format!(
                "cannot make '{id}' constant while {producer} still produces it"
            )));
        }
        check_payload(id, &tensor.info, &data)?;
        tensor.tensor_type = TensorType::Const;
        tensor.data = Some(data);
        Ok(())
    }
}

fn check_payload(id: &TensorId, info: &TensorInfo, data: &[f64]) -> Result<()> {
    let expected = info.nelms();
    if expected >= 0 && data.len() as i64 != expected {
        return Err(Error::user_model(format!(
            "tensor '{id}' with info {info} expects {expected} elements, got {}",
            data.len()
        )));
    }
    Ok(())
}
