use crate::error::{Error, Result};
use crate::ir::ids::{InIndex, OutIndex, VGraphId};
use crate::ir::op::{Attribute, Op};
use crate::ir::tensor_info::{DataType, TensorInfo};

use super::{opids, OpDef, OpFlags, OpRegistry, SetupContext};

/// `var -= lr * grad`, in place on input 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct SgdVarUpdate;

impl SgdVarUpdate {
    pub const VAR_IN: InIndex = 0;
    pub const GRAD_IN: InIndex = 1;
    pub const LR_IN: InIndex = 2;
}

impl OpDef for SgdVarUpdate {
    fn setup(&self, op: &Op, cx: &SetupContext) -> Result<Vec<TensorInfo>> {
        let var = cx.input(Self::VAR_IN)?;
        let grad = cx.input(Self::GRAD_IN)?;
        if var.shape != grad.shape {
            return Err(Error::internal(format!(
                "{}: variable {var} and gradient {grad} differ in shape",
                op.debug_name()
            )));
        }
        Ok(vec![var.clone()])
    }

    fn flags(&self) -> OpFlags {
        OpFlags {
            var_update: true,
            side_effect: true,
            ..OpFlags::default()
        }
    }

    fn aliases(&self, _op: &Op, input: InIndex, output: OutIndex) -> bool {
        input == Self::VAR_IN && output == 0
    }

    fn modifies(&self, _op: &Op, input: InIndex) -> bool {
        input == Self::VAR_IN
    }

    fn rts_indices(&self, _op: &Op) -> Vec<(Vec<InIndex>, Vec<OutIndex>)> {
        vec![(vec![Self::VAR_IN, Self::GRAD_IN], vec![0])]
    }
}

/// Creates a zero-initialised tensor described by `shape` and `dtype`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Init;

impl OpDef for Init {
    fn setup(&self, op: &Op, _cx: &SetupContext) -> Result<Vec<TensorInfo>> {
        let shape = op.attr_ints("shape").unwrap_or(&[]).to_vec();
        let dtype = match op.attr("dtype") {
            Some(Attribute::String(name)) => DataType::from_name(name).ok_or_else(|| {
                Error::user_model(format!("{}: unknown dtype '{name}'", op.debug_name()))
            })?,
            _ => DataType::Float,
        };
        Ok(vec![TensorInfo::new(dtype, shape)])
    }

    fn flags(&self) -> OpFlags {
        OpFlags {
            init: true,
            side_effect: true,
            ..OpFlags::default()
        }
    }
}

/// Copies each input to the same-index output on the destination partition.
#[derive(Debug, Clone, Copy, Default)]
pub struct IpuCopy;

impl IpuCopy {
    /// Partition input `index` is copied from.
    pub fn source_ipu(op: &Op, index: InIndex) -> Option<VGraphId> {
        op.attr_ints("source_ipus")
            .and_then(|sources| sources.get(index).copied())
    }

    pub fn dest_ipu(op: &Op) -> Option<VGraphId> {
        op.attr_int("dest_ipu")
    }

    pub fn attrs(sources: Vec<VGraphId>, dest: VGraphId) -> crate::ir::op::Attributes {
        let mut attrs = crate::ir::op::Attributes::new();
        attrs.insert("source_ipus".to_string(), Attribute::Ints(sources));
        attrs.insert("dest_ipu".to_string(), Attribute::Int(dest));
        attrs
    }
}

impl OpDef for IpuCopy {
    fn setup(&self, _op: &Op, cx: &SetupContext) -> Result<Vec<TensorInfo>> {
        Ok(cx.inputs.values().cloned().collect())
    }

    fn flags(&self) -> OpFlags {
        OpFlags {
            ipu_copy: true,
            ..OpFlags::default()
        }
    }

    fn subgraph_equiv_id(&self, _op: &Op) -> Option<String> {
        None
    }
}

/// Number of in-flight batches a stash holds, from the `stash_size` attribute.
fn stash_size(op: &Op) -> Result<i64> {
    let size = op.require_int("stash_size")?;
    if size < 1 {
        return Err(Error::internal(format!(
            "{}: stash size must be positive, got {size}",
            op.debug_name()
        )));
    }
    Ok(size)
}

/// Pushes its input onto a ring buffer of `stash_size` entries.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stash;

impl OpDef for Stash {
    fn setup(&self, op: &Op, cx: &SetupContext) -> Result<Vec<TensorInfo>> {
        let input = cx.input(0)?;
        let mut shape = vec![stash_size(op)?];
        shape.extend_from_slice(&input.shape);
        Ok(vec![TensorInfo::new(input.dtype, shape)])
    }

    fn subgraph_equiv_id(&self, _op: &Op) -> Option<String> {
        None
    }
}

/// Restores a stashed activation into its original buffer.
#[derive(Debug, Clone, Copy, Default)]
pub struct RestoreInplace;

impl RestoreInplace {
    pub const ACT_IN: InIndex = 0;
    pub const STASH_IN: InIndex = 1;
}

impl OpDef for RestoreInplace {
    fn setup(&self, op: &Op, cx: &SetupContext) -> Result<Vec<TensorInfo>> {
        let act = cx.input(Self::ACT_IN)?;
        if let Ok(stash) = cx.input(Self::STASH_IN) {
            let size = stash_size(op)?;
            if stash.shape.first() != Some(&size) || stash.shape[1..] != act.shape[..] {
                return Err(Error::internal(format!(
                    "{}: stash {stash} does not hold {size} copies of {act}",
                    op.debug_name()
                )));
            }
        }
        Ok(vec![act.clone()])
    }

    fn flags(&self) -> OpFlags {
        OpFlags {
            restore_inplace: true,
            inplace: true,
            ..OpFlags::default()
        }
    }

    fn aliases(&self, _op: &Op, input: InIndex, output: OutIndex) -> bool {
        input == Self::ACT_IN && output == 0
    }

    fn modifies(&self, _op: &Op, input: InIndex) -> bool {
        input == Self::ACT_IN
    }

    fn subgraph_equiv_id(&self, _op: &Op) -> Option<String> {
        None
    }
}

pub(super) fn register(registry: &mut OpRegistry) {
    registry.register(opids::sgd_var_update(), SgdVarUpdate);
    registry.register(opids::init(), Init);
    registry.register(opids::ipu_copy(), IpuCopy);
    registry.register(opids::stash(), Stash);
    registry.register(opids::restore_inplace(), RestoreInplace);
}
