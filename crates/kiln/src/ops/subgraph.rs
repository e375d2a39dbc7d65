use crate::error::{Error, Result};
use crate::ir::op::Op;
use crate::ir::tensor_info::TensorInfo;

use super::{opids, OpDef, OpFlags, OpRegistry, SetupContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubgraphKind {
    /// `callee` attribute; inputs and outputs map 1:1 onto the callee's.
    Call,
    /// Input 0 is the condition; `then_branch` and `else_branch` attributes.
    If,
    /// `body` attribute.
    Loop,
}

/// Ops that call other graphs.
///
/// Their output infos come from the called graph's outputs and are assigned
/// when the op is created; setup only checks that they are present.
#[derive(Debug, Clone, Copy)]
pub struct SubgraphCall {
    pub kind: SubgraphKind,
}

impl OpDef for SubgraphCall {
    fn setup(&self, op: &Op, cx: &SetupContext) -> Result<Vec<TensorInfo>> {
        let count = op.output.max_index().map(|max| max + 1).unwrap_or(0);
        (0..count)
            .map(|index| match cx.output(index) {
                Some(info) if info.is_set() => Ok(info.clone()),
                _ if !op.has_output(index) => Ok(TensorInfo::undefined()),
                _ => Err(Error::internal(format!(
                    "{}: output {index} has no info from the called graph",
                    op.debug_name()
                ))),
            })
            .collect()
    }

    fn flags(&self) -> OpFlags {
        OpFlags {
            subgraph: true,
            side_effect: self.kind == SubgraphKind::Loop,
            ..OpFlags::default()
        }
    }
}

pub(super) fn register(registry: &mut OpRegistry) {
    registry.register(
        opids::call(),
        SubgraphCall {
            kind: SubgraphKind::Call,
        },
    );
    registry.register(
        opids::if_op(),
        SubgraphCall {
            kind: SubgraphKind::If,
        },
    );
    registry.register(
        opids::loop_op(),
        SubgraphCall {
            kind: SubgraphKind::Loop,
        },
    );
}
