use crate::error::{Error, Result};
use crate::ir::ids::{InIndex, OutIndex};
use crate::ir::op::{Attribute, Op, OperatorIdentifier};
use crate::ir::tensor_info::{broadcast_info, DataType, TensorInfo};

use super::fold::{self, ConstValue};
use super::{opids, types, GradInput, GradOpSpec, OpDef, OpFlags, OpRegistry, SetupContext};

/// Default priority of the inplace variants of elementwise ops.
const INPLACE_PRIORITY: f32 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryKind {
    Relu,
    Neg,
    Exp,
    Sigmoid,
    Scale,
    Identity,
    Cast,
}

impl UnaryKind {
    fn outplace_id(self) -> OperatorIdentifier {
        match self {
            UnaryKind::Relu => opids::relu(),
            UnaryKind::Neg => opids::neg(),
            UnaryKind::Exp => opids::exp(),
            UnaryKind::Sigmoid => opids::sigmoid(),
            UnaryKind::Scale => opids::scale(),
            UnaryKind::Identity => opids::identity(),
            UnaryKind::Cast => opids::cast(),
        }
    }

    fn inplace_id(self) -> Option<OperatorIdentifier> {
        match self {
            UnaryKind::Relu => Some(opids::relu_inplace()),
            UnaryKind::Neg => Some(opids::neg_inplace()),
            UnaryKind::Exp => Some(opids::exp_inplace()),
            UnaryKind::Sigmoid => Some(opids::sigmoid_inplace()),
            UnaryKind::Scale => Some(opids::scale_inplace()),
            UnaryKind::Identity => Some(opids::identity_inplace()),
            UnaryKind::Cast => None,
        }
    }
}

/// Elementwise single-input ops and their inplace variants.
#[derive(Debug, Clone, Copy)]
pub struct UnaryElementwise {
    pub kind: UnaryKind,
    pub inplace: bool,
}

impl UnaryElementwise {
    pub const fn outplace(kind: UnaryKind) -> Self {
        Self {
            kind,
            inplace: false,
        }
    }

    pub const fn inplace(kind: UnaryKind) -> Self {
        Self {
            kind,
            inplace: true,
        }
    }
}

fn cast_target(op: &Op) -> Result<DataType> {
    match op.attr("to") {
        Some(Attribute::String(name)) => DataType::from_name(name).ok_or_else(|| {
            Error::user_model(format!("{}: unknown cast target '{name}'", op.debug_name()))
        }),
        _ => Err(Error::user_model(format!(
            "{} is missing attribute 'to'",
            op.debug_name()
        ))),
    }
}

fn scale_factor(op: &Op) -> Result<f64> {
    op.attr_float("scale").ok_or_else(|| {
        Error::user_model(format!("{} is missing attribute 'scale'", op.debug_name()))
    })
}

impl OpDef for UnaryElementwise {
    fn setup(&self, op: &Op, cx: &SetupContext) -> Result<Vec<TensorInfo>> {
        let input = cx.input(0)?;
        if self.kind == UnaryKind::Cast {
            let mut out = input.clone();
            out.dtype = cast_target(op)?;
            return Ok(vec![out]);
        }
        Ok(vec![input.clone()])
    }

    fn flags(&self) -> OpFlags {
        OpFlags {
            batch_serializable: true,
            inplace: self.inplace,
            ..OpFlags::default()
        }
    }

    fn aliases(&self, _op: &Op, input: InIndex, output: OutIndex) -> bool {
        self.inplace && input == 0 && output == 0
    }

    fn modifies(&self, _op: &Op, input: InIndex) -> bool {
        self.inplace && input == 0 && self.kind != UnaryKind::Identity
    }

    fn inplace_variants(&self, _op: &Op) -> Vec<(OperatorIdentifier, f32)> {
        if self.inplace {
            return Vec::new();
        }
        self.kind
            .inplace_id()
            .map(|id| vec![(id, INPLACE_PRIORITY)])
            .unwrap_or_default()
    }

    fn outplace(&self) -> Option<OperatorIdentifier> {
        self.inplace.then(|| self.kind.outplace_id())
    }

    fn grad_ops(&self, op: &Op, cx: &SetupContext) -> Result<Vec<GradOpSpec>> {
        let spec = match self.kind {
            UnaryKind::Relu => GradOpSpec::new(OperatorIdentifier::kiln(types::RELU_GRAD))
                .input(0, GradInput::GradOut(0))
                .input(1, GradInput::FwdOut(0)),
            UnaryKind::Exp => GradOpSpec::new(OperatorIdentifier::kiln(types::EXP_GRAD))
                .input(0, GradInput::GradOut(0))
                .input(1, GradInput::FwdOut(0)),
            UnaryKind::Sigmoid => GradOpSpec::new(OperatorIdentifier::kiln(types::SIGMOID_GRAD))
                .input(0, GradInput::GradOut(0))
                .input(1, GradInput::FwdOut(0)),
            UnaryKind::Neg => GradOpSpec::new(opids::neg()).input(0, GradInput::GradOut(0)),
            UnaryKind::Identity => {
                GradOpSpec::new(opids::identity()).input(0, GradInput::GradOut(0))
            }
            UnaryKind::Scale => GradOpSpec::new(opids::scale())
                .input(0, GradInput::GradOut(0))
                .attr("scale", Attribute::Float(scale_factor(op)?)),
            UnaryKind::Cast => GradOpSpec::new(opids::cast())
                .input(0, GradInput::GradOut(0))
                .attr(
                    "to",
                    Attribute::String(cx.input(0)?.dtype.name().to_string()),
                ),
        };
        Ok(vec![spec.output(0, 0)])
    }

    fn const_fold(&self, op: &Op, inputs: &[ConstValue<'_>]) -> Result<Option<Vec<f64>>> {
        let [input] = inputs else {
            return Ok(None);
        };
        let out = match self.kind {
            UnaryKind::Relu => fold::unary(input, |x| x.max(0.0)),
            UnaryKind::Neg => fold::unary(input, |x| -x),
            UnaryKind::Exp => fold::unary(input, f64::exp),
            UnaryKind::Sigmoid => fold::unary(input, |x| 1.0 / (1.0 + (-x).exp())),
            UnaryKind::Identity => input.data.to_vec(),
            UnaryKind::Scale => {
                let scale = scale_factor(op)?;
                fold::unary(input, |x| x * scale)
            }
            UnaryKind::Cast => {
                let target = cast_target(op)?;
                if target == DataType::Bool {
                    fold::unary(input, |x| if x != 0.0 { 1.0 } else { 0.0 })
                } else if target.is_float() {
                    input.data.to_vec()
                } else {
                    fold::unary(input, f64::trunc)
                }
            }
        };
        Ok(Some(out))
    }

    fn rts_indices(&self, _op: &Op) -> Vec<(Vec<InIndex>, Vec<OutIndex>)> {
        vec![(vec![0], vec![0])]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryKind {
    Add,
    Sub,
    Mul,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InplaceSide {
    Lhs,
    Rhs,
}

impl InplaceSide {
    fn index(self) -> InIndex {
        match self {
            InplaceSide::Lhs => 0,
            InplaceSide::Rhs => 1,
        }
    }
}

/// Numpy-broadcasting binary ops and their inplace variants.
#[derive(Debug, Clone, Copy)]
pub struct BinaryElementwise {
    pub kind: BinaryKind,
    pub inplace: Option<InplaceSide>,
}

impl BinaryElementwise {
    pub const fn outplace(kind: BinaryKind) -> Self {
        Self {
            kind,
            inplace: None,
        }
    }

    pub const fn inplace(kind: BinaryKind, side: InplaceSide) -> Self {
        Self {
            kind,
            inplace: Some(side),
        }
    }

    fn reduce_to(cx: &SetupContext, index: InIndex) -> Result<Attribute> {
        Ok(Attribute::Ints(cx.input(index)?.shape.clone()))
    }
}

impl OpDef for BinaryElementwise {
    fn setup(&self, _op: &Op, cx: &SetupContext) -> Result<Vec<TensorInfo>> {
        Ok(vec![broadcast_info(cx.input(0)?, cx.input(1)?)?])
    }

    fn flags(&self) -> OpFlags {
        OpFlags {
            batch_serializable: true,
            elementwise_binary: true,
            inplace: self.inplace.is_some(),
            ..OpFlags::default()
        }
    }

    fn aliases(&self, _op: &Op, input: InIndex, output: OutIndex) -> bool {
        output == 0 && self.inplace.map(InplaceSide::index) == Some(input)
    }

    fn modifies(&self, _op: &Op, input: InIndex) -> bool {
        self.inplace.map(InplaceSide::index) == Some(input)
    }

    fn inplace_variants(&self, _op: &Op) -> Vec<(OperatorIdentifier, f32)> {
        if self.inplace.is_some() {
            return Vec::new();
        }
        match self.kind {
            BinaryKind::Add => vec![
                (opids::add_lhs_inplace(), INPLACE_PRIORITY),
                (opids::add_rhs_inplace(), INPLACE_PRIORITY),
            ],
            BinaryKind::Mul => vec![
                (opids::mul_lhs_inplace(), INPLACE_PRIORITY),
                (opids::mul_rhs_inplace(), INPLACE_PRIORITY),
            ],
            BinaryKind::Sub => Vec::new(),
        }
    }

    fn outplace(&self) -> Option<OperatorIdentifier> {
        self.inplace.map(|_| match self.kind {
            BinaryKind::Add => opids::add(),
            BinaryKind::Sub => opids::sub(),
            BinaryKind::Mul => opids::mul(),
        })
    }

    fn grad_ops(&self, _op: &Op, cx: &SetupContext) -> Result<Vec<GradOpSpec>> {
        let mut specs = Vec::with_capacity(2);
        for index in 0..2 {
            let spec = match self.kind {
                BinaryKind::Add | BinaryKind::Sub => {
                    let mut spec = GradOpSpec::new(opids::reduce_sum_to_shape())
                        .input(0, GradInput::GradOut(0))
                        .attr("shape", Self::reduce_to(cx, index)?);
                    if self.kind == BinaryKind::Sub && index == 1 {
                        spec = spec.attr("scale", Attribute::Float(-1.0));
                    }
                    spec
                }
                BinaryKind::Mul => GradOpSpec::new(OperatorIdentifier::kiln(types::MUL_ARG_GRAD))
                    .input(0, GradInput::GradOut(0))
                    .input(1, GradInput::FwdIn(1 - index))
                    .attr("shape", Self::reduce_to(cx, index)?),
            };
            specs.push(spec.output(0, index));
        }
        Ok(specs)
    }

    fn const_fold(&self, _op: &Op, inputs: &[ConstValue<'_>]) -> Result<Option<Vec<f64>>> {
        let [lhs, rhs] = inputs else {
            return Ok(None);
        };
        let out = match self.kind {
            BinaryKind::Add => fold::binary(lhs, rhs, |a, b| a + b)?,
            BinaryKind::Sub => fold::binary(lhs, rhs, |a, b| a - b)?,
            BinaryKind::Mul => fold::binary(lhs, rhs, |a, b| a * b)?,
        };
        Ok(Some(out))
    }

    fn rts_indices(&self, _op: &Op) -> Vec<(Vec<InIndex>, Vec<OutIndex>)> {
        vec![(vec![0, 1], vec![0])]
    }
}

pub(super) fn register(registry: &mut OpRegistry) {
    for kind in [
        UnaryKind::Relu,
        UnaryKind::Neg,
        UnaryKind::Exp,
        UnaryKind::Sigmoid,
        UnaryKind::Scale,
        UnaryKind::Identity,
        UnaryKind::Cast,
    ] {
        registry.register(kind.outplace_id(), UnaryElementwise::outplace(kind));
        if let Some(inplace) = kind.inplace_id() {
            registry.register(inplace, UnaryElementwise::inplace(kind));
        }
    }

    registry.register(opids::add(), BinaryElementwise::outplace(BinaryKind::Add));
    registry.register(
        opids::add_lhs_inplace(),
        BinaryElementwise::inplace(BinaryKind::Add, InplaceSide::Lhs),
    );
    registry.register(
        opids::add_rhs_inplace(),
        BinaryElementwise::inplace(BinaryKind::Add, InplaceSide::Rhs),
    );
    registry.register(opids::sub(), BinaryElementwise::outplace(BinaryKind::Sub));
    registry.register(opids::mul(), BinaryElementwise::outplace(BinaryKind::Mul));
    registry.register(
        opids::mul_lhs_inplace(),
        BinaryElementwise::inplace(BinaryKind::Mul, InplaceSide::Lhs),
    );
    registry.register(
        opids::mul_rhs_inplace(),
        BinaryElementwise::inplace(BinaryKind::Mul, InplaceSide::Rhs),
    );
}
