use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Input slot of an op.
pub type InIndex = usize;
/// Output slot of an op.
pub type OutIndex = usize;
/// Compute partition an op is placed on.
pub type VGraphId = i64;
pub type PipelineStage = i64;
pub type ExecutionPhase = i64;
pub type BatchSerializedPhase = i64;

/// Identifier of an op, unique across every graph of one `Ir`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId(pub u64);

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}", self.0)
    }
}

/// Globally namespaced tensor name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TensorId(String);

impl TensorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_gradient(&self) -> bool {
        self.0.starts_with(reserved::GRADIENT)
    }

    /// Name of the gradient tensor of this tensor.
    pub fn grad(&self) -> TensorId {
        TensorId(format!("{}{}", reserved::GRADIENT, self.0))
    }

    /// Name of the forward tensor a gradient tensor belongs to.
    pub fn non_grad(&self) -> Option<TensorId> {
        self.0
            .strip_prefix(reserved::GRADIENT)
            .map(|rest| TensorId(rest.to_string()))
    }

    pub fn updated(&self) -> TensorId {
        TensorId(format!("{}{}", reserved::UPDATED_VAR, self.0))
    }

    /// Partial gradient `k` of this tensor's gradient.
    pub fn partial_grad(&self, k: usize) -> TensorId {
        TensorId(format!("{}{}__{}", reserved::GRADIENT, self.0, k))
    }

    pub fn with_suffix(&self, suffix: impl fmt::Display) -> TensorId {
        TensorId(format!("{}{}", self.0, suffix))
    }
}

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TensorId {
    fn from(value: &str) -> Self {
        TensorId(value.to_string())
    }
}

impl From<String> for TensorId {
    fn from(value: String) -> Self {
        TensorId(value)
    }
}

impl Borrow<str> for TensorId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Identifier of a graph. The main graph always exists.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GraphId(String);

impl GraphId {
    pub const MAIN: &'static str = "main";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn main() -> Self {
        Self(Self::MAIN.to_string())
    }

    pub fn is_main(&self) -> bool {
        self.0 == Self::MAIN
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Tensor names inside a subgraph are prefixed with the graph id so that
    /// they stay unique across the whole `Ir`.
    pub fn scoped(&self, name: &str) -> TensorId {
        if self.is_main() {
            TensorId::new(name)
        } else {
            TensorId::new(format!("{}/{}", self.0, name))
        }
    }
}

impl fmt::Display for GraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GraphId {
    fn from(value: &str) -> Self {
        GraphId(value.to_string())
    }
}

/// Name prefixes owned by the compiler. User tensors must not use them.
pub mod reserved {
    pub const GRADIENT: &str = "Gradient___";
    pub const UPDATED_VAR: &str = "Updated___";
    pub const ACCUMULATE: &str = "Accl___";
    pub const LEARNING_RATE: &str = "learningRate___";
    pub const RECOMPUTE: &str = "Recompute___";
    pub const BATCH_SERIAL: &str = "BatchSerial___";
    pub const STASH: &str = "Stash___";
    pub const RESTORED: &str = "Restored___";

    pub const ALL: &[&str] = &[
        GRADIENT,
        UPDATED_VAR,
        ACCUMULATE,
        LEARNING_RATE,
        RECOMPUTE,
        BATCH_SERIAL,
        STASH,
        RESTORED,
    ];

    pub fn prefix_of(name: &str) -> Option<&'static str> {
        ALL.iter().copied().find(|prefix| name.starts_with(prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gradient_names_round_trip() {
        let id = TensorId::from("act");
        let grad = id.grad();
        assert_eq!(grad.as_str(), "Gradient___act");
        assert!(grad.is_gradient());
        assert_eq!(grad.non_grad(), Some(id));
    }

    #[test]
    fn subgraph_scoping_leaves_main_untouched() {
        assert_eq!(GraphId::main().scoped("x").as_str(), "x");
        assert_eq!(GraphId::from("body").scoped("x").as_str(), "body/x");
    }

    #[test]
    fn reserved_prefix_lookup() {
        assert_eq!(reserved::prefix_of("Updated___w"), Some(reserved::UPDATED_VAR));
        assert_eq!(reserved::prefix_of("weights"), None);
    }
}
