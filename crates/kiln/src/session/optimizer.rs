use serde::{Deserialize, Serialize};

/// Optimizer producing one variable update per trainable tensor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Optimizer {
    /// Learning rate baked into the update ops.
    ConstSgd { learning_rate: f64 },
    /// Learning rate fed as a stream so it can change between steps.
    Sgd { learning_rate: f64 },
}

impl Optimizer {
    pub fn learning_rate(&self) -> f64 {
        match self {
            Optimizer::ConstSgd { learning_rate } | Optimizer::Sgd { learning_rate } => {
                *learning_rate
            }
        }
    }
}
