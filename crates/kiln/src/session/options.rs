use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum VirtualGraphMode {
    #[default]
    Off,
    /// Placement comes from the model's annotations.
    Manual,
    /// Placement is computed by sharding the schedule.
    Auto,
    ExecutionPhases,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RecomputationType {
    #[default]
    None,
    Standard,
    NormOnly,
    Pipeline,
    RecomputeAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BatchSerializationContext {
    /// Serialize the forward pass before autodiff.
    #[default]
    Fwd,
    /// Serialize forward and backward after autodiff.
    Bwd,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionPhaseSettings {
    pub phases: i64,
    pub stages: i64,
}

impl Default for ExecutionPhaseSettings {
    fn default() -> Self {
        Self {
            phases: 1,
            stages: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSerializationSettings {
    pub factor: usize,
    pub transform_context: BatchSerializationContext,
}

impl Default for BatchSerializationSettings {
    fn default() -> Self {
        Self {
            factor: 0,
            transform_context: BatchSerializationContext::Fwd,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicatedGraphSettings {
    pub enable_replicated_graphs: bool,
    pub replicated_graph_count: i64,
    pub enable_distributed_replicated_graphs: bool,
    pub global_replication_factor: i64,
    pub global_replica_offset: i64,
}

impl Default for ReplicatedGraphSettings {
    fn default() -> Self {
        Self {
            enable_replicated_graphs: false,
            replicated_graph_count: 1,
            enable_distributed_replicated_graphs: false,
            global_replication_factor: 1,
            global_replica_offset: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccumulationSettings {
    pub enable_gradient_accumulation: bool,
    pub accumulation_factor: i64,
}

impl Default for AccumulationSettings {
    fn default() -> Self {
        Self {
            enable_gradient_accumulation: false,
            accumulation_factor: 1,
        }
    }
}

/// User options consulted by `prepare`. Read-only for the duration of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    pub virtual_graph_mode: VirtualGraphMode,
    pub enable_pipelining: bool,
    pub execution_phase_settings: ExecutionPhaseSettings,
    pub batch_serialization: BatchSerializationSettings,
    pub recomputation_type: RecomputationType,
    pub explicit_recomputation: bool,
    pub replication: ReplicatedGraphSettings,
    pub accumulation: AccumulationSettings,
    pub enable_engine_caching: bool,
    /// Replace repeated op sequences of the main graph by calls to one subgraph.
    pub enable_outlining: bool,
    /// Let the scheduler order ops by execution phase first.
    pub respect_execution_phases: bool,
}

impl SessionOptions {
    pub fn virtual_graphs_enabled(&self) -> bool {
        self.virtual_graph_mode != VirtualGraphMode::Off
    }

    pub fn execution_phases_enabled(&self) -> bool {
        self.virtual_graph_mode == VirtualGraphMode::ExecutionPhases
            && self.execution_phase_settings.phases > 1
    }

    pub fn batch_serialization_enabled(&self) -> bool {
        self.batch_serialization.factor > 1
    }

    /// Combined replication factor across every process.
    pub fn global_replication_factor(&self) -> i64 {
        if self.replication.enable_distributed_replicated_graphs {
            self.replication.global_replication_factor
        } else if self.replication.enable_replicated_graphs {
            self.replication.replicated_graph_count
        } else {
            1
        }
    }

    /// Rejects contradictory combinations that do not need the model to detect.
    pub fn validate(&self) -> Result<()> {
        if self.recomputation_type == RecomputationType::Pipeline && !self.enable_pipelining {
            return Err(Error::config(
                "recomputation type Pipeline requires pipelining to be enabled",
            ));
        }
        if self.accumulation.enable_gradient_accumulation && self.accumulation.accumulation_factor < 1 {
            return Err(Error::config(format!(
                "gradient accumulation factor must be at least 1, got {}",
                self.accumulation.accumulation_factor
            )));
        }
        if self.explicit_recomputation && self.enable_pipelining {
            return Err(Error::unsupported(
                "explicit recomputation together with pipelining",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn partial_json_fills_defaults() {
        let options: SessionOptions = serde_json::from_str(
            r#"{"virtual_graph_mode": "Auto", "batch_serialization": {"factor": 4}}"#,
        )
        .unwrap();
        assert!(options.virtual_graphs_enabled());
        assert_eq!(options.batch_serialization.factor, 4);
        assert_eq!(
            options.batch_serialization.transform_context,
            BatchSerializationContext::Fwd
        );
        assert_eq!(options.execution_phase_settings.phases, 1);
    }

    #[test]
    fn pipeline_recomputation_needs_pipelining() {
        let options = SessionOptions {
            recomputation_type: RecomputationType::Pipeline,
            ..SessionOptions::default()
        };
        assert_eq!(options.validate().unwrap_err().kind(), ErrorKind::Configuration);
    }
}
