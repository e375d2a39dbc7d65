//! Batch serialization: run batch-parallel ops on `factor` slices of the batch
//! one after another instead of on the whole batch at once.
//!
//! Phase 1 slices batch streams along axis 0, clones every serializable op
//! once per slice and concatenates the slices back where an unserialized
//! reader needs the whole tensor. Phase 2 orders the slices so that slice `k`
//! finishes before slice `k + 1` starts.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::error::Result;
use crate::ir::graph::Graph;
use crate::ir::ids::{reserved, BatchSerializedPhase, GraphId, OpId, TensorId};
use crate::ir::op::{Attribute, Attributes, Op, Settings};
use crate::ir::scheduler::{OpsBeforeKey, RequireOptimal};
use crate::ir::tensor::TensorType;
use crate::ops::opids;
use crate::session::Ir;
use crate::transform::{PassResult, Transform};

#[derive(Debug, Clone, Copy)]
pub struct BatchSerialize {
    phase: u8,
}

impl BatchSerialize {
    pub fn new(phase: u8) -> Self {
        Self { phase }
    }

    pub fn phase(&self) -> u8 {
        self.phase
    }
}

impl Transform for BatchSerialize {
    fn name(&self) -> &'static str {
        match self.phase {
            1 => "BatchSerialize1",
            _ => "BatchSerialize2",
        }
    }

    fn apply(&self, ir: &mut Ir, graph: &GraphId) -> Result<PassResult> {
        let factor = ir.options().batch_serialization.factor;
        if factor <= 1 {
            return Ok(PassResult::unchanged());
        }
        let protected = ir.protected_tensors();
        let graph = ir.graph_mut(graph)?;
        let rewrites = match self.phase {
            1 => serialize(graph, factor, &protected)?,
            _ => order_phases(graph, factor)?,
        };
        Ok(PassResult {
            changed: rewrites > 0,
            iterations: 1,
            rewrites_applied: rewrites,
            erased_ops: 0,
        })
    }
}

fn part_id(tensor: &TensorId, k: usize) -> TensorId {
    TensorId::new(format!("{}{tensor}__{k}", reserved::BATCH_SERIAL))
}

struct Serializer<'g> {
    graph: &'g mut Graph,
    factor: usize,
    /// Whole tensor to its per-slice parts.
    parts: BTreeMap<TensorId, Vec<TensorId>>,
}

impl<'g> Serializer<'g> {
    /// Parts of `tensor`, slicing a batch stream on first use.
    fn parts_of(&mut self, tensor: &TensorId, reader: &Op) -> Result<Option<Vec<TensorId>>> {
        if let Some(parts) = self.parts.get(tensor) {
            return Ok(Some(parts.clone()));
        }
        let node = self.graph.tensor(tensor)?;
        if node.tensor_type != TensorType::Stream {
            return Ok(None);
        }
        let Some(batch) = node.info.dim(0) else {
            return Ok(None);
        };
        let factor = self.factor as i64;
        if batch < factor || batch % factor != 0 {
            warn!(target: "kiln::transform", tensor = %tensor, batch, factor, "batch not divisible by the serialization factor");
            return Ok(None);
        }
        let step = batch / factor;
        let mut parts = Vec::with_capacity(self.factor);
        for k in 0..self.factor {
            let part = part_id(tensor, k);
            let mut settings = reader.settings.derived(format!("{tensor}_slice{k}"));
            settings.batch_serialized_phase = Some(k as BatchSerializedPhase);
            settings.recompute_type = Default::default();
            let mut attrs = Attributes::new();
            attrs.insert("starts".to_string(), Attribute::Ints(vec![k as i64 * step]));
            attrs.insert("ends".to_string(), Attribute::Ints(vec![(k as i64 + 1) * step]));
            attrs.insert("axes".to_string(), Attribute::Ints(vec![0]));
            self.graph.create_connected_op(
                &opids::slice(),
                settings,
                attrs,
                &[(0, tensor.clone())],
                &[(0, part.clone())],
            )?;
            parts.push(part);
        }
        self.parts.insert(tensor.clone(), parts.clone());
        Ok(Some(parts))
    }

    /// Per-input parts when `op` can run slice by slice, `None` otherwise.
    fn plan(&mut self, op: &Op) -> Result<Option<BTreeMap<usize, Vec<TensorId>>>> {
        let flags = op.flags();
        if !flags.batch_serializable || op.has_side_effect() || op.modifies_any() || op.output.n() != 1 {
            return Ok(None);
        }
        let out_info = self.graph.info(op.out_id(0)?)?.clone();
        let mut serialized = BTreeMap::new();
        let mut whole = Vec::new();
        for (index, tensor) in op.input.iter() {
            match self.parts_of(tensor, op)? {
                Some(parts) => {
                    serialized.insert(index, parts);
                }
                None => whole.push((index, tensor.clone())),
            }
        }
        if serialized.is_empty() {
            return Ok(None);
        }
        for index in serialized.keys() {
            let info = self.graph.info(op.in_id(*index)?)?;
            if info.dim(0) != out_info.dim(0) {
                return Ok(None);
            }
        }
        for (index, tensor) in whole {
            let info = self.graph.info(&tensor)?;
            let broadcasts = info.rank() < out_info.rank() || info.dim(0) == Some(1);
            let contracted = flags.heavy && index == 1 && serialized.contains_key(&0);
            if !broadcasts && !contracted {
                return Ok(None);
            }
        }
        Ok(Some(serialized))
    }

    fn serialize_op(&mut self, op_id: OpId) -> Result<bool> {
        let op = self.graph.op(op_id)?.clone();
        let Some(serialized) = self.plan(&op)? else {
            return Ok(false);
        };
        let out = op.out_id(0)?.clone();
        let mut out_parts = Vec::with_capacity(self.factor);
        for k in 0..self.factor {
            let mut settings: Settings = op.settings.derived(format!("{}_bs{k}", op.settings.name));
            settings.batch_serialized_phase = Some(k as BatchSerializedPhase);
            let clone = self.graph.create_op(&op.opid, settings, op.attrs.clone())?;
            for (index, tensor) in op.input.iter() {
                let source = match serialized.get(&index) {
                    Some(parts) => &parts[k],
                    None => tensor,
                };
                self.graph.connect_in(clone, index, source)?;
            }
            let part = part_id(&out, k);
            self.graph.create_and_connect_out(clone, 0, part.clone())?;
            self.graph.setup_op(clone)?;
            out_parts.push(part);
        }
        self.graph.erase_op(op_id)?;
        self.parts.insert(out, out_parts);
        debug!(target: "kiln::transform", op = %op.debug_name(), factor = self.factor, "serialized");
        Ok(true)
    }

    /// Rebuilds whole tensors that an unserialized reader, an anchor or a
    /// graph output still needs; drops the rest.
    fn concat_back(&mut self, protected: &BTreeSet<TensorId>) -> Result<()> {
        let parts = std::mem::take(&mut self.parts);
        for (tensor, parts) in parts {
            let node = self.graph.tensor(&tensor)?;
            if node.has_producer() || node.tensor_type != TensorType::ActGrad {
                continue;
            }
            let needed = !node.consumers.is_empty()
                || protected.contains(&tensor)
                || self.graph.is_output(&tensor)
                || self.graph.loss() == Some(&tensor);
            if !needed {
                self.graph.tensors_mut().remove(&tensor)?;
                continue;
            }
            let template = self
                .graph
                .producer(&parts[0])?
                .map(|op| op.settings.derived(format!("{tensor}_concat")))
                .unwrap_or_else(|| Settings::new(self.graph.id().clone(), format!("{tensor}_concat")));
            let mut settings = template;
            settings.batch_serialized_phase = None;
            let mut attrs = Attributes::new();
            attrs.insert("axis".to_string(), Attribute::Int(0));
            let concat = self.graph.create_op(&opids::concat(), settings, attrs)?;
            for (index, part) in parts.iter().enumerate() {
                self.graph.connect_in(concat, index, part)?;
            }
            self.graph.connect_out(concat, 0, &tensor)?;
            self.graph.setup_op(concat)?;
        }
        Ok(())
    }
}

pub(crate) fn serialize(graph: &mut Graph, factor: usize, protected: &BTreeSet<TensorId>) -> Result<usize> {
    let schedule = graph.op_schedule(&OpsBeforeKey::new(), RequireOptimal::No)?;
    let mut serializer = Serializer {
        graph,
        factor,
        parts: BTreeMap::new(),
    };
    let mut count = 0;
    for op_id in schedule {
        if serializer.serialize_op(op_id)? {
            count += 1;
        }
    }
    serializer.concat_back(protected)?;
    Ok(count)
}

/// Orders the slices: the last op of slice `k` runs before the first op of
/// slice `k + 1`.
pub(crate) fn order_phases(graph: &mut Graph, factor: usize) -> Result<usize> {
    let schedule = graph.op_schedule(&OpsBeforeKey::new(), RequireOptimal::Yes)?;
    let mut by_phase: BTreeMap<BatchSerializedPhase, Vec<OpId>> = BTreeMap::new();
    for op_id in schedule {
        if let Some(phase) = graph.op(op_id)?.settings.batch_serialized_phase {
            by_phase.entry(phase).or_default().push(op_id);
        }
    }
    let mut added = 0;
    for k in 0..factor.saturating_sub(1) as BatchSerializedPhase {
        let (Some(current), Some(next)) = (by_phase.get(&k), by_phase.get(&(k + 1))) else {
            continue;
        };
        let (Some(&last), Some(&first)) = (current.last(), next.first()) else {
            continue;
        };
        if graph.topo_cons().contains(last, first) {
            continue;
        }
        let mut extra = OpsBeforeKey::new();
        extra.insert(first, vec![last]);
        if !graph.is_schedulable(&extra) {
            debug!(target: "kiln::transform", phase = k, "cannot order batch slices");
            continue;
        }
        graph.topo_cons_mut().insert(last, first, false)?;
        added += 1;
    }
    Ok(added)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    use super::*;
    use crate::ir::tensor_info::{DataType, TensorInfo};
    use crate::ops::{default_registry, types};

    #[test]
    fn matmul_is_split_and_concatenated_for_the_output() {
        let mut g = Graph::new(GraphId::main(), default_registry(), Arc::new(AtomicU64::new(0)));
        g.tensors_mut()
            .add_stream(TensorId::from("x"), TensorInfo::new(DataType::Float, vec![4, 3]))
            .unwrap();
        g.tensors_mut()
            .add_var_init(
                TensorId::from("w"),
                TensorInfo::new(DataType::Float, vec![3, 2]),
                vec![0.0; 6],
            )
            .unwrap();
        g.create_connected_op(
            &opids::matmul(),
            Settings::new(GraphId::main(), "mm"),
            Attributes::new(),
            &[(0, TensorId::from("x")), (1, TensorId::from("w"))],
            &[(0, TensorId::from("y"))],
        )
        .unwrap();
        g.create_connected_op(
            &opids::relu(),
            Settings::new(GraphId::main(), "relu"),
            Attributes::new(),
            &[(0, TensorId::from("y"))],
            &[(0, TensorId::from("z"))],
        )
        .unwrap();
        g.mark_as_output(&TensorId::from("z")).unwrap();

        assert_eq!(serialize(&mut g, 2, &BTreeSet::new()).unwrap(), 2);
        let matmuls = g.ops().filter(|op| op.is(types::MATMUL)).count();
        let relus = g.ops().filter(|op| op.is(types::RELU)).count();
        assert_eq!((matmuls, relus), (2, 2));
        assert!(!g.tensors().contains(&TensorId::from("y")));
        let z = g.producer(&TensorId::from("z")).unwrap().unwrap();
        assert!(z.is(types::CONCAT));
        assert_eq!(g.info(&TensorId::from("z")).unwrap().shape, vec![4, 2]);

        assert_eq!(order_phases(&mut g, 2).unwrap(), 1);
        let schedule = g.op_schedule(&OpsBeforeKey::new(), RequireOptimal::No).unwrap();
        let phases: Vec<BatchSerializedPhase> = schedule
            .iter()
            .filter_map(|id| g.op(*id).unwrap().settings.batch_serialized_phase)
            .collect();
        let first_one = phases.iter().position(|p| *p == 1).unwrap();
        assert!(phases[first_one..].iter().all(|p| *p == 1));
    }
}
