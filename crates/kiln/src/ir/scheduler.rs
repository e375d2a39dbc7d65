//! Deterministic topological scheduling of op sets under constraints.
//!
//! The scheduler is a Kahn traversal whose ready set is ordered by a
//! [`ReadyKey`]. In the fast mode the key is the op id alone; in the optimal
//! mode ops are ordered by execution phase, then schedule priority
//! (descending), then batch-serialized phase, then id. Tied constraints pull
//! the tied successor directly behind its predecessor whenever it is ready.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};
use crate::ir::ids::OpId;

/// Extra constraints: every op in the value list must run before the key op.
pub type OpsBeforeKey = BTreeMap<OpId, Vec<OpId>>;

/// Whether the scheduler should honour priorities or just produce a valid order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequireOptimal {
    Yes,
    No,
}

/// Per-op inputs of the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleNode {
    pub id: OpId,
    pub priority: f64,
    pub execution_phase: Option<i64>,
    pub batch_serialized_phase: Option<i64>,
}

impl ScheduleNode {
    pub fn plain(id: OpId) -> Self {
        Self {
            id,
            priority: 0.0,
            execution_phase: None,
            batch_serialized_phase: None,
        }
    }
}

/// Directed constraint graph handed to [`schedule`].
#[derive(Debug, Clone, Default)]
pub struct ScheduleProblem {
    nodes: BTreeMap<OpId, ScheduleNode>,
    afters: BTreeMap<OpId, BTreeSet<OpId>>,
    tied_afters: BTreeMap<OpId, BTreeSet<OpId>>,
}

impl ScheduleProblem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: ScheduleNode) {
        self.afters.entry(node.id).or_default();
        self.nodes.insert(node.id, node);
    }

    /// `before` must run before `after`. Edges touching unknown ops are ignored,
    /// which lets callers pass constraints mentioning ops of other graphs.
    pub fn add_edge(&mut self, before: OpId, after: OpId) {
        if before == after || !self.nodes.contains_key(&before) || !self.nodes.contains_key(&after)
        {
            return;
        }
        self.afters.entry(before).or_default().insert(after);
    }

    pub fn add_tied_edge(&mut self, before: OpId, after: OpId) {
        self.add_edge(before, after);
        if self.nodes.contains_key(&before) && self.nodes.contains_key(&after) && before != after {
            self.tied_afters.entry(before).or_default().insert(after);
        }
    }

    pub fn add_ops_before_key(&mut self, extra: &OpsBeforeKey) {
        for (after, befores) in extra {
            for before in befores {
                self.add_edge(*before, *after);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// `true` iff the constraint graph is acyclic.
    pub fn is_schedulable(&self) -> bool {
        self.solve(RequireOptimal::No).is_ok()
    }

    pub fn solve(&self, mode: RequireOptimal) -> Result<Vec<OpId>> {
        let mut in_degree: BTreeMap<OpId, usize> = self.nodes.keys().map(|id| (*id, 0)).collect();
        for afters in self.afters.values() {
            for after in afters {
                if let Some(degree) = in_degree.get_mut(after) {
                    *degree += 1;
                }
            }
        }

        let key_of = |id: OpId| -> ReadyKey {
            match (mode, self.nodes.get(&id)) {
                (RequireOptimal::Yes, Some(node)) => ReadyKey {
                    execution_phase: node.execution_phase.unwrap_or(i64::MIN),
                    priority: node.priority,
                    batch_serialized_phase: node.batch_serialized_phase.unwrap_or(i64::MIN),
                    id,
                },
                _ => ReadyKey::by_id(id),
            }
        };

        let mut ready: BTreeSet<ReadyKey> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| key_of(*id))
            .collect();
        let mut forced: Vec<OpId> = Vec::new();
        let mut order = Vec::with_capacity(self.nodes.len());

        loop {
            let next = match forced.pop() {
                Some(id) => {
                    ready.remove(&key_of(id));
                    id
                }
                None => match ready.pop_first() {
                    Some(key) => key.id,
                    None => break,
                },
            };
            order.push(next);

            let mut newly_ready = Vec::new();
            if let Some(afters) = self.afters.get(&next) {
                for after in afters {
                    if let Some(degree) = in_degree.get_mut(after) {
                        *degree -= 1;
                        if *degree == 0 {
                            newly_ready.push(*after);
                        }
                    }
                }
            }
            for id in &newly_ready {
                ready.insert(key_of(*id));
            }
            if let Some(tied) = self.tied_afters.get(&next) {
                // Highest id pushed first so the lowest tied op is popped first.
                for id in tied.iter().rev() {
                    if newly_ready.contains(id) {
                        forced.push(*id);
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            let scheduled: BTreeSet<OpId> = order.iter().copied().collect();
            let stuck: Vec<String> = self
                .nodes
                .keys()
                .filter(|id| !scheduled.contains(id))
                .take(8)
                .map(|id| id.to_string())
                .collect();
            return Err(Error::unschedulable(format!(
                "cycle in op constraints; {} of {} ops could not be scheduled (first: {})",
                self.nodes.len() - order.len(),
                self.nodes.len(),
                stuck.join(", ")
            )));
        }
        Ok(order)
    }
}

#[derive(Debug, Clone, Copy)]
struct ReadyKey {
    execution_phase: i64,
    priority: f64,
    batch_serialized_phase: i64,
    id: OpId,
}

impl ReadyKey {
    fn by_id(id: OpId) -> Self {
        Self {
            execution_phase: 0,
            priority: 0.0,
            batch_serialized_phase: 0,
            id,
        }
    }
}

impl PartialEq for ReadyKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ReadyKey {}

impl PartialOrd for ReadyKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.execution_phase
            .cmp(&other.execution_phase)
            .then_with(|| other.priority.total_cmp(&self.priority))
            .then_with(|| self.batch_serialized_phase.cmp(&other.batch_serialized_phase))
            .then_with(|| self.id.cmp(&other.id))
    }
}
