use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::ir::graph::Graph;
use crate::ir::ids::{OpId, TensorId};

/// Aliasing an op introduces (or would introduce) between its tensors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub op: OpId,
    /// `(input, output)` tensor pairs sharing storage.
    pub aliases: Vec<(TensorId, TensorId)>,
    /// Tensors written in place.
    pub modifies: Vec<TensorId>,
}

/// Why a proposal could not be opened. Never an error: callers skip the candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The op already has aliases open in the model.
    AlreadyOpen(OpId),
    /// An input is aliased to itself.
    SelfAlias(TensorId),
    /// The output already shares storage with the input it would alias.
    AlreadyAliased { input: TensorId, output: TensorId },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::AlreadyOpen(op) => write!(f, "{op} already has open aliases"),
            Rejection::SelfAlias(tensor) => write!(f, "{tensor} would alias itself"),
            Rejection::AlreadyAliased { input, output } => {
                write!(f, "{output} already aliases {input}")
            }
        }
    }
}

/// An opened proposal. Must be closed with [`AliasModel::commit`] or
/// [`AliasModel::rollback`].
#[must_use]
#[derive(Debug)]
pub struct Transaction {
    op: OpId,
    aliases: Vec<(TensorId, TensorId)>,
    modifies: Vec<TensorId>,
}

impl Transaction {
    pub fn op(&self) -> OpId {
        self.op
    }
}

/// Shadow record of which tensors share storage and which ops write them.
///
/// Alias edges are undirected for closure queries; each edge is reference
/// counted so removing what a transaction added restores the exact prior state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AliasModel {
    gates: BTreeMap<OpId, Vec<(TensorId, TensorId)>>,
    writes: BTreeMap<OpId, BTreeSet<TensorId>>,
    adjacency: BTreeMap<TensorId, BTreeMap<TensorId, usize>>,
}

impl AliasModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirrors the aliasing and modification declared by every op of `graph`.
    pub fn from_graph(graph: &Graph) -> Self {
        let mut model = Self::new();
        for op in graph.ops() {
            let mut aliases = Vec::new();
            for (input, in_tensor) in op.input.iter() {
                for (output, out_tensor) in op.output.iter() {
                    if op.aliases(input, output) && in_tensor != out_tensor {
                        aliases.push((in_tensor.clone(), out_tensor.clone()));
                    }
                }
            }
            let modifies: Vec<TensorId> = op
                .modified_indices()
                .into_iter()
                .filter_map(|index| op.input.tensor(index).cloned())
                .collect();
            model.insert(op.id, &aliases, &modifies);
        }
        model
    }

    fn insert(&mut self, op: OpId, aliases: &[(TensorId, TensorId)], modifies: &[TensorId]) {
        if !aliases.is_empty() {
            self.gates.entry(op).or_default().extend(aliases.iter().cloned());
        }
        for (a, b) in aliases {
            *self
                .adjacency
                .entry(a.clone())
                .or_default()
                .entry(b.clone())
                .or_insert(0) += 1;
            *self
                .adjacency
                .entry(b.clone())
                .or_default()
                .entry(a.clone())
                .or_insert(0) += 1;
        }
        if !modifies.is_empty() {
            self.writes
                .entry(op)
                .or_default()
                .extend(modifies.iter().cloned());
        }
    }

    fn remove_edge(&mut self, a: &TensorId, b: &TensorId) {
        if let Some(neighbours) = self.adjacency.get_mut(a) {
            if let Some(count) = neighbours.get_mut(b) {
                *count -= 1;
                if *count == 0 {
                    neighbours.remove(b);
                }
            }
            if neighbours.is_empty() {
                self.adjacency.remove(a);
            }
        }
    }

    /// Whether `op` has alias edges in the model.
    pub fn is_open(&self, op: OpId) -> bool {
        self.gates.contains_key(&op)
    }

    /// Every tensor sharing storage with `tensor`, including itself.
    pub fn aliases(&self, tensor: &TensorId) -> BTreeSet<TensorId> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![tensor.clone()];
        while let Some(current) = stack.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(neighbours) = self.adjacency.get(&current) {
                stack.extend(
                    neighbours
                        .keys()
                        .filter(|neighbour| !seen.contains(*neighbour))
                        .cloned(),
                );
            }
        }
        seen
    }

    pub fn are_aliased(&self, a: &TensorId, b: &TensorId) -> bool {
        a == b || self.aliases(a).contains(b)
    }

    /// Ops writing any of `tensors`.
    pub fn writers_of(&self, tensors: &BTreeSet<TensorId>) -> BTreeSet<OpId> {
        self.writes
            .iter()
            .filter(|(_, written)| written.iter().any(|tensor| tensors.contains(tensor)))
            .map(|(op, _)| *op)
            .collect()
    }

    /// Opens a proposal. The model reflects it until the returned transaction
    /// is committed or rolled back.
    pub fn propose(&mut self, proposal: Proposal) -> Result<Transaction, Rejection> {
        if self.is_open(proposal.op) {
            return Err(Rejection::AlreadyOpen(proposal.op));
        }
        for (input, output) in &proposal.aliases {
            if input == output {
                return Err(Rejection::SelfAlias(input.clone()));
            }
            if self.are_aliased(input, output) {
                return Err(Rejection::AlreadyAliased {
                    input: input.clone(),
                    output: output.clone(),
                });
            }
        }
        let modifies: Vec<TensorId> = proposal
            .modifies
            .into_iter()
            .filter(|tensor| {
                !self
                    .writes
                    .get(&proposal.op)
                    .is_some_and(|written| written.contains(tensor))
            })
            .collect();
        self.insert(proposal.op, &proposal.aliases, &modifies);
        Ok(Transaction {
            op: proposal.op,
            aliases: proposal.aliases,
            modifies,
        })
    }

    /// Keeps the proposal.
    pub fn commit(&mut self, transaction: Transaction) {
        let _ = transaction;
    }

    /// Removes exactly what the proposal added.
    pub fn rollback(&mut self, transaction: Transaction) {
        let Transaction {
            op,
            aliases,
            modifies,
        } = transaction;
        for (a, b) in &aliases {
            self.remove_edge(a, b);
            self.remove_edge(b, a);
        }
        if let Some(gates) = self.gates.get_mut(&op) {
            for alias in &aliases {
                if let Some(position) = gates.iter().position(|gate| gate == alias) {
                    gates.remove(position);
                }
            }
            if gates.is_empty() {
                self.gates.remove(&op);
            }
        }
        if let Some(written) = self.writes.get_mut(&op) {
            for tensor in &modifies {
                written.remove(tensor);
            }
            if written.is_empty() {
                self.writes.remove(&op);
            }
        }
    }

    /// Moves everything recorded for `from` onto `to` after the op was replaced.
    pub fn rename_op(&mut self, from: OpId, to: OpId) {
        if let Some(gates) = self.gates.remove(&from) {
            self.gates.entry(to).or_default().extend(gates);
        }
        if let Some(written) = self.writes.remove(&from) {
            self.writes.entry(to).or_default().extend(written);
        }
    }
}
