use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::ir::ids::OpId;

/// Extra "must run before" constraints between ops of one graph.
///
/// A tied constraint additionally asks the scheduler to place the two ops
/// next to each other.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TopoCons {
    /// `after -> {before -> tied}`
    befores: BTreeMap<OpId, BTreeMap<OpId, bool>>,
    /// `before -> {after -> tied}`
    afters: BTreeMap<OpId, BTreeMap<OpId, bool>>,
}

impl TopoCons {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `before` must run before `after`. Re-inserting an existing
    /// constraint only ever upgrades it to tied.
    pub fn insert(&mut self, before: OpId, after: OpId, tied: bool) -> Result<()> {
        if before == after {
            return Err(Error::internal(format!(
                "cannot constrain {before} to run before itself"
            )));
        }
        let slot = self.afters.entry(before).or_default().entry(after).or_insert(false);
        *slot |= tied;
        let tied = *slot;
        self.befores.entry(after).or_default().insert(before, tied);
        Ok(())
    }

    pub fn contains(&self, before: OpId, after: OpId) -> bool {
        self.afters
            .get(&before)
            .map(|afters| afters.contains_key(&after))
            .unwrap_or(false)
    }

    /// Ops that must run before `op`.
    pub fn befores(&self, op: OpId) -> Vec<OpId> {
        self.befores
            .get(&op)
            .map(|befores| befores.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Ops that must run after `op`.
    pub fn afters(&self, op: OpId) -> Vec<OpId> {
        self.afters
            .get(&op)
            .map(|afters| afters.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn tied_befores(&self, op: OpId) -> Vec<OpId> {
        self.befores
            .get(&op)
            .map(|befores| {
                befores
                    .iter()
                    .filter(|(_, tied)| **tied)
                    .map(|(op, _)| *op)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn tied_afters(&self, op: OpId) -> Vec<OpId> {
        self.afters
            .get(&op)
            .map(|afters| {
                afters
                    .iter()
                    .filter(|(_, tied)| **tied)
                    .map(|(op, _)| *op)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_constraints(&self, op: OpId) -> bool {
        self.befores.contains_key(&op) || self.afters.contains_key(&op)
    }

    /// Drops one constraint if present.
    pub fn remove_pair(&mut self, before: OpId, after: OpId) {
        if let Some(afters) = self.afters.get_mut(&before) {
            afters.remove(&after);
            if afters.is_empty() {
                self.afters.remove(&before);
            }
        }
        if let Some(befores) = self.befores.get_mut(&after) {
            befores.remove(&before);
            if befores.is_empty() {
                self.befores.remove(&after);
            }
        }
    }

    /// Removes every constraint mentioning `op`.
    pub fn remove(&mut self, op: OpId) {
        for after in self.afters(op) {
            self.remove_pair(op, after);
        }
        for before in self.befores(op) {
            self.remove_pair(before, op);
        }
    }

    /// Moves every constraint of `from` onto `to`, used when `to` replaces `from`.
    pub fn transfer(&mut self, from: OpId, to: OpId) -> Result<()> {
        self.transfer_to_multiple(from, &[to])
    }

    pub fn transfer_to_multiple(&mut self, from: OpId, to: &[OpId]) -> Result<()> {
        let befores: Vec<(OpId, bool)> = self
            .befores
            .get(&from)
            .map(|m| m.iter().map(|(op, tied)| (*op, *tied)).collect())
            .unwrap_or_default();
        let afters: Vec<(OpId, bool)> = self
            .afters
            .get(&from)
            .map(|m| m.iter().map(|(op, tied)| (*op, *tied)).collect())
            .unwrap_or_default();
        self.remove(from);
        for target in to {
            for (before, tied) in &befores {
                if before != target {
                    self.insert(*before, *target, *tied)?;
                }
            }
            for (after, tied) in &afters {
                if after != target {
                    self.insert(*target, *after, *tied)?;
                }
            }
        }
        Ok(())
    }

    /// Every constraint as `(before, after, tied)`, in id order.
    pub fn all(&self) -> Vec<(OpId, OpId, bool)> {
        self.afters
            .iter()
            .flat_map(|(before, afters)| {
                afters
                    .iter()
                    .map(move |(after, tied)| (*before, *after, *tied))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.afters.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.afters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_is_mirrored() {
        let mut cons = TopoCons::new();
        cons.insert(OpId(1), OpId(2), false).unwrap();
        assert!(cons.contains(OpId(1), OpId(2)));
        assert!(!cons.contains(OpId(2), OpId(1)));
        assert_eq!(cons.befores(OpId(2)), vec![OpId(1)]);
        assert_eq!(cons.afters(OpId(1)), vec![OpId(2)]);
        assert!(cons.tied_afters(OpId(1)).is_empty());

        cons.insert(OpId(1), OpId(2), true).unwrap();
        assert_eq!(cons.tied_afters(OpId(1)), vec![OpId(2)]);
        assert_eq!(cons.tied_befores(OpId(2)), vec![OpId(1)]);
        assert_eq!(cons.len(), 1);
    }

    #[test]
    fn self_constraint_rejected() {
        let mut cons = TopoCons::new();
        assert!(cons.insert(OpId(4), OpId(4), false).is_err());
    }

    #[test]
    fn transfer_moves_both_sides() {
        let mut cons = TopoCons::new();
        cons.insert(OpId(1), OpId(2), false).unwrap();
        cons.insert(OpId(2), OpId(3), true).unwrap();
        cons.transfer(OpId(2), OpId(9)).unwrap();
        assert!(!cons.has_constraints(OpId(2)));
        assert!(cons.contains(OpId(1), OpId(9)));
        assert_eq!(cons.tied_afters(OpId(9)), vec![OpId(3)]);
    }

    #[test]
    fn remove_clears_everything_for_op() {
        let mut cons = TopoCons::new();
        cons.insert(OpId(1), OpId(2), false).unwrap();
        cons.insert(OpId(3), OpId(1), false).unwrap();
        cons.remove(OpId(1));
        assert!(cons.is_empty());
    }
}
