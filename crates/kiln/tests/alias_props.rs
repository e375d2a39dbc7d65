use std::collections::BTreeSet;

use proptest::prelude::*;

use kiln::alias::{AliasModel, Proposal, Rejection};
use kiln::ir::{OpId, TensorId};

fn t(i: usize) -> TensorId {
    TensorId::new(format!("t{i}"))
}

#[derive(Debug, Clone)]
struct Step {
    op: u64,
    aliases: Vec<(usize, usize)>,
    modifies: Vec<usize>,
    keep: bool,
}

fn step() -> impl Strategy<Value = Step> {
    (
        0u64..6,
        prop::collection::vec((0usize..8, 0usize..8), 0..3),
        prop::collection::vec(0usize..8, 0..3),
        any::<bool>(),
    )
        .prop_map(|(op, aliases, modifies, keep)| Step {
            op,
            aliases,
            modifies,
            keep,
        })
}

fn proposal(step: &Step) -> Proposal {
    Proposal {
        op: OpId(step.op),
        aliases: step.aliases.iter().map(|(a, b)| (t(*a), t(*b))).collect(),
        modifies: step.modifies.iter().map(|m| t(*m)).collect(),
    }
}

proptest! {
    #[test]
    fn rollback_restores_the_model_exactly(steps in prop::collection::vec(step(), 1..16)) {
        let mut model = AliasModel::new();
        for step in &steps {
            let before = model.clone();
            match model.propose(proposal(step)) {
                Ok(transaction) => {
                    prop_assert!(model.is_open(OpId(step.op)) || step.aliases.is_empty());
                    if step.keep {
                        model.commit(transaction);
                    } else {
                        model.rollback(transaction);
                        prop_assert_eq!(&model, &before);
                    }
                }
                Err(_) => {
                    prop_assert_eq!(&model, &before);
                }
            }
        }
    }

    #[test]
    fn alias_sets_are_symmetric_and_transitive(steps in prop::collection::vec(step(), 1..12)) {
        let mut model = AliasModel::new();
        for step in &steps {
            if let Ok(transaction) = model.propose(proposal(step)) {
                model.commit(transaction);
            }
        }
        for i in 0..8 {
            let set = model.aliases(&t(i));
            prop_assert!(set.contains(&t(i)));
            for member in &set {
                prop_assert!(model.are_aliased(member, &t(i)));
                prop_assert_eq!(&model.aliases(member), &set);
            }
        }
    }
}

#[test]
fn rejected_proposals_leave_nothing_behind() {
    let mut model = AliasModel::new();
    let first = model
        .propose(Proposal {
            op: OpId(1),
            aliases: vec![(t(0), t(1))],
            modifies: vec![t(0)],
        })
        .unwrap();
    model.commit(first);
    let snapshot = model.clone();

    let again = model.propose(Proposal {
        op: OpId(1),
        aliases: vec![(t(2), t(3))],
        modifies: vec![],
    });
    assert_eq!(again.unwrap_err(), Rejection::AlreadyOpen(OpId(1)));

    let redundant = model.propose(Proposal {
        op: OpId(2),
        aliases: vec![(t(1), t(0))],
        modifies: vec![],
    });
    assert!(matches!(redundant, Err(Rejection::AlreadyAliased { .. })));

    let selfish = model.propose(Proposal {
        op: OpId(3),
        aliases: vec![(t(4), t(4))],
        modifies: vec![],
    });
    assert_eq!(selfish.unwrap_err(), Rejection::SelfAlias(t(4)));
    assert_eq!(model, snapshot);
}

#[test]
fn writers_follow_renamed_ops() {
    let mut model = AliasModel::new();
    let tx = model
        .propose(Proposal {
            op: OpId(7),
            aliases: vec![(t(0), t(1))],
            modifies: vec![t(0)],
        })
        .unwrap();
    model.commit(tx);
    model.rename_op(OpId(7), OpId(9));

    let storage: BTreeSet<TensorId> = model.aliases(&t(1));
    assert_eq!(model.writers_of(&storage), BTreeSet::from([OpId(9)]));
    assert!(model.is_open(OpId(9)));
    assert!(!model.is_open(OpId(7)));
}
