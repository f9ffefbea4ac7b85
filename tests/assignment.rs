//! Integration tests for the assignment model: random operation sequences
//! keep every invariant, and rejected operations leave no trace.

mod common;

use proptest::prelude::*;
use rstest::rstest;

use crosscat::model::{AssignmentModel, Topology};
use crosscat::CrossCatError;

use common::{mixed_row, two_kind_model};

#[derive(Clone, Debug)]
enum Op {
    CreateGroup { kind: usize },
    AssignRow { row: u64, kind: usize, pick: usize },
    MergeGroups { kind: usize, a: usize, b: usize },
    SplitGroup { kind: usize, pick: usize },
    MoveFeature { feature: u32, to: usize },
    InsertRow { row: u64, pick: usize },
    RemoveRow { row: u64 },
    UpdateRow { row: u64, seed: u32 },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..2usize).prop_map(|kind| Op::CreateGroup { kind }),
        (0..12u64, 0..2usize, 0..4usize).prop_map(|(row, kind, pick)| Op::AssignRow { row, kind, pick }),
        (0..2usize, 0..4usize, 0..4usize).prop_map(|(kind, a, b)| Op::MergeGroups { kind, a, b }),
        (0..2usize, 0..4usize).prop_map(|(kind, pick)| Op::SplitGroup { kind, pick }),
        (0..6u32, 0..2usize).prop_map(|(feature, to)| Op::MoveFeature { feature, to }),
        (0..12u64, 0..4usize).prop_map(|(row, pick)| Op::InsertRow { row, pick }),
        (0..12u64).prop_map(|row| Op::RemoveRow { row }),
        (0..12u64, 0..8u32).prop_map(|(row, seed)| Op::UpdateRow { row, seed }),
    ]
}

/// The `pick`-th existing group of `kind`, wrapping around.
fn nth_group(model: &AssignmentModel, kind: usize, pick: usize) -> Option<u32> {
    let ids: Vec<u32> = model.kind(kind)?.group_ids().collect();
    (!ids.is_empty()).then(|| ids[pick % ids.len()])
}

/// Run one op; structural rejections are expected, anything else is not.
fn run(model: &mut AssignmentModel, op: &Op) -> Result<(), CrossCatError> {
    let index = std::sync::Arc::clone(model.index());
    let engine = crosscat::DiffEngine::new(&index);
    match *op {
        Op::CreateGroup { kind } => model.create_group(kind).map(|_| ()),
        Op::AssignRow { row, kind, pick } => match nth_group(model, kind, pick) {
            Some(g) => model.assign_row(row, kind, g),
            None => Ok(()),
        },
        Op::MergeGroups { kind, a, b } => match (nth_group(model, kind, a), nth_group(model, kind, b)) {
            (Some(a), Some(b)) => model.merge_groups(kind, a, b),
            _ => Ok(()),
        },
        Op::SplitGroup { kind, pick } => match nth_group(model, kind, pick) {
            Some(g) => {
                let members = model.kind(kind).map(|k| k.members(g)).unwrap_or_default();
                model.split_group(kind, g, &members[..members.len() / 2]).map(|_| ())
            }
            None => Ok(()),
        },
        Op::MoveFeature { feature, to } => {
            let from = model.kind_of(feature)?;
            model.move_feature_between_kinds(feature, from, to)
        }
        Op::InsertRow { row, pick } => {
            let groups: Option<Vec<u32>> = (0..model.kind_count())
                .map(|k| nth_group(model, k, pick))
                .collect();
            match groups {
                Some(groups) => model.insert_values(row, mixed_row(row as u32), &groups),
                None => Ok(()),
            }
        }
        Op::RemoveRow { row } => model.remove_row(row).map(|_| ()),
        Op::UpdateRow { row, seed } => match model.row(row) {
            Some(current) => {
                let diff = engine.compute_values(current, &mixed_row(seed))?;
                model.update_row(row, &diff)
            }
            None => Ok(()),
        },
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn random_sequences_keep_invariants(ops in prop::collection::vec(arb_op(), 1..40)) {
        let mut model = two_kind_model(6);
        for op in &ops {
            let before = model.clone();
            match run(&mut model, op) {
                Ok(()) => {}
                Err(err) => {
                    prop_assert!(!err.is_fatal(), "{op:?} failed fatally: {err}");
                    prop_assert_eq!(&model, &before, "{:?} left a partial change", op);
                }
            }
            model.check_invariants().unwrap();
        }
    }
}

#[test]
fn assignments_cover_every_kind() {
    let model = two_kind_model(6);
    let assignments = model.assignments().unwrap();
    assert_eq!(assignments.len(), 6);
    for a in &assignments {
        assert_eq!(a.groupids.len(), model.kind_count());
    }
}

#[rstest]
#[case::duplicate_row(0, true)]
#[case::fresh_row(100, false)]
fn insert_rejects_duplicates(#[case] row: u64, #[case] rejected: bool) {
    let mut model = two_kind_model(4);
    let groups: Vec<u32> = (0..2).map(|k| nth_group(&model, k, 0).unwrap()).collect();
    let before = model.clone();
    let result = model.insert_values(row, mixed_row(1), &groups);
    assert_eq!(result.is_err(), rejected);
    if rejected {
        assert_eq!(model, before);
    }
}

#[test]
fn wrong_group_count_is_structural() {
    let mut model = two_kind_model(2);
    let g = nth_group(&model, 0, 0).unwrap();
    assert!(matches!(
        model.insert_values(50, mixed_row(0), &[g]),
        Err(CrossCatError::StructuralViolation(_))
    ));
}

#[test]
fn emptied_group_is_removed() {
    let mut model = two_kind_model(2);
    // Rows 0 and 1 sit in different groups of kind 0.
    let lone = model.kind(0).unwrap().group_of(1).unwrap();
    let other = model.kind(0).unwrap().group_of(0).unwrap();
    model.assign_row(1, 0, other).unwrap();
    assert!(model.kind(0).unwrap().group(lone).is_none());
    assert_eq!(model.kind(0).unwrap().group(other).unwrap().count(), 2);
    model.check_invariants().unwrap();
}

#[test]
fn moved_feature_is_rebuilt_in_target_groups() {
    let mut model = two_kind_model(6);
    model.move_feature_between_kinds(0, 0, 1).unwrap();

    assert_eq!(model.kind_of(0).unwrap(), 1);
    let target = model.kind(1).unwrap();
    let observed: u64 = target
        .groups()
        .map(|(_, g)| g.stats(0).map_or(0, |s| s.count()))
        .sum();
    assert_eq!(observed, 6);
    for (_, group) in model.kind(0).unwrap().groups() {
        assert!(group.stats(0).is_none());
    }
    model.check_invariants().unwrap();
}

#[test]
fn new_kind_holds_every_row() {
    let mut model = two_kind_model(5);
    let k = model.add_kind(Topology::default());
    assert_eq!(model.kind(k).unwrap().group_count(), 1);
    model.move_feature_between_kinds(5, 1, k).unwrap();
    model.check_invariants().unwrap();
}
