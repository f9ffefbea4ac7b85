//! Fixtures shared by integration tests.
//!
//! For schemas, audits and the mock posterior, use `crosscat::testing`.

#![allow(dead_code)]

use std::sync::Arc;

use crosscat::model::{AssignmentModel, Topology};
use crosscat::schema::{FeatureFamily, FeatureValue, ProductSchema, SchemaIndex};
use crosscat::value::FeatureValues;

/// bb: 0..3, gp: 3..5, nich: 5.
pub fn mixed_index() -> Arc<SchemaIndex> {
    Arc::new(SchemaIndex::new(
        ProductSchema::new()
            .with(FeatureFamily::BetaBernoulli, 3)
            .with(FeatureFamily::GammaPoisson, 2)
            .with(FeatureFamily::NormalInverseChiSq, 1),
    ))
}

/// A fully observed row of [`mixed_index`], varied by `seed`.
pub fn mixed_row(seed: u32) -> FeatureValues {
    [
        (0, FeatureValue::Boolean(seed % 2 == 0)),
        (1, FeatureValue::Boolean(seed % 3 == 0)),
        (2, FeatureValue::Boolean(true)),
        (3, FeatureValue::Count(seed)),
        (4, FeatureValue::Count(seed * 2 + 1)),
        (5, FeatureValue::Real(seed as f32 * 0.25 - 1.0)),
    ]
    .into_iter()
    .collect()
}

/// Kinds `{0, 1, 2}` and `{3, 4, 5}` with two groups each and `rows` rows.
///
/// Row `r` goes to group `r % 2` of the first kind and `r % 3 == 0` of the
/// second.
pub fn two_kind_model(rows: u32) -> AssignmentModel {
    let mut model = AssignmentModel::from_partition(
        mixed_index(),
        &[vec![0, 1, 2], vec![3, 4, 5]],
        Topology::default(),
    )
    .unwrap();
    let a = [model.create_group(0).unwrap(), model.create_group(0).unwrap()];
    let b = [model.create_group(1).unwrap(), model.create_group(1).unwrap()];
    for r in 0..rows {
        let groups = [a[(r % 2) as usize], b[usize::from(r % 3 == 0)]];
        model
            .insert_values(u64::from(r), mixed_row(r), &groups)
            .unwrap();
    }
    model
}
