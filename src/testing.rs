//! Testing utilities for crosscat.
//!
//! Shared by unit tests and integration tests:
//!
//! ```ignore
//! use crosscat::testing::{mixed_schema, FairCoinPosterior, RecordingAudit};
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::error::{CrossCatError, Result};
use crate::model::{AssignmentModel, GroupId, StatsAudit};
use crate::query::Posterior;
use crate::schema::{FeatureFamily, FeatureId, FeatureValue, ProductSchema, SchemaIndex};
use crate::value::FeatureValues;

// =============================================================================
// Schemas
// =============================================================================

/// `booleans` bb features followed by `counts` gp features.
pub fn mixed_schema(booleans: usize, counts: usize) -> Arc<SchemaIndex> {
    Arc::new(SchemaIndex::new(
        ProductSchema::new()
            .with(FeatureFamily::BetaBernoulli, booleans)
            .with(FeatureFamily::GammaPoisson, counts),
    ))
}

/// `n` bb features.
pub fn boolean_schema(n: usize) -> Arc<SchemaIndex> {
    mixed_schema(n, 0)
}

/// Boolean row with the given features set to `value`.
pub fn boolean_row(features: &[FeatureId], value: bool) -> FeatureValues {
    features
        .iter()
        .map(|&f| (f, FeatureValue::Boolean(value)))
        .collect()
}

// =============================================================================
// Audit
// =============================================================================

/// Records every statistics touch as `(kind, group, feature)`.
#[derive(Debug, Default)]
pub struct RecordingAudit {
    touches: Mutex<Vec<(usize, GroupId, FeatureId)>>,
}

impl RecordingAudit {
    pub fn touches(&self) -> Vec<(usize, GroupId, FeatureId)> {
        self.touches.lock().clone()
    }

    pub fn clear(&self) {
        self.touches.lock().clear();
    }
}

impl StatsAudit for RecordingAudit {
    fn touched(&self, kind: usize, group: GroupId, feature: FeatureId) {
        self.touches.lock().push((kind, group, feature));
    }
}

// =============================================================================
// Posterior
// =============================================================================

/// Every boolean feature is an independent fair coin.
///
/// Scores ignore the model, so entropies are exact: `k` sampled features
/// always contribute `k · ln 2` with zero variance. `score_with_update`
/// adds `bonus` for every feature on which `values` agrees with the update.
#[derive(Clone, Copy, Debug)]
pub struct FairCoinPosterior {
    pub bonus: f64,
}

impl Default for FairCoinPosterior {
    fn default() -> Self {
        Self { bonus: 1.0 }
    }
}

impl Posterior for FairCoinPosterior {
    fn score(&self, _model: &AssignmentModel, values: &FeatureValues) -> Result<f64> {
        let mut score = 0.0;
        for (&id, value) in values {
            match value {
                FeatureValue::Boolean(_) => score -= std::f64::consts::LN_2,
                _ => return Err(CrossCatError::schema(id, "fair coin posterior scores booleans only")),
            }
        }
        Ok(score)
    }

    fn sample(
        &self,
        _model: &AssignmentModel,
        _observed: &FeatureValues,
        to_sample: &[FeatureId],
        rng: &mut Xoshiro256PlusPlus,
    ) -> Result<FeatureValues> {
        Ok(to_sample
            .iter()
            .map(|&id| (id, FeatureValue::Boolean(rng.gen::<bool>())))
            .collect())
    }

    fn score_with_update(
        &self,
        model: &AssignmentModel,
        update: &FeatureValues,
        values: &FeatureValues,
    ) -> Result<f64> {
        let agree = values
            .iter()
            .filter(|(id, v)| update.get(**id) == Some(*v))
            .count();
        Ok(self.score(model, values)? + self.bonus * agree as f64)
    }
}
