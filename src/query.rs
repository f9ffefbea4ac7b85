//! Query surface over a model snapshot.
//!
//! [`QueryServer`] validates requests against the schema and routes them to
//! a [`Posterior`], which owns the distribution math. The server itself only
//! decodes wire values, enumerates feature sets, draws Monte Carlo samples
//! and aggregates them into [`Estimate`]s.
//!
//! | operation | returns |
//! |-----------|---------|
//! | [`score_row`](QueryServer::score_row) | log probability of the observed values |
//! | [`sample_given_observed`](QueryServer::sample_given_observed) | completions of a partial row |
//! | [`entropy_of_sets`](QueryServer::entropy_of_sets) | entropy estimates of set unions |
//! | [`score_derivative`](QueryServer::score_derivative) | rows whose score moves most after an update |
//!
//! Entropies are estimated as `H(S | c) ≈ -mean(log p(s, c) - log p(c))`
//! over samples `s ~ p(S | c)`, with variance `var / n`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use approx::{AbsDiffEq, RelativeEq};
use rand::RngCore;
use rand_xoshiro::Xoshiro256PlusPlus;
use tracing::debug;

use crate::config::{EngineConfig, QueryConfig};
use crate::error::{CrossCatError, Result};
use crate::model::AssignmentModel;
use crate::rng::{KernelId, RngFactory};
use crate::schema::FeatureId;
use crate::utils::Parallelism;
use crate::value::{
    Diff, DiffEngine, FeatureValues, ObservedMask, RowId, SparseCodec, SparsityPolicy,
};

/// A set of feature ids.
pub type FeatureSet = BTreeSet<FeatureId>;

// =============================================================================
// Posterior
// =============================================================================

/// Posterior predictive of a model snapshot.
///
/// Implemented by the distributions library; the server never interprets
/// statistics itself.
pub trait Posterior: Send + Sync {
    /// Log probability of `values`, marginalizing unobserved features.
    fn score(&self, model: &AssignmentModel, values: &FeatureValues) -> Result<f64>;

    /// Draw the features in `to_sample` conditioned on `observed`.
    ///
    /// The returned values cover exactly `to_sample`.
    fn sample(
        &self,
        model: &AssignmentModel,
        observed: &FeatureValues,
        to_sample: &[FeatureId],
        rng: &mut Xoshiro256PlusPlus,
    ) -> Result<FeatureValues>;

    /// Log probability of `values` once `update` is added to the model as
    /// one more observation.
    fn score_with_update(
        &self,
        model: &AssignmentModel,
        update: &FeatureValues,
        values: &FeatureValues,
    ) -> Result<f64>;
}

// =============================================================================
// Estimate
// =============================================================================

/// Monte Carlo estimate: sample mean and variance of the mean.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Estimate {
    pub mean: f64,
    pub variance: f64,
}

impl Estimate {
    pub fn new(mean: f64, variance: f64) -> Self {
        Self { mean, variance }
    }

    /// Mean of `samples` and population variance divided by the count.
    pub fn from_samples(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let n = samples.len() as f64;
        let mean = samples.iter().sum::<f64>() / n;
        let var = samples.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / n;
        Self {
            mean,
            variance: var / n,
        }
    }
}

impl AbsDiffEq for Estimate {
    type Epsilon = f64;

    fn default_epsilon() -> f64 {
        f64::default_epsilon()
    }

    fn abs_diff_eq(&self, other: &Self, epsilon: f64) -> bool {
        self.mean.abs_diff_eq(&other.mean, epsilon)
            && self.variance.abs_diff_eq(&other.variance, epsilon)
    }
}

impl RelativeEq for Estimate {
    fn default_max_relative() -> f64 {
        f64::default_max_relative()
    }

    fn relative_eq(&self, other: &Self, epsilon: f64, max_relative: f64) -> bool {
        self.mean.relative_eq(&other.mean, epsilon, max_relative)
            && self.variance.relative_eq(&other.variance, epsilon, max_relative)
    }
}

/// Entropy estimates in row-major `row_sets × col_sets` order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EntropyEstimates {
    pub means: Vec<f64>,
    pub variances: Vec<f64>,
}

// =============================================================================
// QueryServer
// =============================================================================

/// Answers queries against one model snapshot.
pub struct QueryServer<P> {
    model: Arc<AssignmentModel>,
    posterior: P,
    config: QueryConfig,
    sparsity: SparsityPolicy,
    parallelism: Parallelism,
    rngs: RngFactory,
    requests: AtomicU64,
}

impl<P: Posterior> QueryServer<P> {
    pub fn new(model: Arc<AssignmentModel>, posterior: P, config: &EngineConfig) -> Self {
        Self {
            model,
            posterior,
            config: config.query.clone(),
            sparsity: config.sparsity,
            parallelism: config.query_parallelism(),
            rngs: config.rng_factory(),
            requests: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn model(&self) -> &Arc<AssignmentModel> {
        &self.model
    }

    #[inline]
    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Log probability of a row given as an ingestion diff.
    pub fn score_row(&self, row: &Diff) -> Result<f64> {
        let values = self.decode_observed(row)?;
        self.posterior.score(&self.model, &values)
    }

    /// Complete a partial row.
    ///
    /// Every feature flagged in `to_sample` and not observed in `observed`
    /// is drawn; each sample is returned as an ingestion diff holding only
    /// the drawn values.
    ///
    /// # Arguments
    ///
    /// * `observed` - Conditioning values, as an ingestion diff.
    /// * `to_sample` - Features to draw.
    /// * `sample_count` - Samples to return; `None` uses the configured default.
    pub fn sample_given_observed(
        &self,
        observed: &Diff,
        to_sample: &ObservedMask,
        sample_count: Option<usize>,
    ) -> Result<Vec<Diff>> {
        let conditional = self.decode_observed(observed)?;
        let targets: Vec<FeatureId> = self
            .codec()
            .decode_mask(to_sample)?
            .into_iter()
            .filter(|&id| !conditional.contains(id))
            .collect();
        let count = sample_count.unwrap_or(self.config.sample_sample_count);

        let rngs = self.request_rngs();
        let engine = DiffEngine::with_codec(self.codec());
        let shards: Vec<usize> = (0..count).collect();
        let out = self.parallelism.maybe_par_try_map(shards, |i| {
            let mut rng = rngs.stream(KernelId::Query, i as u64);
            let drawn = self
                .posterior
                .sample(&self.model, &conditional, &targets, &mut rng)?;
            check_cover(&drawn, &targets)?;
            engine.from_values(&drawn)
        })?;
        debug!(samples = out.len(), features = targets.len(), "sampled");
        Ok(out)
    }

    /// Entropy of every union `row_set ∪ col_set`, conditioned on `conditional`.
    ///
    /// Results are in row-major order: entry `i * col_sets.len() + j` is the
    /// estimate for `row_sets[i] ∪ col_sets[j]`.
    pub fn entropy_of_sets(
        &self,
        row_sets: &[FeatureSet],
        col_sets: &[FeatureSet],
        conditional: &Diff,
        sample_count: Option<usize>,
    ) -> Result<EntropyEstimates> {
        let conditional = self.decode_observed(conditional)?;
        let n = self.model.index().total_feature_count();
        for &id in row_sets.iter().chain(col_sets).flatten() {
            if id as usize >= n {
                return Err(CrossCatError::schema(id, format!("schema declares {n} features")));
            }
            if conditional.contains(id) {
                return Err(CrossCatError::malformed(format!(
                    "feature {id} is both queried and conditioned on"
                )));
            }
        }
        let count = sample_count.unwrap_or(self.config.entropy_sample_count);
        let base_score = self.posterior.score(&self.model, &conditional)?;

        let unions: Vec<(usize, FeatureSet)> = row_sets
            .iter()
            .flat_map(|r| col_sets.iter().map(move |c| r | c))
            .enumerate()
            .collect();
        let rngs = self.request_rngs();
        let estimates = self.parallelism.maybe_par_try_map(unions, |(shard, set)| {
            self.estimate_entropy(&set, &conditional, base_score, count, rngs, shard as u64)
        })?;

        Ok(EntropyEstimates {
            means: estimates.iter().map(|e| e.mean).collect(),
            variances: estimates.iter().map(|e| e.variance).collect(),
        })
    }

    /// Entropy estimates keyed by feature set, split into tiles.
    ///
    /// Duplicate sets are merged and the empty set is always included, so
    /// every input set appears as a key. At most `tile_size²` unions are
    /// requested at once.
    pub fn entropy(
        &self,
        row_sets: &[FeatureSet],
        col_sets: &[FeatureSet],
        conditional: &Diff,
        sample_count: Option<usize>,
    ) -> Result<BTreeMap<FeatureSet, Estimate>> {
        let rows = with_empty_set(row_sets);
        let cols = with_empty_set(col_sets);
        let tile = self.config.tile_size.max(1);
        let min_size = tile.min(rows.len()).min(cols.len()).max(1);
        let tile = tile * tile / min_size;

        let mut out = BTreeMap::new();
        for row_tile in rows.chunks(tile) {
            for col_tile in cols.chunks(tile) {
                let estimates = self.entropy_of_sets(row_tile, col_tile, conditional, sample_count)?;
                let keys = row_tile
                    .iter()
                    .flat_map(|r| col_tile.iter().map(move |c| r | c));
                for ((key, mean), variance) in keys.zip(estimates.means).zip(estimates.variances) {
                    out.insert(key, Estimate::new(mean, variance));
                }
            }
        }
        Ok(out)
    }

    /// `I(A; B) = H(A) + H(B) - H(A ∪ B)`; variances add.
    pub fn mutual_information(
        &self,
        set_a: &FeatureSet,
        set_b: &FeatureSet,
        conditional: &Diff,
        sample_count: Option<usize>,
    ) -> Result<Estimate> {
        let count = sample_count.unwrap_or(self.config.mutual_information_sample_count);
        let entropies = self.entropy(
            std::slice::from_ref(set_a),
            std::slice::from_ref(set_b),
            conditional,
            Some(count),
        )?;
        let union: FeatureSet = set_a | set_b;
        let get = |set: &FeatureSet| {
            entropies
                .get(set)
                .copied()
                .ok_or_else(|| CrossCatError::structural("entropy tile lost a feature set"))
        };
        let (a, b, ab) = (get(set_a)?, get(set_b)?, get(&union)?);
        Ok(Estimate::new(
            a.mean + b.mean - ab.mean,
            a.variance + b.variance + ab.variance,
        ))
    }

    /// Rows whose score changes most when `update` is observed.
    ///
    /// Scores every row of `score_data` (or, when empty, every stored row)
    /// before and after `update` is added, and returns up to `row_limit`
    /// `(row id, score difference)` pairs, largest difference first.
    pub fn score_derivative(
        &self,
        score_data: &[(RowId, Diff)],
        update: &Diff,
        row_limit: Option<usize>,
    ) -> Result<(Vec<RowId>, Vec<f64>)> {
        let update = self.decode_observed(update)?;
        let limit = row_limit.unwrap_or(self.config.similar_row_limit);

        let rows: Vec<(RowId, FeatureValues)> = if score_data.is_empty() {
            self.model.rows().map(|(id, v)| (id, v.clone())).collect()
        } else {
            score_data
                .iter()
                .map(|(id, diff)| Ok((*id, self.decode_observed(diff)?)))
                .collect::<Result<_>>()?
        };

        let mut diffs = self.parallelism.maybe_par_try_map(rows, |(id, values)| {
            let before = self.posterior.score(&self.model, &values)?;
            let after = self
                .posterior
                .score_with_update(&self.model, &update, &values)?;
            Ok::<_, CrossCatError>((id, after - before))
        })?;
        diffs.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        diffs.truncate(limit);
        Ok(diffs.into_iter().unzip())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn codec(&self) -> SparseCodec<'_> {
        SparseCodec::new(self.model.index()).with_policy(self.sparsity)
    }

    /// Decode an ingestion diff into the observed values it carries.
    fn decode_observed(&self, diff: &Diff) -> Result<FeatureValues> {
        let decoded = DiffEngine::with_codec(self.codec()).decode(diff)?;
        if !decoded.neg.is_empty() || !decoded.tares.is_empty() {
            return Err(CrossCatError::malformed(
                "query rows must not carry neg values or tares",
            ));
        }
        Ok(decoded.pos)
    }

    /// Random streams private to one request, in call order.
    fn request_rngs(&self) -> RngFactory {
        let request = self.requests.fetch_add(1, Ordering::Relaxed);
        RngFactory::new(self.rngs.stream(KernelId::Query, request).next_u64())
    }

    fn estimate_entropy(
        &self,
        set: &FeatureSet,
        conditional: &FeatureValues,
        base_score: f64,
        count: usize,
        rngs: RngFactory,
        shard: u64,
    ) -> Result<Estimate> {
        if set.is_empty() {
            return Ok(Estimate::default());
        }
        let targets: Vec<FeatureId> = set.iter().copied().collect();
        let mut rng = rngs.stream(KernelId::Query, shard);
        let mut samples = Vec::with_capacity(count);
        for _ in 0..count {
            let drawn = self
                .posterior
                .sample(&self.model, conditional, &targets, &mut rng)?;
            check_cover(&drawn, &targets)?;
            let joint = self.posterior.score(&self.model, &conditional.merged(&drawn))?;
            samples.push(base_score - joint);
        }
        Ok(Estimate::from_samples(&samples))
    }
}

fn check_cover(drawn: &FeatureValues, targets: &[FeatureId]) -> Result<()> {
    if drawn.ids().ne(targets.iter().copied()) {
        return Err(CrossCatError::malformed(
            "posterior sample does not cover the requested features",
        ));
    }
    Ok(())
}

fn with_empty_set(sets: &[FeatureSet]) -> Vec<FeatureSet> {
    let mut unique: BTreeSet<FeatureSet> = sets.iter().cloned().collect();
    unique.insert(FeatureSet::new());
    unique.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn estimate_from_samples() {
        let e = Estimate::from_samples(&[1.0, 2.0, 3.0, 4.0]);
        assert_abs_diff_eq!(e.mean, 2.5);
        // Population variance 1.25, over 4 samples.
        assert_abs_diff_eq!(e.variance, 0.3125);
        assert_eq!(Estimate::from_samples(&[]), Estimate::default());
    }

    #[test]
    fn empty_set_is_added_once() {
        let sets = vec![
            FeatureSet::from([1, 2]),
            FeatureSet::new(),
            FeatureSet::from([2, 1]),
        ];
        let out = with_empty_set(&sets);
        assert_eq!(out, vec![FeatureSet::new(), FeatureSet::from([1, 2])]);
    }
}
