//! Incremental row changes expressed as pos/neg/tares.
//!
//! A [`Diff`] takes a baseline row to an updated row:
//!
//! - `pos`: features whose value is new or changed, with the new value
//! - `neg`: features that disappeared or changed, with the *prior* value
//! - `tares`: features observed with the same value on both sides, carried as
//!   bare ids so statistic updates can skip them
//!
//! A changed feature appears in both `pos` and `neg`. That lets a sufficient
//! statistic accumulator do one bulk pass ("remove neg, add pos") per row
//! without ever looking at the baseline.
//!
//! ```text
//! baseline  {0: true, 1: 3, 2: 1.5}
//! updated   {0: true, 1: 4,          3: 2}
//! diff      pos {1: 4, 3: 2}   neg {1: 3, 2: 1.5}   tares [0]
//! ```

use serde::{Deserialize, Serialize};

use super::{FeatureValues, ProductValue, SparseCodec};
use crate::error::{CrossCatError, Result};
use crate::schema::{FeatureId, SchemaIndex};

/// Change between two row snapshots.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Diff {
    pub pos: ProductValue,
    pub neg: ProductValue,
    pub tares: Vec<FeatureId>,
}

impl Diff {
    /// The empty diff.
    pub fn none() -> Self {
        Self::default()
    }

    /// Undo diff: applying it to the updated row restores the baseline.
    pub fn reversed(&self) -> Self {
        Self {
            pos: self.neg.clone(),
            neg: self.pos.clone(),
            tares: self.tares.clone(),
        }
    }
}

/// A diff whose halves have been decoded and structurally validated.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DecodedDiff {
    pub pos: FeatureValues,
    pub neg: FeatureValues,
    pub tares: Vec<FeatureId>,
}

impl DecodedDiff {
    /// True when applying the diff changes nothing.
    pub fn is_noop(&self) -> bool {
        self.pos.is_empty() && self.neg.is_empty()
    }

    /// Check the diff against the row it will be applied to.
    ///
    /// Every tare and every `neg` entry must be observed in `baseline` (with
    /// the same value for `neg`), and a `pos` entry may only replace a
    /// baseline value that `neg` removes.
    pub fn check_against(&self, baseline: &FeatureValues) -> Result<()> {
        for &id in &self.tares {
            if !baseline.contains(id) {
                return Err(CrossCatError::malformed(format!(
                    "tare {id} is not observed in the baseline"
                )));
            }
        }
        for (&id, value) in &self.neg {
            match baseline.get(id) {
                Some(prior) if prior.same_as(value) => {}
                Some(prior) => {
                    return Err(CrossCatError::malformed(format!(
                        "neg value {value:?} for feature {id} does not match baseline {prior:?}"
                    )))
                }
                None => {
                    return Err(CrossCatError::malformed(format!(
                        "neg feature {id} is not observed in the baseline"
                    )))
                }
            }
        }
        for id in self.pos.ids() {
            if baseline.contains(id) && !self.neg.contains(id) {
                return Err(CrossCatError::malformed(format!(
                    "pos feature {id} overwrites a baseline value without removing it"
                )));
            }
        }
        Ok(())
    }

    /// Apply to an already checked baseline.
    fn apply_unchecked(&self, baseline: &FeatureValues) -> FeatureValues {
        let mut out = baseline.clone();
        for id in self.neg.ids() {
            out.remove(id);
        }
        for (&id, &value) in &self.pos {
            out.insert(id, value);
        }
        out
    }
}

// =============================================================================
// DiffEngine
// =============================================================================

/// Computes and applies diffs for one schema.
#[derive(Clone, Copy, Debug)]
pub struct DiffEngine<'a> {
    codec: SparseCodec<'a>,
}

impl<'a> DiffEngine<'a> {
    pub fn new(index: &'a SchemaIndex) -> Self {
        Self::with_codec(SparseCodec::new(index))
    }

    pub fn with_codec(codec: SparseCodec<'a>) -> Self {
        Self { codec }
    }

    #[inline]
    pub fn codec(&self) -> SparseCodec<'a> {
        self.codec
    }

    /// Ingestion diff: `value` against an all-absent baseline.
    pub fn from_values(&self, value: &FeatureValues) -> Result<Diff> {
        Ok(Diff {
            pos: self.codec.encode(value)?,
            neg: ProductValue::none(),
            tares: Vec::new(),
        })
    }

    /// Diff taking `baseline` to `updated`.
    pub fn compute(&self, baseline: &ProductValue, updated: &ProductValue) -> Result<Diff> {
        let baseline = self.codec.decode(baseline)?;
        let updated = self.codec.decode(updated)?;
        self.compute_values(&baseline, &updated)
    }

    /// Diff between two decoded rows.
    pub fn compute_values(&self, baseline: &FeatureValues, updated: &FeatureValues) -> Result<Diff> {
        let mut pos = FeatureValues::new();
        let mut neg = FeatureValues::new();
        let mut tares = Vec::new();

        for (&id, &value) in updated {
            match baseline.get(id) {
                Some(prior) if prior.same_as(&value) => tares.push(id),
                Some(&prior) => {
                    pos.insert(id, value);
                    neg.insert(id, prior);
                }
                None => {
                    pos.insert(id, value);
                }
            }
        }
        for (&id, &prior) in baseline {
            if !updated.contains(id) {
                neg.insert(id, prior);
            }
        }

        Ok(Diff {
            pos: self.codec.encode(&pos)?,
            neg: self.codec.encode(&neg)?,
            tares,
        })
    }

    /// Decode and structurally validate a diff.
    pub fn decode(&self, diff: &Diff) -> Result<DecodedDiff> {
        let pos = self.codec.decode(&diff.pos)?;
        let neg = self.codec.decode(&diff.neg)?;

        let n = self.codec.index().total_feature_count();
        if let Some(w) = diff.tares.windows(2).find(|w| w[0] >= w[1]) {
            return Err(CrossCatError::malformed(format!(
                "tares not strictly increasing at {} -> {}",
                w[0], w[1]
            )));
        }
        for &id in &diff.tares {
            if id as usize >= n {
                return Err(CrossCatError::malformed(format!(
                    "tare {id} out of range for {n} features"
                )));
            }
            if pos.contains(id) || neg.contains(id) {
                return Err(CrossCatError::malformed(format!(
                    "tare {id} also carries a pos/neg value"
                )));
            }
        }

        Ok(DecodedDiff {
            pos,
            neg,
            tares: diff.tares.clone(),
        })
    }

    /// Apply `diff` to `baseline`, returning the canonical updated value.
    pub fn apply(&self, baseline: &ProductValue, diff: &Diff) -> Result<ProductValue> {
        let baseline = self.codec.decode(baseline)?;
        let updated = self.apply_values(&baseline, diff)?;
        self.codec.encode(&updated)
    }

    /// Apply `diff` to a decoded baseline.
    pub fn apply_values(&self, baseline: &FeatureValues, diff: &Diff) -> Result<FeatureValues> {
        let decoded = self.decode(diff)?;
        decoded.check_against(baseline)?;
        Ok(decoded.apply_unchecked(baseline))
    }
}
