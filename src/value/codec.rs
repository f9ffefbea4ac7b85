//! Sparse codec between [`FeatureValues`] and [`ProductValue`].
//!
//! # Sparsity selection
//!
//! The codec picks the smallest of the four sparsity modes:
//!
//! | observed | mode |
//! |----------|------|
//! | none | `NONE` |
//! | every feature | `ALL` |
//! | otherwise | `SPARSE` or `DENSE`, by [`SparsityPolicy`] |
//!
//! The default policy, [`SparsityPolicy::WireSize`], compares the postcard
//! sizes of the two masks. A dense mask costs one byte per feature plus its
//! length prefix; a sparse mask costs one varint per observed id (sized for
//! the largest possible id, `n - 1`) plus its length prefix. SPARSE wins only
//! when strictly smaller; ties go to DENSE. The choice depends on nothing but
//! `(n_features, n_observed)`.
//!
//! # Validation
//!
//! [`SparseCodec::decode`] rejects anything that violates the wire invariants
//! with [`CrossCatError::MalformedValue`], and values that do not fit their
//! family with [`CrossCatError::SchemaMismatch`]. Nothing is coerced.

use serde::{Deserialize, Serialize};

use super::{FeatureValues, ObservedMask, ProductValue, Sparsity};
use crate::error::{CrossCatError, Result};
use crate::schema::{FeatureId, FeatureValue, SchemaIndex, ValueType};

// =============================================================================
// SparsityPolicy
// =============================================================================

/// Rule choosing between SPARSE and DENSE for partially observed rows.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SparsityPolicy {
    /// Minimize the encoded mask size on the wire. Ties choose DENSE.
    #[default]
    WireSize,
    /// SPARSE iff `n_observed < density * n_features`.
    MaxDensity { density: f32 },
}

impl SparsityPolicy {
    /// Sparsity mode for a row with `n_observed` of `n_features` observed.
    pub fn choose(&self, n_features: usize, n_observed: usize) -> Sparsity {
        if n_observed == 0 {
            return Sparsity::None;
        }
        if n_observed >= n_features {
            return Sparsity::All;
        }
        let sparse_wins = match *self {
            Self::WireSize => {
                let id_width = varint_len((n_features - 1) as u64);
                let sparse = varint_len(n_observed as u64) + n_observed * id_width;
                let dense = varint_len(n_features as u64) + n_features;
                sparse < dense
            }
            Self::MaxDensity { density } => {
                (n_observed as f64) < f64::from(density) * n_features as f64
            }
        };
        if sparse_wins {
            Sparsity::Sparse
        } else {
            Sparsity::Dense
        }
    }
}

/// Bytes taken by `value` as a LEB128 varint.
#[inline]
fn varint_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.div_ceil(7).max(1)
}

// =============================================================================
// SparseCodec
// =============================================================================

/// Stateless encoder/decoder bound to one schema.
#[derive(Clone, Copy, Debug)]
pub struct SparseCodec<'a> {
    index: &'a SchemaIndex,
    policy: SparsityPolicy,
}

impl<'a> SparseCodec<'a> {
    /// Codec using the default [`SparsityPolicy::WireSize`] rule.
    pub fn new(index: &'a SchemaIndex) -> Self {
        Self {
            index,
            policy: SparsityPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: SparsityPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[inline]
    pub fn index(&self) -> &'a SchemaIndex {
        self.index
    }

    #[inline]
    pub fn policy(&self) -> SparsityPolicy {
        self.policy
    }

    /// Encode an observed feature map.
    pub fn encode(&self, values: &FeatureValues) -> Result<ProductValue> {
        for (&id, value) in values {
            self.index.check_value(id, value)?;
        }

        let ids: Vec<FeatureId> = values.ids().collect();
        let mut out = ProductValue {
            observed: self.encode_mask(&ids)?,
            ..ProductValue::default()
        };

        // Ids ascend and value types occupy ascending id ranges, so pushing in
        // id order yields schema order within each array.
        for (_, value) in values {
            match *value {
                FeatureValue::Boolean(b) => out.booleans.push(b),
                FeatureValue::Count(c) => out.counts.push(c),
                FeatureValue::Real(x) => out.reals.push(x),
            }
        }
        Ok(out)
    }

    /// Encode a strictly increasing list of feature ids as a mask.
    pub fn encode_mask(&self, ids: &[FeatureId]) -> Result<ObservedMask> {
        let n = self.index.total_feature_count();
        check_sparse_ids(ids, n)?;

        Ok(match self.policy.choose(n, ids.len()) {
            Sparsity::None => ObservedMask::none(),
            Sparsity::All => ObservedMask::all(),
            Sparsity::Sparse => ObservedMask::sparse(ids.to_vec()),
            Sparsity::Dense => {
                let mut flags = vec![false; n];
                for &id in ids {
                    flags[id as usize] = true;
                }
                ObservedMask::dense(flags)
            }
        })
    }

    /// Observed feature ids of a mask, validating its invariants.
    pub fn decode_mask(&self, mask: &ObservedMask) -> Result<Vec<FeatureId>> {
        let n = self.index.total_feature_count();
        match mask.sparsity {
            Sparsity::None | Sparsity::All => {
                if !mask.dense.is_empty() || !mask.sparse.is_empty() {
                    return Err(CrossCatError::malformed(format!(
                        "{:?} mask must not carry dense or sparse entries",
                        mask.sparsity
                    )));
                }
                if mask.sparsity == Sparsity::All {
                    Ok((0..n as FeatureId).collect())
                } else {
                    Ok(Vec::new())
                }
            }
            Sparsity::Dense => {
                if !mask.sparse.is_empty() {
                    return Err(CrossCatError::malformed("DENSE mask carries sparse ids"));
                }
                if mask.dense.len() != n {
                    return Err(CrossCatError::malformed(format!(
                        "DENSE mask has {} flags, schema has {n} features",
                        mask.dense.len()
                    )));
                }
                Ok(mask
                    .dense
                    .iter()
                    .enumerate()
                    .filter(|(_, &observed)| observed)
                    .map(|(i, _)| i as FeatureId)
                    .collect())
            }
            Sparsity::Sparse => {
                if !mask.dense.is_empty() {
                    return Err(CrossCatError::malformed("SPARSE mask carries dense flags"));
                }
                check_sparse_ids(&mask.sparse, n)?;
                Ok(mask.sparse.clone())
            }
        }
    }

    /// Decode a wire value into its observed feature map.
    pub fn decode(&self, value: &ProductValue) -> Result<FeatureValues> {
        let ids = self.decode_mask(&value.observed)?;

        let mut expected = [0usize; 3];
        for &id in &ids {
            expected[type_slot(self.index.value_type_of(id)?)] += 1;
        }
        let actual = [value.booleans.len(), value.counts.len(), value.reals.len()];
        for (value_type, (&want, &got)) in ValueType::ALL.iter().zip(expected.iter().zip(&actual)) {
            if want != got {
                return Err(CrossCatError::malformed(format!(
                    "{value_type:?} array has {got} entries, mask observes {want}"
                )));
            }
        }

        let mut booleans = value.booleans.iter();
        let mut counts = value.counts.iter();
        let mut reals = value.reals.iter();
        let mut out = FeatureValues::new();
        for id in ids {
            // Lengths were checked above, so every cursor has a next entry.
            let decoded = match self.index.value_type_of(id)? {
                ValueType::Boolean => booleans.next().map(|&b| FeatureValue::Boolean(b)),
                ValueType::Count => counts.next().map(|&c| FeatureValue::Count(c)),
                ValueType::Real => reals.next().map(|&x| FeatureValue::Real(x)),
            }
            .ok_or_else(|| CrossCatError::malformed("value arrays exhausted"))?;
            self.index.check_value(id, &decoded)?;
            out.insert(id, decoded);
        }
        Ok(out)
    }

    /// Re-encode a value with this codec's policy.
    pub fn canonicalize(&self, value: &ProductValue) -> Result<ProductValue> {
        self.encode(&self.decode(value)?)
    }
}

#[inline]
fn type_slot(value_type: ValueType) -> usize {
    match value_type {
        ValueType::Boolean => 0,
        ValueType::Count => 1,
        ValueType::Real => 2,
    }
}

fn check_sparse_ids(ids: &[FeatureId], n_features: usize) -> Result<()> {
    if let Some(w) = ids.windows(2).find(|w| w[0] >= w[1]) {
        return Err(CrossCatError::malformed(format!(
            "sparse ids not strictly increasing at {} -> {}",
            w[0], w[1]
        )));
    }
    if let Some(&last) = ids.last() {
        if last as usize >= n_features {
            return Err(CrossCatError::malformed(format!(
                "sparse id {last} out of range for {n_features} features"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FeatureFamily, ProductSchema};

    fn index_3b2c() -> SchemaIndex {
        SchemaIndex::new(
            ProductSchema::new()
                .with(FeatureFamily::BetaBernoulli, 3)
                .with(FeatureFamily::GammaPoisson, 2),
        )
    }

    #[test]
    fn varint_lengths() {
        assert_eq!(varint_len(0), 1);
        assert_eq!(varint_len(127), 1);
        assert_eq!(varint_len(128), 2);
        assert_eq!(varint_len(16_383), 2);
        assert_eq!(varint_len(16_384), 3);
    }

    #[test]
    fn wire_size_policy_modes() {
        let policy = SparsityPolicy::WireSize;
        assert_eq!(policy.choose(5, 0), Sparsity::None);
        assert_eq!(policy.choose(5, 5), Sparsity::All);
        assert_eq!(policy.choose(5, 3), Sparsity::Sparse);
        assert_eq!(policy.choose(200, 150), Sparsity::Dense);
        assert_eq!(policy.choose(200, 99), Sparsity::Sparse);
        assert_eq!(policy.choose(0, 0), Sparsity::None);
    }

    #[test]
    fn wire_size_tie_goes_dense() {
        // n = 131: dense = 2 + 131 = 133, ids take 2 bytes.
        // k = 66: sparse = 1 + 132 = 133 (tie); k = 65: 1 + 130 = 131.
        assert_eq!(SparsityPolicy::WireSize.choose(131, 66), Sparsity::Dense);
        assert_eq!(SparsityPolicy::WireSize.choose(131, 65), Sparsity::Sparse);
    }

    #[test]
    fn max_density_policy() {
        let policy = SparsityPolicy::MaxDensity { density: 0.5 };
        assert_eq!(policy.choose(10, 4), Sparsity::Sparse);
        assert_eq!(policy.choose(10, 5), Sparsity::Dense);
    }

    #[test]
    fn encode_fills_arrays_in_schema_order() {
        let index = index_3b2c();
        let codec = SparseCodec::new(&index);
        let mut values = FeatureValues::new();
        values.insert(4, 7u32);
        values.insert(0, true);
        values.insert(3, 2u32);

        let encoded = codec.encode(&values).unwrap();
        assert_eq!(encoded.observed.sparsity, Sparsity::Sparse);
        assert_eq!(encoded.observed.sparse, vec![0, 3, 4]);
        assert_eq!(encoded.booleans, vec![true]);
        assert_eq!(encoded.counts, vec![2, 7]);
        assert!(encoded.reals.is_empty());
    }

    #[test]
    fn encode_rejects_wrong_type() {
        let index = index_3b2c();
        let codec = SparseCodec::new(&index);
        let mut values = FeatureValues::new();
        values.insert(0, 3u32);
        assert!(matches!(
            codec.encode(&values),
            Err(CrossCatError::SchemaMismatch { feature: 0, .. })
        ));
    }

    #[test]
    fn decode_all_mode() {
        let index = index_3b2c();
        let codec = SparseCodec::new(&index);
        let value = ProductValue {
            observed: ObservedMask::all(),
            booleans: vec![true, false, true],
            counts: vec![1, 2],
            reals: vec![],
        };
        let decoded = codec.decode(&value).unwrap();
        assert_eq!(decoded.len(), 5);
        assert_eq!(decoded.get(4), Some(&FeatureValue::Count(2)));
    }

    #[test]
    fn decode_rejects_length_mismatch() {
        let index = index_3b2c();
        let codec = SparseCodec::new(&index);
        let value = ProductValue {
            observed: ObservedMask::sparse(vec![0, 1]),
            booleans: vec![true],
            ..ProductValue::default()
        };
        assert!(matches!(
            codec.decode(&value),
            Err(CrossCatError::MalformedValue(_))
        ));
    }

    #[test]
    fn decode_rejects_unsorted_and_out_of_range_ids() {
        let index = index_3b2c();
        let codec = SparseCodec::new(&index);

        let unsorted = ProductValue {
            observed: ObservedMask::sparse(vec![1, 0]),
            booleans: vec![true, true],
            ..ProductValue::default()
        };
        assert!(codec.decode(&unsorted).is_err());

        let duplicate = ProductValue {
            observed: ObservedMask::sparse(vec![1, 1]),
            booleans: vec![true, true],
            ..ProductValue::default()
        };
        assert!(codec.decode(&duplicate).is_err());

        let out_of_range = ProductValue {
            observed: ObservedMask::sparse(vec![5]),
            counts: vec![1],
            ..ProductValue::default()
        };
        assert!(matches!(
            codec.decode(&out_of_range),
            Err(CrossCatError::MalformedValue(_))
        ));
    }

    #[test]
    fn decode_rejects_mixed_mask_fields() {
        let index = index_3b2c();
        let codec = SparseCodec::new(&index);

        let mut none_with_ids = ProductValue::none();
        none_with_ids.observed.sparse = vec![0];
        assert!(codec.decode(&none_with_ids).is_err());

        let short_dense = ProductValue {
            observed: ObservedMask::dense(vec![true, false]),
            booleans: vec![true],
            ..ProductValue::default()
        };
        assert!(codec.decode(&short_dense).is_err());
    }

    #[test]
    fn canonicalize_rewrites_mode() {
        let index = index_3b2c();
        let codec = SparseCodec::new(&index);
        let dense = ProductValue {
            observed: ObservedMask::dense(vec![true, true, true, true, true]),
            booleans: vec![false, false, true],
            counts: vec![0, 9],
            reals: vec![],
        };
        let canonical = codec.canonicalize(&dense).unwrap();
        assert_eq!(canonical.observed, ObservedMask::all());
        assert_eq!(codec.decode(&canonical).unwrap(), codec.decode(&dense).unwrap());
    }
}
