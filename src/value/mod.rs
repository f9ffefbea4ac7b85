//! Row values: wire form, logical form, and diffs between them.
//!
//! # Wire form
//!
//! [`ProductValue`] is the compact, self-describing encoding of one row's
//! observed features. Its [`ObservedMask`] says *which* features are present
//! (in one of four sparsity modes) and the three typed arrays carry the values
//! of the observed features, in schema order.
//!
//! # Logical form
//!
//! [`FeatureValues`] is an ordered `feature id -> value` map. It is what the
//! codec consumes and produces, and what the assignment model stores per row.
//!
//! See [`codec`] for the conversion and [`diff`] for incremental updates.

pub mod codec;
pub mod diff;

use std::collections::btree_map;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::schema::{FeatureId, FeatureValue};

pub use codec::{SparseCodec, SparsityPolicy};
pub use diff::{DecodedDiff, Diff, DiffEngine};

// =============================================================================
// ObservedMask
// =============================================================================

/// How the observed feature set is encoded.
///
/// Discriminants are part of the wire format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Sparsity {
    /// Nothing observed.
    #[default]
    None = 0,
    /// Observed ids listed in `sparse`.
    Sparse = 1,
    /// One flag per feature in `dense`.
    Dense = 2,
    /// Every feature observed.
    All = 3,
}

impl Sparsity {
    /// Convert from the wire discriminant.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Sparse),
            2 => Some(Self::Dense),
            3 => Some(Self::All),
            _ => None,
        }
    }
}

/// Observed feature set of a [`ProductValue`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedMask {
    pub sparsity: Sparsity,
    pub dense: Vec<bool>,
    pub sparse: Vec<FeatureId>,
}

impl ObservedMask {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self {
            sparsity: Sparsity::All,
            ..Self::default()
        }
    }

    pub fn dense(flags: Vec<bool>) -> Self {
        Self {
            sparsity: Sparsity::Dense,
            dense: flags,
            sparse: Vec::new(),
        }
    }

    pub fn sparse(ids: Vec<FeatureId>) -> Self {
        Self {
            sparsity: Sparsity::Sparse,
            dense: Vec::new(),
            sparse: ids,
        }
    }
}

// =============================================================================
// ProductValue
// =============================================================================

/// Wire form of a row's observed values.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductValue {
    pub observed: ObservedMask,
    pub booleans: Vec<bool>,
    pub counts: Vec<u32>,
    pub reals: Vec<f32>,
}

impl ProductValue {
    /// A value with nothing observed.
    pub fn none() -> Self {
        Self::default()
    }

    /// Number of typed entries carried.
    pub fn value_count(&self) -> usize {
        self.booleans.len() + self.counts.len() + self.reals.len()
    }
}

// =============================================================================
// FeatureValues
// =============================================================================

/// Logical form of a row: observed features and their values.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FeatureValues {
    values: BTreeMap<FeatureId, FeatureValue>,
}

impl FeatureValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a positional row where `None` marks an unobserved feature.
    pub fn from_data_row(row: &[Option<FeatureValue>]) -> Self {
        row.iter()
            .enumerate()
            .filter_map(|(i, v)| v.map(|v| (i as FeatureId, v)))
            .collect()
    }

    /// Positional row of length `n_features`.
    pub fn to_data_row(&self, n_features: usize) -> Vec<Option<FeatureValue>> {
        let mut row = vec![None; n_features];
        for (&id, &value) in &self.values {
            if let Some(slot) = row.get_mut(id as usize) {
                *slot = Some(value);
            }
        }
        row
    }

    pub fn insert(&mut self, feature: FeatureId, value: impl Into<FeatureValue>) -> Option<FeatureValue> {
        self.values.insert(feature, value.into())
    }

    pub fn remove(&mut self, feature: FeatureId) -> Option<FeatureValue> {
        self.values.remove(&feature)
    }

    #[inline]
    pub fn get(&self, feature: FeatureId) -> Option<&FeatureValue> {
        self.values.get(&feature)
    }

    #[inline]
    pub fn contains(&self, feature: FeatureId) -> bool {
        self.values.contains_key(&feature)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Observed feature ids in increasing order.
    pub fn ids(&self) -> impl Iterator<Item = FeatureId> + '_ {
        self.values.keys().copied()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, FeatureId, FeatureValue> {
        self.values.iter()
    }

    /// Keep only the features accepted by `keep`.
    pub fn restricted(&self, mut keep: impl FnMut(FeatureId) -> bool) -> Self {
        self.values
            .iter()
            .filter(|(&id, _)| keep(id))
            .map(|(&id, &v)| (id, v))
            .collect()
    }

    /// Overlay `other` on top of `self`.
    pub fn merged(&self, other: &FeatureValues) -> Self {
        let mut out = self.clone();
        out.values.extend(other.iter().map(|(&id, &v)| (id, v)));
        out
    }
}

impl FromIterator<(FeatureId, FeatureValue)> for FeatureValues {
    fn from_iter<T: IntoIterator<Item = (FeatureId, FeatureValue)>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a FeatureValues {
    type Item = (&'a FeatureId, &'a FeatureValue);
    type IntoIter = btree_map::Iter<'a, FeatureId, FeatureValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}

// =============================================================================
// Row
// =============================================================================

/// Identifier of an ingested row.
pub type RowId = u64;

/// A row on the wire: its id and its value as a diff.
///
/// For ingestion the diff is taken against an all-absent baseline, so `neg`
/// is empty and `pos` carries every observed value.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub id: RowId,
    pub diff: Diff,
}

impl Row {
    pub fn new(id: RowId, diff: Diff) -> Self {
        Self { id, diff }
    }
}
