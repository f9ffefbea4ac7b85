//! Product schema and the feature index derived from it.
//!
//! A [`ProductSchema`] declares how many features of each distribution family
//! exist. Families are kept in a canonical order (Beta-Bernoulli first,
//! Dirichlet-Discrete blocks by increasing dimension, the remaining count
//! families, Normal-Inverse-Chi-Squared last), so every value type occupies a
//! single contiguous range of feature ids:
//!
//! ```text
//! feature id:  0 .. nb        nb .. nb+nc        nb+nc .. n
//!              [ booleans ]   [   counts    ]    [  reals  ]
//! ```
//!
//! [`SchemaIndex`] answers "which family, which offset" for any feature id and
//! is the only component allowed to interpret the flat per-type arrays of a
//! [`ProductValue`](crate::value::ProductValue).

use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::{CrossCatError, Result};

/// Position of a feature in the schema.
pub type FeatureId = u32;

// =============================================================================
// Families and values
// =============================================================================

/// How observed values of a feature are represented on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ValueType {
    Boolean,
    Count,
    Real,
}

impl ValueType {
    pub const ALL: [ValueType; 3] = [ValueType::Boolean, ValueType::Count, ValueType::Real];
}

/// Distribution family of a feature.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureFamily {
    /// `bb`: boolean observations.
    BetaBernoulli,
    /// `dd`: categorical observations in `0..dim`.
    DirichletDiscrete { dim: u32 },
    /// `dpd`: unbounded categorical observations.
    DirichletProcessDiscrete,
    /// `gp`: count observations.
    GammaPoisson,
    /// `bnb`: overdispersed count observations.
    BetaNegativeBinomial,
    /// `nich`: real observations.
    NormalInverseChiSq,
}

impl FeatureFamily {
    /// Short tag used by the wire format and in logs.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::BetaBernoulli => "bb",
            Self::DirichletDiscrete { .. } => "dd",
            Self::DirichletProcessDiscrete => "dpd",
            Self::GammaPoisson => "gp",
            Self::BetaNegativeBinomial => "bnb",
            Self::NormalInverseChiSq => "nich",
        }
    }

    /// Wire representation of observed values.
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::BetaBernoulli => ValueType::Boolean,
            Self::NormalInverseChiSq => ValueType::Real,
            _ => ValueType::Count,
        }
    }

    /// Sort key implementing the canonical family order.
    fn order_key(&self) -> (u8, u32) {
        match *self {
            Self::BetaBernoulli => (0, 0),
            Self::DirichletDiscrete { dim } => (1, dim),
            Self::DirichletProcessDiscrete => (2, 0),
            Self::GammaPoisson => (3, 0),
            Self::BetaNegativeBinomial => (4, 0),
            Self::NormalInverseChiSq => (5, 0),
        }
    }
}

impl fmt::Display for FeatureFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DirichletDiscrete { dim } => write!(f, "dd({dim})"),
            other => f.write_str(other.tag()),
        }
    }
}

/// A single observed value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FeatureValue {
    Boolean(bool),
    Count(u32),
    Real(f32),
}

impl FeatureValue {
    #[inline]
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::Boolean(_) => ValueType::Boolean,
            Self::Count(_) => ValueType::Count,
            Self::Real(_) => ValueType::Real,
        }
    }

    /// Equality of the encoded forms. Reals compare by bit pattern, so
    /// `0.0` and `-0.0` differ.
    #[inline]
    pub fn same_as(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Real(a), Self::Real(b)) => a.to_bits() == b.to_bits(),
            (a, b) => a == b,
        }
    }
}

impl From<bool> for FeatureValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<u32> for FeatureValue {
    fn from(value: u32) -> Self {
        Self::Count(value)
    }
}

impl From<f32> for FeatureValue {
    fn from(value: f32) -> Self {
        Self::Real(value)
    }
}

// =============================================================================
// ProductSchema
// =============================================================================

/// A run of features sharing one family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyBlock {
    pub family: FeatureFamily,
    pub count: usize,
}

/// Declared per-family feature counts, kept in canonical order.
///
/// # Example
///
/// ```
/// use crosscat::schema::{FeatureFamily, ProductSchema};
///
/// let schema = ProductSchema::new()
///     .with(FeatureFamily::GammaPoisson, 2)
///     .with(FeatureFamily::BetaBernoulli, 3);
///
/// // Booleans always come first.
/// assert_eq!(schema.blocks()[0].family, FeatureFamily::BetaBernoulli);
/// assert_eq!(schema.total_feature_count(), 5);
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductSchema {
    blocks: Vec<FamilyBlock>,
}

impl ProductSchema {
    /// Create an empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `count` features of `family`.
    ///
    /// Blocks are re-sorted into canonical order and blocks of the same family
    /// are merged. Zero counts are ignored.
    pub fn with(mut self, family: FeatureFamily, count: usize) -> Self {
        if count == 0 {
            return self;
        }
        match self.blocks.iter_mut().find(|b| b.family == family) {
            Some(block) => block.count += count,
            None => self.blocks.push(FamilyBlock { family, count }),
        }
        self.blocks.sort_by_key(|b| b.family.order_key());
        self
    }

    /// Blocks in canonical order.
    pub fn blocks(&self) -> &[FamilyBlock] {
        &self.blocks
    }

    /// Total number of features across all families.
    pub fn total_feature_count(&self) -> usize {
        self.blocks.iter().map(|b| b.count).sum()
    }

    /// Number of features whose values have the given type.
    pub fn count_of(&self, value_type: ValueType) -> usize {
        self.blocks
            .iter()
            .filter(|b| b.family.value_type() == value_type)
            .map(|b| b.count)
            .sum()
    }
}

// =============================================================================
// SchemaIndex
// =============================================================================

/// Lookup table from feature id to family and per-type offset.
#[derive(Clone, Debug)]
pub struct SchemaIndex {
    schema: ProductSchema,
    families: Vec<FeatureFamily>,
    /// End of the boolean range, end of the count range.
    boolean_end: usize,
    count_end: usize,
}

impl SchemaIndex {
    /// Build the index. The schema is immutable afterwards.
    pub fn new(schema: ProductSchema) -> Self {
        let families: Vec<FeatureFamily> = schema
            .blocks()
            .iter()
            .flat_map(|b| std::iter::repeat(b.family).take(b.count))
            .collect();
        let boolean_end = schema.count_of(ValueType::Boolean);
        let count_end = boolean_end + schema.count_of(ValueType::Count);
        debug_assert_eq!(count_end + schema.count_of(ValueType::Real), families.len());

        Self {
            schema,
            families,
            boolean_end,
            count_end,
        }
    }

    /// The schema this index was built from.
    #[inline]
    pub fn schema(&self) -> &ProductSchema {
        &self.schema
    }

    #[inline]
    pub fn total_feature_count(&self) -> usize {
        self.families.len()
    }

    /// Iterate over every feature id in schema order.
    pub fn feature_ids(&self) -> impl Iterator<Item = FeatureId> {
        0..self.families.len() as FeatureId
    }

    /// Contiguous feature id range holding values of `value_type`.
    #[inline]
    pub fn type_range(&self, value_type: ValueType) -> Range<usize> {
        match value_type {
            ValueType::Boolean => 0..self.boolean_end,
            ValueType::Count => self.boolean_end..self.count_end,
            ValueType::Real => self.count_end..self.families.len(),
        }
    }

    /// Family of a feature.
    pub fn family_of(&self, feature: FeatureId) -> Result<FeatureFamily> {
        self.families
            .get(feature as usize)
            .copied()
            .ok_or_else(|| {
                CrossCatError::schema(
                    feature,
                    format!("schema declares {} features", self.families.len()),
                )
            })
    }

    /// Value type of a feature.
    pub fn value_type_of(&self, feature: FeatureId) -> Result<ValueType> {
        self.family_of(feature).map(|f| f.value_type())
    }

    /// Offset of a feature inside the flat array of its value type.
    pub fn offset_of(&self, feature: FeatureId) -> Result<usize> {
        let value_type = self.value_type_of(feature)?;
        Ok(feature as usize - self.type_range(value_type).start)
    }

    /// Check that `value` is a valid observation of `feature`.
    pub fn check_value(&self, feature: FeatureId, value: &FeatureValue) -> Result<()> {
        let family = self.family_of(feature)?;
        if family.value_type() != value.value_type() {
            return Err(CrossCatError::schema(
                feature,
                format!("{family} expects {:?}, got {value:?}", family.value_type()),
            ));
        }
        match (family, value) {
            (FeatureFamily::DirichletDiscrete { dim }, FeatureValue::Count(c)) if *c >= dim => {
                Err(CrossCatError::schema(
                    feature,
                    format!("category {c} out of range for {family}"),
                ))
            }
            (_, FeatureValue::Real(x)) if !x.is_finite() => Err(CrossCatError::schema(
                feature,
                format!("real value {x} is not finite"),
            )),
            _ => Ok(()),
        }
    }
}
