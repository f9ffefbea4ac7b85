//! Error taxonomy shared by the codec, diff engine and assignment model.
//!
//! The variants map onto how callers are expected to react:
//!
//! - [`CrossCatError::SchemaMismatch`] / [`CrossCatError::MalformedValue`]:
//!   surfaced immediately, never coerced into a default value.
//! - [`CrossCatError::StructuralViolation`]: the attempted mutation was rolled
//!   back; kernels treat it as a rejected move and try another candidate.
//! - [`CrossCatError::Underflow`]: group accounting already diverged before
//!   the call. Fatal.

use thiserror::Error;

use crate::config::ConfigError;
use crate::schema::FeatureId;

/// Result alias used throughout the crate.
pub type Result<T, E = CrossCatError> = std::result::Result<T, E>;

/// Errors raised by the CrossCat core.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CrossCatError {
    /// Feature id or value type outside the declared schema.
    #[error("schema mismatch for feature {feature}: {reason}")]
    SchemaMismatch { feature: FeatureId, reason: String },

    /// A wire value violates a codec invariant.
    #[error("malformed value: {0}")]
    MalformedValue(String),

    /// A mutation would break the partition or reference a missing group.
    #[error("structural violation: {0}")]
    StructuralViolation(String),

    /// A group count would go negative.
    #[error("group {group} in kind {kind} would underflow")]
    Underflow { kind: usize, group: u32 },

    /// Invalid runtime configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl CrossCatError {
    pub(crate) fn schema(feature: FeatureId, reason: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            feature,
            reason: reason.into(),
        }
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedValue(reason.into())
    }

    pub(crate) fn structural(reason: impl Into<String>) -> Self {
        Self::StructuralViolation(reason.into())
    }

    /// Rejected moves can be retried with another candidate.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StructuralViolation(_))
    }

    /// The model state can no longer be trusted.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Underflow { .. })
    }
}
