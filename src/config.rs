//! Runtime configuration with builder pattern.
//!
//! [`EngineConfig`] groups the engine's runtime parameters into nested
//! blocks (schedule, kernels, query). It is built either with the `bon`
//! builder, validated at `build()`, or parsed from JSON, where every
//! missing key falls back to its default.
//!
//! # Example
//!
//! ```
//! use crosscat::config::{EngineConfig, QueryConfig};
//!
//! // All defaults
//! let config = EngineConfig::builder().build().unwrap();
//! assert_eq!(config.seed, 0);
//!
//! // Partial JSON
//! let config = EngineConfig::from_json(r#"{"seed": 7, "query": {"parallel": false}}"#).unwrap();
//! assert_eq!(config.seed, 7);
//! assert_eq!(config.query.entropy_sample_count, QueryConfig::default().entropy_sample_count);
//! ```

use bon::Builder;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::rng::RngFactory;
use crate::utils::Parallelism;
use crate::value::SparsityPolicy;

// =============================================================================
// ConfigError
// =============================================================================

/// Errors that can occur during configuration validation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// A parameter is outside its valid range.
    #[error("{field} {reason}")]
    Invalid { field: &'static str, reason: String },

    /// The JSON document could not be parsed.
    #[error("invalid config JSON: {0}")]
    Json(String),
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

// =============================================================================
// Nested parameter groups
// =============================================================================

/// Annealing schedule of the inference driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Passes over the data after every row is assigned.
    pub extra_passes: f64,
    /// Row count below which the kind kernel runs on every pass.
    pub small_data_size: f64,
    /// Row count above which the kind kernel is skipped.
    pub big_data_size: f64,
    /// Consecutive rejected kind proposals before giving up.
    pub max_reject_iters: u32,
    pub checkpoint_period_sec: f64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            extra_passes: 500.0,
            small_data_size: 4e3,
            big_data_size: 1e9,
            max_reject_iters: 100,
            checkpoint_period_sec: 1e9,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatKernelConfig {
    /// Empty groups kept available per kind for new rows.
    pub empty_group_count: u32,
    /// `0` processes rows inline.
    pub row_queue_capacity: u32,
    pub parser_threads: u32,
}

impl Default for CatKernelConfig {
    fn default() -> Self {
        Self {
            empty_group_count: 1,
            row_queue_capacity: 255,
            parser_threads: 6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HyperKernelConfig {
    pub run: bool,
    pub parallel: bool,
}

impl Default for HyperKernelConfig {
    fn default() -> Self {
        Self {
            run: true,
            parallel: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KindKernelConfig {
    /// Kind proposals per pass. `0` disables the kernel.
    pub iterations: u32,
    /// Empty kinds kept available as move targets.
    pub empty_kind_count: u32,
    pub row_queue_capacity: u32,
    pub parser_threads: u32,
    /// Score feature moves on the rayon pool.
    pub score_parallel: bool,
}

impl Default for KindKernelConfig {
    fn default() -> Self {
        Self {
            iterations: 32,
            empty_kind_count: 32,
            row_queue_capacity: 255,
            parser_threads: 6,
            score_parallel: true,
        }
    }
}

/// Per-kernel parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub cat: CatKernelConfig,
    pub hyper: HyperKernelConfig,
    pub kind: KindKernelConfig,
}

/// Query evaluation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub parallel: bool,
    /// Samples drawn per `sample` request when the caller gives none.
    pub sample_sample_count: usize,
    /// Monte Carlo samples per entropy estimate.
    pub entropy_sample_count: usize,
    /// Monte Carlo samples per entropy term of a mutual information estimate.
    pub mutual_information_sample_count: usize,
    pub similar_row_limit: usize,
    /// Maximum set count per entropy request; longer lists are tiled.
    pub tile_size: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            parallel: true,
            sample_sample_count: 10,
            entropy_sample_count: 1000,
            mutual_information_sample_count: 1000,
            similar_row_limit: 1000,
            tile_size: 500,
        }
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Runtime configuration of the engine.
///
/// # Structure
///
/// - **Reproducibility**: `seed`
/// - **Resources**: `target_mem_bytes`, `n_threads`
/// - **Schedule**: [`ScheduleConfig`]
/// - **Kernels**: [`KernelConfig`]
/// - **Query**: [`QueryConfig`]
/// - **Wire**: `sparsity`, the SPARSE/DENSE crossover rule
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[builder(
    derive(Clone, Debug),
    finish_fn(vis = "", name = __build_internal)
)]
#[serde(default)]
pub struct EngineConfig {
    // === Reproducibility ===
    /// Root seed of every random stream. Default: 0.
    #[builder(default)]
    pub seed: u64,

    // === Resource control ===
    /// Memory budget in bytes. Default: 4e9.
    #[builder(default = 4_000_000_000)]
    pub target_mem_bytes: u64,

    /// Number of threads. `0` uses all available cores.
    #[builder(default)]
    pub n_threads: usize,

    // === Nested parameter groups ===
    #[builder(default)]
    pub schedule: ScheduleConfig,

    #[builder(default)]
    pub kernels: KernelConfig,

    #[builder(default)]
    pub query: QueryConfig,

    // === Wire format ===
    #[builder(default)]
    pub sparsity: SparsityPolicy,
}

/// Custom finishing function that validates the config.
impl<S: engine_config_builder::IsComplete> EngineConfigBuilder<S> {
    /// Build and validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if any parameter is out of range.
    pub fn build(self) -> Result<EngineConfig, ConfigError> {
        let config = self.__build_internal();
        config.validate()?;
        Ok(config)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::builder().__build_internal()
    }
}

impl EngineConfig {
    /// Parse and validate a JSON document. Missing keys take defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Json(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Pretty-printed JSON with every key filled in.
    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Json(e.to_string()))
    }

    /// The same configuration with all parallelism and queueing disabled.
    pub fn sequential(mut self) -> Self {
        self.n_threads = 1;
        self.kernels.cat.row_queue_capacity = 0;
        self.kernels.hyper.parallel = false;
        self.kernels.kind.row_queue_capacity = 0;
        self.kernels.kind.score_parallel = false;
        self.query.parallel = false;
        self
    }

    #[inline]
    pub fn rng_factory(&self) -> RngFactory {
        RngFactory::new(self.seed)
    }

    #[inline]
    pub fn query_parallelism(&self) -> Parallelism {
        Parallelism::from_flag(self.query.parallel && self.n_threads != 1)
    }

    /// Parallelism of [`score_candidates`](crate::rng::score_candidates)
    /// when the kind kernel scores feature moves.
    #[inline]
    pub fn kind_score_parallelism(&self) -> Parallelism {
        Parallelism::from_flag(self.kernels.kind.score_parallel && self.n_threads != 1)
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.target_mem_bytes == 0 {
            return Err(ConfigError::invalid("target_mem_bytes", "must be positive"));
        }

        let schedule = &self.schedule;
        if !(schedule.extra_passes.is_finite() && schedule.extra_passes > 0.0) {
            return Err(ConfigError::invalid(
                "schedule.extra_passes",
                format!("must be positive, got {}", schedule.extra_passes),
            ));
        }
        if !(schedule.small_data_size >= 0.0 && schedule.small_data_size <= schedule.big_data_size) {
            return Err(ConfigError::invalid(
                "schedule.small_data_size",
                format!(
                    "must lie in [0, big_data_size = {}], got {}",
                    schedule.big_data_size, schedule.small_data_size
                ),
            ));
        }
        if !(schedule.checkpoint_period_sec > 0.0) {
            return Err(ConfigError::invalid(
                "schedule.checkpoint_period_sec",
                "must be positive",
            ));
        }

        if self.kernels.cat.empty_group_count == 0 {
            return Err(ConfigError::invalid(
                "kernels.cat.empty_group_count",
                "must be at least 1",
            ));
        }

        let query = &self.query;
        for (field, value) in [
            ("query.sample_sample_count", query.sample_sample_count),
            ("query.entropy_sample_count", query.entropy_sample_count),
            (
                "query.mutual_information_sample_count",
                query.mutual_information_sample_count,
            ),
            ("query.tile_size", query.tile_size),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be at least 1"));
            }
        }

        if let SparsityPolicy::MaxDensity { density } = self.sparsity {
            if !(density > 0.0 && density <= 1.0) {
                return Err(ConfigError::invalid(
                    "sparsity.density",
                    format!("must be in (0, 1], got {density}"),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_match_json_defaults() {
        let built = EngineConfig::builder().build().unwrap();
        let parsed = EngineConfig::from_json("{}").unwrap();
        assert_eq!(built, parsed);
        assert_eq!(built.target_mem_bytes, 4_000_000_000);
        assert_eq!(built.kernels.kind.iterations, 32);
        assert_eq!(built.schedule.max_reject_iters, 100);
        assert_eq!(built.sparsity, SparsityPolicy::WireSize);
    }

    #[test]
    fn nested_json_keeps_sibling_defaults() {
        let config =
            EngineConfig::from_json(r#"{"kernels": {"kind": {"iterations": 0}}}"#).unwrap();
        assert_eq!(config.kernels.kind.iterations, 0);
        assert_eq!(config.kernels.kind.empty_kind_count, 32);
        assert_eq!(config.kernels.cat, CatKernelConfig::default());
    }

    #[test]
    fn json_roundtrip() {
        let config = EngineConfig::builder()
            .seed(12)
            .sparsity(SparsityPolicy::MaxDensity { density: 0.25 })
            .build()
            .unwrap();
        let json = config.to_json().unwrap();
        assert_eq!(EngineConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = EngineConfig::builder()
            .sparsity(SparsityPolicy::MaxDensity { density: 1.5 })
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "sparsity.density", .. }));

        let err = EngineConfig::from_json(r#"{"query": {"tile_size": 0}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "query.tile_size", .. }));

        assert!(matches!(
            EngineConfig::from_json("{not json"),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn sequential_disables_parallelism() {
        let config = EngineConfig::default().sequential();
        assert_eq!(config.query_parallelism(), Parallelism::Sequential);
        assert_eq!(config.kind_score_parallelism(), Parallelism::Sequential);
        assert!(!config.kernels.hyper.parallel);
        assert_eq!(config.kernels.cat.row_queue_capacity, 0);
    }
}
