//! crosscat: the data model and wire layer of a CrossCat inference engine.
//!
//! CrossCat partitions features into *kinds* and, inside each kind, rows into
//! *groups*. This crate provides:
//!
//! - [`schema`]: typed feature schemas in canonical family order
//! - [`value`]: the sparse/dense row codec and diffs between rows
//! - [`model`]: the kind/group partition with transactional mutations and a
//!   concurrent [`SharedModel`](model::SharedModel)
//! - [`query`]: scoring, sampling and entropy queries over a snapshot
//! - [`io`]: checkpoints, the native file format and row streams
//! - [`rng`]: reproducible per-kernel random streams
//!
//! Posterior math is delegated to a [`Posterior`](query::Posterior)
//! implementation.

pub mod config;
pub mod error;
pub mod io;
pub mod model;
pub mod query;
pub mod rng;
pub mod schema;
pub mod testing;
pub mod utils;
pub mod value;

pub use config::EngineConfig;
pub use error::{CrossCatError, Result};
pub use model::{AssignmentModel, CrossCat, SharedModel};
pub use query::{Posterior, QueryServer};
pub use schema::{FeatureFamily, FeatureId, FeatureValue, ProductSchema, SchemaIndex};
pub use value::{Diff, DiffEngine, FeatureValues, ProductValue, Row, RowId, SparseCodec};
