//! Partition state of a CrossCat model.
//!
//! - [`crosscat`]: plain data ([`CrossCat`], [`Kind`], [`Group`])
//! - [`family`]: per-feature payloads ([`SharedParams`], [`FamilyStats`])
//! - [`assignment`]: the transactional [`AssignmentModel`]
//! - [`shared`]: snapshot/commit wrapper for concurrent kernels

pub mod assignment;
pub mod crosscat;
pub mod family;
pub mod shared;

pub use assignment::{AssignmentModel, StatsAudit};
pub use crosscat::{Assignment, CrossCat, Group, GroupId, HyperPrior, Kind, ParamGrids, Topology};
pub use family::{FamilyStats, FamilyStatsError, SharedParams};
pub use shared::SharedModel;
