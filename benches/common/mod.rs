//! Shared benchmark utilities.

pub mod criterion_config;
