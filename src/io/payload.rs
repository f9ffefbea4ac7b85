//! Payload structures for the native storage format.
//!
//! These structs are designed for serialization with Postcard. Row values
//! are stored in their wire form ([`Row`] with an ingestion diff), so the
//! payload never depends on the in-memory row table layout.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::checkpoint::Checkpoint;
use crate::error::{CrossCatError, Result};
use crate::model::{AssignmentModel, CrossCat};
use crate::schema::{ProductSchema, SchemaIndex};
use crate::value::{DiffEngine, Row, RowId, SparseCodec, SparsityPolicy};

// ============================================================================
// Top-Level Payload
// ============================================================================

/// Version-tagged payload enum for forward compatibility.
///
/// New format versions add new variants rather than modifying existing ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// Version 1 payload format.
    V1(PayloadV1),
}

/// Version 1 payload structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadV1 {
    pub schema: ProductSchema,
    pub body: PayloadBody,
}

/// Kind-specific payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PayloadBody {
    Model(ModelPayload),
    Checkpoint(CheckpointPayload),
}

// ============================================================================
// Model Payloads
// ============================================================================

/// Partition state plus the row table.
///
/// Row → group assignments travel inside the kinds of `crosscat`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPayload {
    pub crosscat: CrossCat,
    pub rows: Vec<Row>,
}

impl ModelPayload {
    /// Capture a model, encoding each stored row as an ingestion diff
    /// whose mask follows `sparsity`.
    pub fn from_model(model: &AssignmentModel, sparsity: SparsityPolicy) -> Result<Self> {
        let engine =
            DiffEngine::with_codec(SparseCodec::new(model.index()).with_policy(sparsity));
        let rows = model
            .rows()
            .map(|(id, values)| Ok(Row::new(id, engine.from_values(values)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            crosscat: model.crosscat().clone(),
            rows,
        })
    }

    /// Rebuild the model, checking every invariant.
    pub fn into_model(self, index: Arc<SchemaIndex>) -> Result<AssignmentModel> {
        let engine = DiffEngine::new(&index);
        let mut rows: BTreeMap<RowId, _> = BTreeMap::new();
        for row in &self.rows {
            let values = engine.apply_values(&Default::default(), &row.diff)?;
            if rows.insert(row.id, values).is_some() {
                return Err(CrossCatError::structural(format!(
                    "row {} stored twice",
                    row.id
                )));
            }
        }
        AssignmentModel::from_parts(index, self.crosscat, rows)
    }
}

/// A checkpoint together with the model it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointPayload {
    pub checkpoint: Checkpoint,
    pub model: ModelPayload,
}
