//! Native binary format for models and checkpoints.
//!
//! The format consists of a 32-byte header followed by a Postcard-encoded
//! [`Payload`].
//!
//! # Format Structure
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                    Header (32 bytes)                        │
//! ├────────────────────────────────────────────────────────────┤
//! │                    Payload (variable)                       │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use crosscat::io::NativeCodec;
//!
//! let codec = NativeCodec::new();
//! let bytes = codec.serialize_checkpoint(&checkpoint, &model)?;
//! let (checkpoint, model) = codec.deserialize_checkpoint(&bytes)?;
//! ```

use std::io::{Read, Write};
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use super::checkpoint::Checkpoint;
use super::payload::{CheckpointPayload, ModelPayload, Payload, PayloadBody, PayloadV1};
use crate::error::CrossCatError;
use crate::model::AssignmentModel;
use crate::schema::SchemaIndex;
use crate::value::SparsityPolicy;

// ============================================================================
// Constants
// ============================================================================

/// Magic bytes identifying a CrossCat file.
pub const MAGIC: &[u8; 4] = b"XCAT";

/// Current format version (major).
pub const CURRENT_VERSION_MAJOR: u8 = 1;

/// Current format version (minor).
pub const CURRENT_VERSION_MINOR: u8 = 0;

/// Size of the format header in bytes.
pub const HEADER_SIZE: usize = 32;

// ============================================================================
// Payload Kind
// ============================================================================

/// What the payload holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadKind {
    /// Partition state and rows.
    Model = 0,
    /// Model plus resumable schedule state.
    Checkpoint = 1,
}

impl PayloadKind {
    /// Convert from u8, returning None for unknown values.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Model),
            1 => Some(Self::Checkpoint),
            _ => None,
        }
    }
}

// ============================================================================
// Format Flags
// ============================================================================

/// Bitfield flags describing the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FormatFlags(u16);

impl FormatFlags {
    /// The CrossCat carries a hyperparameter grid.
    pub const HAS_HYPER_PRIOR: u16 = 1 << 0;
    /// At least one row is stored.
    pub const HAS_ROWS: u16 = 1 << 1;
    /// The checkpoint marks a finished run.
    pub const FINISHED: u16 = 1 << 2;

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn contains(self, flag: u16) -> bool {
        (self.0 & flag) != 0
    }

    pub fn set(&mut self, flag: u16) {
        self.0 |= flag;
    }

    pub fn clear(&mut self, flag: u16) {
        self.0 &= !flag;
    }
}

// ============================================================================
// Format Header
// ============================================================================

/// 32-byte header for the native storage format.
///
/// # Layout
///
/// ```text
/// Offset  Size  Field
/// ------  ----  -----
/// 0       4     Magic ("XCAT")
/// 4       1     Version major
/// 5       1     Version minor
/// 6       1     Payload kind
/// 7       1     Reserved (padding)
/// 8       2     Flags (bitfield)
/// 10      2     Reserved
/// 12      4     Payload size (bytes)
/// 16      4     CRC32 checksum of payload
/// 20      4     Number of features
/// 24      4     Number of kinds
/// 28      4     Reserved
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatHeader {
    pub version_major: u8,
    pub version_minor: u8,
    pub kind: PayloadKind,
    pub flags: FormatFlags,
    /// Size of the payload in bytes.
    pub payload_size: u32,
    /// CRC32 checksum of the payload.
    pub checksum: u32,
    pub num_features: u32,
    pub num_kinds: u32,
}

impl FormatHeader {
    /// Create a new header with current version.
    pub fn new(kind: PayloadKind, num_features: u32, num_kinds: u32) -> Self {
        Self {
            version_major: CURRENT_VERSION_MAJOR,
            version_minor: CURRENT_VERSION_MINOR,
            kind,
            flags: FormatFlags::empty(),
            payload_size: 0,
            checksum: 0,
            num_features,
            num_kinds,
        }
    }

    /// Serialize header to 32 bytes.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(MAGIC);
        buf[4] = self.version_major;
        buf[5] = self.version_minor;
        buf[6] = self.kind as u8;
        buf[8..10].copy_from_slice(&self.flags.bits().to_le_bytes());
        buf[12..16].copy_from_slice(&self.payload_size.to_le_bytes());
        buf[16..20].copy_from_slice(&self.checksum.to_le_bytes());
        buf[20..24].copy_from_slice(&self.num_features.to_le_bytes());
        buf[24..28].copy_from_slice(&self.num_kinds.to_le_bytes());
        buf
    }

    /// Parse header from 32 bytes.
    pub fn from_bytes(buf: &[u8; HEADER_SIZE]) -> Result<Self, DeserializeError> {
        if &buf[0..4] != MAGIC {
            return Err(DeserializeError::NotCrossCat);
        }

        let version_major = buf[4];
        let version_minor = buf[5];
        if version_major > CURRENT_VERSION_MAJOR {
            return Err(DeserializeError::UnsupportedVersion {
                major: version_major,
                minor: version_minor,
            });
        }

        let kind = PayloadKind::from_u8(buf[6])
            .ok_or_else(|| DeserializeError::CorruptPayload(format!("invalid payload kind {}", buf[6])))?;
        let word = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);

        Ok(Self {
            version_major,
            version_minor,
            kind,
            flags: FormatFlags::from_bits(u16::from_le_bytes([buf[8], buf[9]])),
            payload_size: word(12),
            checksum: word(16),
            num_features: word(20),
            num_kinds: word(24),
        })
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during serialization.
#[derive(Debug, Error)]
pub enum SerializeError {
    /// I/O error during writing.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Postcard encoding error.
    #[error("encoding error: {0}")]
    Encoding(#[from] postcard::Error),

    /// The model could not be captured.
    #[error("model error: {0}")]
    Model(#[from] CrossCatError),

    /// Payload larger than the header can describe.
    #[error("payload of {0} bytes exceeds the 4 GiB format limit")]
    TooLarge(usize),
}

/// Errors that can occur during deserialization.
#[derive(Debug, Error)]
pub enum DeserializeError {
    /// Wrong magic bytes.
    #[error("not a CrossCat file")]
    NotCrossCat,

    /// File written by a newer format version.
    #[error("unsupported format version {major}.{minor}")]
    UnsupportedVersion { major: u8, minor: u8 },

    /// Payload checksum doesn't match.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// File was truncated or incomplete.
    #[error("file truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// Payload is corrupt or malformed.
    #[error("corrupt payload: {0}")]
    CorruptPayload(String),

    /// I/O error during reading.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Postcard decoding error.
    #[error("decoding error: {0}")]
    Decoding(#[from] postcard::Error),

    /// The decoded model violates its invariants.
    #[error("invalid model: {0}")]
    Model(#[from] CrossCatError),

    /// Payload kind differs from the one requested.
    #[error("payload kind mismatch: expected {expected:?}, got {actual:?}")]
    KindMismatch {
        expected: PayloadKind,
        actual: PayloadKind,
    },
}

// ============================================================================
// CRC32 Helper
// ============================================================================

/// Compute CRC32 checksum of data.
pub fn compute_checksum(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

// ============================================================================
// Native Codec
// ============================================================================

/// Codec for models and checkpoints in the native format.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeCodec {
    /// Mask encoding of stored rows.
    sparsity: SparsityPolicy,
}

impl NativeCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode stored rows with `policy` instead of [`SparsityPolicy::WireSize`].
    pub fn with_sparsity(mut self, policy: SparsityPolicy) -> Self {
        self.sparsity = policy;
        self
    }

    /// Write header and payload to a writer.
    pub fn write_to<W: Write>(
        &self,
        writer: &mut W,
        header: &mut FormatHeader,
        payload: &[u8],
    ) -> Result<(), SerializeError> {
        header.payload_size =
            u32::try_from(payload.len()).map_err(|_| SerializeError::TooLarge(payload.len()))?;
        header.checksum = compute_checksum(payload);
        writer.write_all(&header.to_bytes())?;
        writer.write_all(payload)?;
        Ok(())
    }

    /// Read header and payload from a reader.
    pub fn read_from<R: Read>(&self, reader: &mut R) -> Result<(FormatHeader, Vec<u8>), DeserializeError> {
        let mut header_buf = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header_buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                DeserializeError::Truncated {
                    expected: HEADER_SIZE,
                    actual: 0,
                }
            } else {
                DeserializeError::Io(e)
            }
        })?;

        let header = FormatHeader::from_bytes(&header_buf)?;

        let expected = header.payload_size as usize;
        let mut payload = Vec::with_capacity(expected);
        reader.take(expected as u64).read_to_end(&mut payload)?;
        if payload.len() != expected {
            return Err(DeserializeError::Truncated {
                expected,
                actual: payload.len(),
            });
        }

        let actual_checksum = compute_checksum(&payload);
        if actual_checksum != header.checksum {
            return Err(DeserializeError::ChecksumMismatch {
                expected: header.checksum,
                actual: actual_checksum,
            });
        }

        Ok((header, payload))
    }

    /// Serialize a payload to bytes with header.
    ///
    /// For streaming, use `write_to` instead.
    pub fn serialize(&self, mut header: FormatHeader, payload: &Payload) -> Result<Vec<u8>, SerializeError> {
        let payload_bytes = postcard::to_allocvec(payload)?;
        let mut output = Vec::with_capacity(HEADER_SIZE + payload_bytes.len());
        self.write_to(&mut output, &mut header, &payload_bytes)?;
        Ok(output)
    }

    /// Deserialize a payload from bytes.
    ///
    /// For streaming, use `read_from` instead.
    pub fn deserialize(&self, bytes: &[u8]) -> Result<(FormatHeader, Payload), DeserializeError> {
        let mut cursor = std::io::Cursor::new(bytes);
        let (header, payload_bytes) = self.read_from(&mut cursor)?;
        let payload = postcard::from_bytes(&payload_bytes)?;
        Ok((header, payload))
    }

    // ========================================================================
    // Models and checkpoints
    // ========================================================================

    pub fn serialize_model(&self, model: &AssignmentModel) -> Result<Vec<u8>, SerializeError> {
        let header = model_header(PayloadKind::Model, model);
        let body = PayloadBody::Model(ModelPayload::from_model(model, self.sparsity)?);
        self.serialize(header, &wrap(model, body))
    }

    pub fn deserialize_model(&self, bytes: &[u8]) -> Result<AssignmentModel, DeserializeError> {
        let (header, index, body) = self.open(bytes, PayloadKind::Model)?;
        let PayloadBody::Model(model) = body else {
            return Err(body_mismatch(PayloadKind::Model));
        };
        restore(&header, index, model)
    }

    pub fn serialize_checkpoint(
        &self,
        checkpoint: &Checkpoint,
        model: &AssignmentModel,
    ) -> Result<Vec<u8>, SerializeError> {
        let mut header = model_header(PayloadKind::Checkpoint, model);
        if checkpoint.finished {
            header.flags.set(FormatFlags::FINISHED);
        }
        let body = PayloadBody::Checkpoint(CheckpointPayload {
            checkpoint: *checkpoint,
            model: ModelPayload::from_model(model, self.sparsity)?,
        });
        let bytes = self.serialize(header, &wrap(model, body))?;
        debug!(
            tardis_iter = checkpoint.tardis_iter,
            bytes = bytes.len(),
            "checkpoint serialized"
        );
        Ok(bytes)
    }

    pub fn deserialize_checkpoint(
        &self,
        bytes: &[u8],
    ) -> Result<(Checkpoint, AssignmentModel), DeserializeError> {
        let (header, index, body) = self.open(bytes, PayloadKind::Checkpoint)?;
        let PayloadBody::Checkpoint(payload) = body else {
            return Err(body_mismatch(PayloadKind::Checkpoint));
        };
        check_flag(&header, FormatFlags::FINISHED, "FINISHED", payload.checkpoint.finished)?;
        let model = restore(&header, index, payload.model)?;
        Ok((payload.checkpoint, model))
    }

    fn open(
        &self,
        bytes: &[u8],
        expected: PayloadKind,
    ) -> Result<(FormatHeader, Arc<SchemaIndex>, PayloadBody), DeserializeError> {
        let (header, payload) = self.deserialize(bytes)?;
        if header.kind != expected {
            return Err(DeserializeError::KindMismatch {
                expected,
                actual: header.kind,
            });
        }
        let Payload::V1(PayloadV1 { schema, body }) = payload;
        let index = Arc::new(SchemaIndex::new(schema));
        if index.total_feature_count() != header.num_features as usize {
            return Err(DeserializeError::CorruptPayload(format!(
                "header declares {} features, schema has {}",
                header.num_features,
                index.total_feature_count()
            )));
        }
        Ok((header, index, body))
    }
}

fn model_header(kind: PayloadKind, model: &AssignmentModel) -> FormatHeader {
    let mut header = FormatHeader::new(
        kind,
        model.index().total_feature_count() as u32,
        model.kind_count() as u32,
    );
    if model.crosscat().hyper_prior.is_some() {
        header.flags.set(FormatFlags::HAS_HYPER_PRIOR);
    }
    if model.row_count() > 0 {
        header.flags.set(FormatFlags::HAS_ROWS);
    }
    header
}

fn wrap(model: &AssignmentModel, body: PayloadBody) -> Payload {
    Payload::V1(PayloadV1 {
        schema: model.index().schema().clone(),
        body,
    })
}

fn restore(
    header: &FormatHeader,
    index: Arc<SchemaIndex>,
    payload: ModelPayload,
) -> Result<AssignmentModel, DeserializeError> {
    if payload.crosscat.kinds.len() != header.num_kinds as usize {
        return Err(DeserializeError::CorruptPayload(format!(
            "header declares {} kinds, payload has {}",
            header.num_kinds,
            payload.crosscat.kinds.len()
        )));
    }
    check_flag(
        header,
        FormatFlags::HAS_HYPER_PRIOR,
        "HAS_HYPER_PRIOR",
        payload.crosscat.hyper_prior.is_some(),
    )?;
    check_flag(header, FormatFlags::HAS_ROWS, "HAS_ROWS", !payload.rows.is_empty())?;
    Ok(payload.into_model(index)?)
}

fn check_flag(
    header: &FormatHeader,
    flag: u16,
    name: &str,
    present: bool,
) -> Result<(), DeserializeError> {
    if header.flags.contains(flag) != present {
        return Err(DeserializeError::CorruptPayload(format!(
            "header flag {name} disagrees with the payload"
        )));
    }
    Ok(())
}

fn body_mismatch(expected: PayloadKind) -> DeserializeError {
    DeserializeError::CorruptPayload(format!("payload body does not match header kind {expected:?}"))
}

// ============================================================================
// Tests
// ============================================================================
