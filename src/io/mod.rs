//! Persistence: checkpoints, the native file format and row streams.

pub mod checkpoint;
#[cfg(feature = "storage")]
pub mod native;
pub mod payload;
pub mod stream;

pub use checkpoint::{AnnealingState, Checkpoint, Schedule, StreamInterval};
#[cfg(feature = "storage")]
pub use native::{DeserializeError, FormatFlags, FormatHeader, NativeCodec, PayloadKind, SerializeError};
pub use payload::{CheckpointPayload, ModelPayload, Payload, PayloadBody, PayloadV1};
pub use stream::{RowStreamReader, RowStreamWriter, StreamError};
