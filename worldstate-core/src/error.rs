use thiserror::Error;

use crate::entity::EntityId;

/// Failures raised by the merge engine and the wire codec.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateError {
    /// The string is not a well-formed entity id.
    #[error("invalid entity id {0:?}")]
    InvalidEntityId(String),

    /// A patch could not be applied to the store. Only that patch is rejected.
    #[error("invalid patch for {id}: {reason}")]
    InvalidPatch { id: EntityId, reason: String },

    /// The snapshot blob could not be decompressed, parsed or validated.
    /// The store is left untouched when this is returned.
    #[error("corrupt snapshot: {0}")]
    CorruptSnapshot(String),

    /// A tick message blob could not be decompressed or parsed.
    #[error("corrupt tick message: {0}")]
    CorruptMessage(String),

    /// Encoding an outbound payload failed.
    #[error("encode failed: {0}")]
    Encode(String),
}

impl StateError {
    pub(crate) fn invalid_patch(id: &EntityId, reason: impl Into<String>) -> Self {
        Self::InvalidPatch {
            id: *id,
            reason: reason.into(),
        }
    }
}
