//! Protocol error types.

use thiserror::Error;

/// Errors produced while encoding or decoding wire frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The envelope or payload did not match the schema for its kind.
    #[error("malformed {kind} message: {reason}")]
    Malformed { kind: String, reason: String },

    /// The kind tag is not part of the closed enumeration.
    ///
    /// Receivers log this and drop the message; it is not fatal to the
    /// connection.
    #[error("unknown message kind: {kind}")]
    UnknownKind { kind: String },

    /// A frame failed to serialize on the way out.
    #[error("failed to encode {kind} frame: {reason}")]
    Encode { kind: String, reason: String },
}

impl ProtocolError {
    /// Build a [`ProtocolError::Malformed`] for the given kind.
    pub fn malformed(kind: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Malformed {
            kind: kind.into(),
            reason: reason.into(),
        }
    }
}
