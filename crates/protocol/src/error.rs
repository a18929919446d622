//! Protocol error types

use crate::types::ValueType;
use thiserror::Error;

/// Protocol-level errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame is shorter than its fixed header and trailer
    #[error("Incomplete frame: expected at least {expected} bytes, got {actual}")]
    IncompleteFrame { expected: usize, actual: usize },

    /// Endpoint id collides with the read flag bit
    #[error("Endpoint id {0:#06x} out of range")]
    EndpointIdOutOfRange(u16),

    /// Sequence number uses reserved bits
    #[error("Sequence number {0:#06x} out of range")]
    SequenceOutOfRange(u16),

    /// Raw value bytes don't match the declared width of the type
    #[error("Invalid width for {value_type}: expected {expected} bytes, got {actual}")]
    InvalidWidth {
        value_type: ValueType,
        expected: usize,
        actual: usize,
    },

    /// Requested type doesn't match the value's tag
    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: ValueType, found: String },

    /// Text could not be converted into a value of the given type
    #[error("Cannot parse '{text}' as {value_type}")]
    ParseValue { value_type: ValueType, text: String },

    /// Device-supplied JSON schema is unusable
    #[error("Malformed schema: {0}")]
    MalformedSchema(String),

    /// JSON syntax error in the schema text
    #[error("Schema JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error while encoding or decoding a frame
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl ProtocolError {
    /// Shorthand for a [`ProtocolError::MalformedSchema`] with a formatted reason
    pub(crate) fn schema(reason: impl Into<String>) -> Self {
        ProtocolError::MalformedSchema(reason.into())
    }

    /// True for every error that means the schema can't be trusted
    pub fn is_schema_error(&self) -> bool {
        matches!(
            self,
            ProtocolError::MalformedSchema(_) | ProtocolError::Json(_)
        )
    }
}
