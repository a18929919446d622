//! Backend error types

use crate::session::SessionState;
use common::TransportError;
use protocol::ProtocolError;
use thiserror::Error;

/// Errors surfaced by sessions and the device registry
#[derive(Debug, Error)]
pub enum BackendError {
    /// No matching response within the protocol timeout
    #[error("Transfer timed out")]
    TransportTimeout,

    /// The device stopped answering or went away
    #[error("Device disconnected")]
    TransportDisconnected,

    /// Any other USB failure during a transfer
    #[error("USB transfer failed: {0}")]
    Usb(TransportError),

    #[error("Unknown endpoint '{0}'")]
    UnknownEndpoint(String),

    /// Requested type doesn't match the endpoint's declared type
    #[error("Type mismatch: endpoint is {expected}, got {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("Malformed schema: {0}")]
    MalformedSchema(String),

    #[error("No free slot for device with serial {serial_number:012X}")]
    NoFreeSlot { serial_number: u64 },

    /// Operation attempted outside the `Ready` state
    #[error("Session not ready (state: {0})")]
    NotReady(SessionState),

    #[error("'{0}' is not a function")]
    NotAFunction(String),

    #[error("'{0}' is read-only")]
    ReadOnly(String),

    #[error("Slot {0} is empty")]
    SlotEmpty(usize),

    #[error("Invalid endpoint path '{0}'")]
    InvalidPath(String),

    #[error("Device did not report a serial number")]
    MissingSerialNumber,

    /// Opening or claiming the device failed
    #[error("Failed to open device: {0}")]
    Open(TransportError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(ProtocolError),
}

/// Type alias for backend results
pub type Result<T> = std::result::Result<T, BackendError>;

impl BackendError {
    /// Errors that leave the link unusable and flip the session to disconnected
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            BackendError::TransportTimeout
                | BackendError::TransportDisconnected
                | BackendError::Usb(_)
        )
    }
}

impl From<TransportError> for BackendError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => BackendError::TransportTimeout,
            TransportError::Disconnected | TransportError::NotFound => {
                BackendError::TransportDisconnected
            }
            other => BackendError::Usb(other),
        }
    }
}

impl From<ProtocolError> for BackendError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::MalformedSchema(reason) => BackendError::MalformedSchema(reason),
            ProtocolError::Json(e) => BackendError::MalformedSchema(e.to_string()),
            ProtocolError::TypeMismatch { expected, found } => BackendError::TypeMismatch {
                expected: expected.to_string(),
                found,
            },
            ProtocolError::InvalidWidth {
                value_type,
                expected,
                actual,
            } => BackendError::TypeMismatch {
                expected: format!("{} ({} bytes)", value_type, expected),
                found: format!("{} bytes", actual),
            },
            other => BackendError::Protocol(other),
        }
    }
}
