//! Common error types
//!
//! Transfer failures have their own [`TransportError`](crate::TransportError)
//! because they cross the [`BulkTransport`](crate::BulkTransport) seam.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The other half of the event channel is gone
    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
