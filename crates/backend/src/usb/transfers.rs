//! Bulk transfer execution
//!
//! Thin wrappers over `rusb` bulk transfers that map rusb errors to
//! transport errors and log at frame granularity.

use common::TransportError;
use rusb::{Context, DeviceHandle};
use std::time::Duration;
use tracing::{debug, trace};

/// Single bulk-out transfer
pub fn write_bulk(
    handle: &DeviceHandle<Context>,
    endpoint: u8,
    data: &[u8],
    timeout: Duration,
) -> Result<usize, TransportError> {
    trace!(
        "Bulk OUT: endpoint={:#x}, data_len={}, timeout={}ms",
        endpoint,
        data.len(),
        timeout.as_millis()
    );

    handle.write_bulk(endpoint, data, timeout).map_err(|e| {
        debug!("Bulk OUT on endpoint {:#x} failed: {}", endpoint, e);
        map_rusb_error(e)
    })
}

/// Single bulk-in transfer of at most `max_len` bytes
///
/// A zero-length transfer is returned as an empty buffer, not an error.
pub fn read_bulk(
    handle: &DeviceHandle<Context>,
    endpoint: u8,
    max_len: usize,
    timeout: Duration,
) -> Result<Vec<u8>, TransportError> {
    let mut buffer = vec![0u8; max_len];
    match handle.read_bulk(endpoint, &mut buffer, timeout) {
        Ok(len) => {
            buffer.truncate(len);
            trace!("Bulk IN: endpoint={:#x}, received {} bytes", endpoint, len);
            Ok(buffer)
        }
        Err(e) => {
            debug!("Bulk IN on endpoint {:#x} failed: {}", endpoint, e);
            Err(map_rusb_error(e))
        }
    }
}

/// Map rusb::Error to TransportError
pub fn map_rusb_error(err: rusb::Error) -> TransportError {
    match err {
        rusb::Error::Timeout => TransportError::Timeout,
        rusb::Error::NoDevice => TransportError::Disconnected,
        rusb::Error::NotFound => TransportError::NotFound,
        rusb::Error::Access => TransportError::PermissionDenied,
        rusb::Error::Busy => TransportError::AlreadyOpen,
        _ => TransportError::Other(err.to_string()),
    }
}
