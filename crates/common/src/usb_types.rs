//! USB type abstractions shared by the real transport and the simulator
//!
//! [`UsbBackend`] and [`BulkTransport`] are the seam between protocol logic
//! and hardware: the backend crate implements them over `rusb`, and
//! `test_utils` (behind the `test-utils` feature) implements them in memory.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// USB vendor id of ODrive boards
pub const ODRIVE_VENDOR_ID: u16 = 0x1209;
/// USB product id of ODrive boards
pub const ODRIVE_PRODUCT_ID: u16 = 0x0d32;
/// Interface carrying the bulk protocol endpoints
pub const ODRIVE_INTERFACE: u8 = 2;
/// Bulk OUT endpoint address
pub const ODRIVE_ENDPOINT_OUT: u8 = 0x03;
/// Bulk IN endpoint address
pub const ODRIVE_ENDPOINT_IN: u8 = 0x83;

/// Location of an attached device on the bus
///
/// Stable for as long as the device stays plugged in; a replugged device
/// usually comes back under a new address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceKey {
    pub bus: u8,
    pub address: u8,
}

impl DeviceKey {
    pub fn new(bus: u8, address: u8) -> Self {
        Self { bus, address }
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bus {:03} addr {:03}", self.bus, self.address)
    }
}

/// Attached but unopened device matching the vendor/product filter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCandidate {
    pub key: DeviceKey,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Product string, or a generic name when the descriptor is unreadable
    pub description: String,
}

/// Identity of a connected board, immutable once read from hardware
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: u64,
    pub description: String,
}

impl DeviceIdentity {
    pub fn new(candidate: &DeviceCandidate, serial_number: u64) -> Self {
        Self {
            vendor_id: candidate.vendor_id,
            product_id: candidate.product_id,
            serial_number,
            description: candidate.description.clone(),
        }
    }

    /// Serial number the way ODrive tools print it
    pub fn serial_hex(&self) -> String {
        format!("{:012X}", self.serial_number)
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:04x}:{:04x}, serial {})",
            self.description,
            self.vendor_id,
            self.product_id,
            self.serial_hex()
        )
    }
}

/// Transport-level failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Transfer timed out")]
    Timeout,

    #[error("Device disconnected")]
    Disconnected,

    #[error("Device not found")]
    NotFound,

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Device already open")]
    AlreadyOpen,

    #[error("USB error: {0}")]
    Other(String),
}

impl TransportError {
    /// Whether the device is gone and the handle is useless
    pub fn is_disconnect(&self) -> bool {
        matches!(self, TransportError::Disconnected | TransportError::NotFound)
    }
}

/// An opened device with its protocol interface claimed
pub trait BulkTransport: Send {
    /// Single bulk-out transfer, returns the number of bytes written
    fn bulk_write(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Single bulk-in transfer of at most `max_len` bytes
    ///
    /// An empty result is a successful transfer; callers decide what it means.
    fn bulk_read(&mut self, max_len: usize) -> Result<Vec<u8>, TransportError>;

    /// Release the interface and handle. Calling it twice is a no-op.
    fn close(&mut self);
}

/// Device discovery and opening
pub trait UsbBackend: Send {
    fn enumerate(
        &mut self,
        vendor_id: u16,
        product_id: u16,
    ) -> Result<Vec<DeviceCandidate>, TransportError>;

    fn open(&mut self, candidate: &DeviceCandidate)
    -> Result<Box<dyn BulkTransport>, TransportError>;
}
