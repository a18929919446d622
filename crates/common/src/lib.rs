//! Common utilities for the ODrive USB workspace
//!
//! This crate provides what the backend library and the monitor binary share:
//! the transport seam between protocol logic and real USB hardware, device
//! identity types, error handling, logging setup, and the event channel
//! between the background scan thread and the async foreground.

pub mod channel;
pub mod error;
pub mod logging;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod usb_types;

pub use channel::{EventSink, EventStream, RegistryEvent, create_event_channel};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use usb_types::{
    BulkTransport, DeviceCandidate, DeviceIdentity, DeviceKey, TransportError, UsbBackend,
};
