//! USB subsystem
//!
//! Handles device enumeration, the bulk transport used by sessions, and the
//! diff-based hotplug detection driven by the registry's scan loop.
//!
//! Hotplug notifications from libusb are not relied upon: they are missing on
//! some platforms, so arrivals and departures are derived by comparing
//! consecutive enumerations.

pub mod device;
pub mod host;
pub mod hotplug;
pub mod transfers;

// Re-export public types
pub use device::UsbTransport;
pub use host::UsbHost;
pub use hotplug::{HotplugChanges, HotplugDiff};
