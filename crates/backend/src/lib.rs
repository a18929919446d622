//! ODrive device protocol engine and connection lifecycle manager
//!
//! - [`usb`]: `rusb` transport, device enumeration and the hotplug diff
//! - [`session`]: per-device protocol engine (schema discovery, typed
//!   read/write/execute with timeout, retry and disconnect detection)
//! - [`registry`]: fixed-capacity slot table keyed by serial number, plus the
//!   endpoint value cache consumed by front ends
//! - [`scanner`]: background thread running the periodic scan
//!
//! All I/O is blocking and bounded by timeouts. Async front ends call into
//! the registry from `spawn_blocking` and receive connection changes through
//! [`common::EventStream`].

pub mod config;
pub mod error;
pub mod registry;
pub mod scanner;
pub mod session;
pub mod usb;

pub use config::{BackendConfig, ProtocolSettings, RegistrySettings, UsbSettings};
pub use error::{BackendError, Result};
pub use registry::{DeviceRegistry, ScanReport, parse_path};
pub use scanner::{ScanWorker, spawn_scan_worker};
pub use session::{DeviceStatus, Session, SessionState};
pub use usb::{HotplugChanges, HotplugDiff, UsbHost};
