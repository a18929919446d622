//! Opened ODrive device
//!
//! Wraps a `rusb` handle with the protocol interface claimed and exposes it
//! as a [`BulkTransport`].

use crate::config::UsbSettings;
use crate::usb::transfers::{map_rusb_error, read_bulk, write_bulk};
use common::{BulkTransport, DeviceKey, TransportError};
use rusb::{Context, Device, DeviceHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Bulk transport over a claimed USB interface
pub struct UsbTransport {
    key: DeviceKey,
    /// Device handle, `None` once closed
    handle: Option<DeviceHandle<Context>>,
    interface: u8,
    endpoint_out: u8,
    endpoint_in: u8,
    timeout: Duration,
    /// Whether we detached a kernel driver that must be given back on close
    detached_kernel_driver: bool,
}

impl UsbTransport {
    /// Open the device and claim the protocol interface
    ///
    /// A kernel driver bound to the interface (e.g. on Linux) is detached
    /// first and reattached on close.
    pub fn open(device: &Device<Context>, settings: &UsbSettings) -> Result<Self, TransportError> {
        let key = DeviceKey::new(device.bus_number(), device.address());
        let handle = device.open().map_err(|e| {
            warn!("Failed to open device {}: {}", key, e);
            map_rusb_error(e)
        })?;

        debug!("Opened device {}", key);

        let interface = settings.interface;
        let mut detached_kernel_driver = false;
        match handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!(
                    "Detaching kernel driver from interface {} on device {}",
                    interface, key
                );
                match handle.detach_kernel_driver(interface) {
                    Ok(()) => detached_kernel_driver = true,
                    Err(e) => warn!(
                        "Failed to detach kernel driver from interface {}: {}",
                        interface, e
                    ),
                }
            }
            Ok(false) => {
                debug!("No kernel driver active on interface {}", interface);
            }
            Err(e) => {
                debug!(
                    "Could not check kernel driver status for interface {}: {}",
                    interface, e
                );
            }
        }

        if let Err(e) = handle.claim_interface(interface) {
            warn!("Failed to claim interface {} on {}: {}", interface, key, e);
            if detached_kernel_driver {
                let _ = handle.attach_kernel_driver(interface);
            }
            return Err(map_rusb_error(e));
        }

        debug!("Claimed interface {} on device {}", interface, key);

        Ok(Self {
            key,
            handle: Some(handle),
            interface,
            endpoint_out: settings.endpoint_out,
            endpoint_in: settings.endpoint_in,
            timeout: settings.transfer_timeout(),
            detached_kernel_driver,
        })
    }

    pub fn key(&self) -> DeviceKey {
        self.key
    }

    /// Check if device is open
    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    fn handle(&self) -> Result<&DeviceHandle<Context>, TransportError> {
        self.handle.as_ref().ok_or(TransportError::Disconnected)
    }
}

impl BulkTransport for UsbTransport {
    fn bulk_write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        write_bulk(self.handle()?, self.endpoint_out, data, self.timeout)
    }

    fn bulk_read(&mut self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        read_bulk(self.handle()?, self.endpoint_in, max_len, self.timeout)
    }

    /// Releases the interface and gives the kernel driver back
    fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.release_interface(self.interface) {
                debug!("Failed to release interface {}: {}", self.interface, e);
            }
            if self.detached_kernel_driver {
                if let Err(e) = handle.attach_kernel_driver(self.interface) {
                    debug!(
                        "Could not reattach kernel driver to interface {}: {}",
                        self.interface, e
                    );
                }
            }
            debug!("Closed device {}", self.key);
        }
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        self.close();
    }
}
