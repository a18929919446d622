//! USB host context
//!
//! Owns the `rusb` context for the lifetime of the registry that uses it and
//! implements [`UsbBackend`] on top of it.

use crate::config::UsbSettings;
use crate::usb::device::UsbTransport;
use crate::usb::transfers::map_rusb_error;
use common::{BulkTransport, DeviceCandidate, DeviceKey, TransportError, UsbBackend};
use rusb::{Context, Device, UsbContext};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Description used when the product string cannot be read
const FALLBACK_DESCRIPTION: &str = "ODrive";

/// Real USB host backed by libusb
pub struct UsbHost {
    context: Context,
    settings: UsbSettings,
    /// Product strings by device, pruned to what the last scan saw
    descriptions: HashMap<DeviceKey, String>,
}

impl UsbHost {
    /// Create a new libusb context
    pub fn new(settings: UsbSettings) -> Result<Self, TransportError> {
        let context = Context::new().map_err(map_rusb_error)?;
        info!(
            "USB host initialized (filter {:04x}:{:04x})",
            settings.vendor_id, settings.product_id
        );
        Ok(Self {
            context,
            settings,
            descriptions: HashMap::new(),
        })
    }

    pub fn settings(&self) -> &UsbSettings {
        &self.settings
    }

    fn find_device(&self, key: DeviceKey) -> Result<Device<Context>, TransportError> {
        let devices = self.context.devices().map_err(map_rusb_error)?;
        devices
            .iter()
            .find(|d| d.bus_number() == key.bus && d.address() == key.address)
            .ok_or(TransportError::NotFound)
    }

    fn read_description(device: &Device<Context>, timeout: Duration) -> Option<String> {
        let descriptor = device.device_descriptor().ok()?;
        let handle = device.open().ok()?;
        let language = handle.read_languages(timeout).ok()?.into_iter().next()?;
        handle
            .read_product_string(language, &descriptor, timeout)
            .ok()
            .filter(|s| !s.is_empty())
    }
}

impl UsbBackend for UsbHost {
    fn enumerate(
        &mut self,
        vendor_id: u16,
        product_id: u16,
    ) -> Result<Vec<DeviceCandidate>, TransportError> {
        let devices = self.context.devices().map_err(map_rusb_error)?;
        let timeout = self.settings.transfer_timeout();

        let mut candidates = Vec::new();
        for device in devices.iter() {
            let descriptor = match device.device_descriptor() {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    debug!("Skipping device without descriptor: {}", e);
                    continue;
                }
            };
            if descriptor.vendor_id() != vendor_id || descriptor.product_id() != product_id {
                continue;
            }

            let key = DeviceKey::new(device.bus_number(), device.address());
            let description = self
                .descriptions
                .entry(key)
                .or_insert_with(|| {
                    Self::read_description(&device, timeout)
                        .unwrap_or_else(|| FALLBACK_DESCRIPTION.to_string())
                })
                .clone();

            candidates.push(DeviceCandidate {
                key,
                vendor_id,
                product_id,
                description,
            });
        }

        self.descriptions
            .retain(|key, _| candidates.iter().any(|c| c.key == *key));
        debug!("Enumerated {} matching devices", candidates.len());
        Ok(candidates)
    }

    fn open(
        &mut self,
        candidate: &DeviceCandidate,
    ) -> Result<Box<dyn BulkTransport>, TransportError> {
        let device = self.find_device(candidate.key).inspect_err(|e| {
            warn!("Device {} vanished before open: {}", candidate.key, e);
        })?;
        let transport = UsbTransport::open(&device, &self.settings)?;
        Ok(Box::new(transport))
    }
}
