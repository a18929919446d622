//! Console rendering of readings, status flags and registry events

use backend::{BackendError, DeviceStatus};
use common::RegistryEvent;
use protocol::EndpointValue;

/// One watched endpoint, `path = value` or `path: error`
pub fn format_reading(path: &str, reading: &Result<EndpointValue, BackendError>) -> String {
    match reading {
        Ok(value) => format!("{} = {}", path, value),
        Err(e) => format!("{}: {}", path, e),
    }
}

pub fn format_status(slot: usize, status: &DeviceStatus) -> String {
    if !status.connected {
        return format!("odrv{}: disconnected", slot);
    }
    if !status.has_errors() {
        return format!("odrv{}: ok", slot);
    }
    format!(
        "odrv{}: axis={:#010x} motor={:#010x} encoder={:#010x} controller={:#010x}",
        slot,
        status.axis_error,
        status.motor_error,
        status.encoder_error,
        status.controller_error
    )
}

pub fn format_event(event: &RegistryEvent) -> String {
    match event {
        RegistryEvent::Connected { slot, identity } => {
            format!("odrv{} connected: {}", slot, identity)
        }
        RegistryEvent::Reconnected { slot, identity } => {
            format!("odrv{} reconnected: {}", slot, identity)
        }
        RegistryEvent::Disconnected {
            slot,
            serial_number,
        } => format!("odrv{} disconnected (serial {:012X})", slot, serial_number),
        RegistryEvent::Rejected { key, reason } => format!("{} rejected: {}", key, reason),
    }
}
