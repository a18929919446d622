//! Runtime configuration for the USB transport, the protocol engine and the
//! registry

use crate::error::{BackendError, Result};
use common::usb_types::{
    ODRIVE_ENDPOINT_IN, ODRIVE_ENDPOINT_OUT, ODRIVE_INTERFACE, ODRIVE_PRODUCT_ID,
    ODRIVE_VENDOR_ID,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub usb: UsbSettings,
    #[serde(default)]
    pub protocol: ProtocolSettings,
    #[serde(default)]
    pub registry: RegistrySettings,
}

/// Which devices to talk to and how
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsbSettings {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Interface carrying the bulk endpoints
    pub interface: u8,
    pub endpoint_out: u8,
    pub endpoint_in: u8,
    /// Per bulk transfer
    pub transfer_timeout_ms: u64,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            vendor_id: ODRIVE_VENDOR_ID,
            product_id: ODRIVE_PRODUCT_ID,
            interface: ODRIVE_INTERFACE,
            endpoint_out: ODRIVE_ENDPOINT_OUT,
            endpoint_in: ODRIVE_ENDPOINT_IN,
            transfer_timeout_ms: 1000,
        }
    }
}

impl UsbSettings {
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }
}

/// Protocol engine limits; every retry loop is bounded by one of these
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolSettings {
    /// Wall-clock bound for receiving a matching response
    pub read_timeout_ms: u64,
    /// Bulk-out attempts before the link is declared dead
    pub write_attempts: u32,
    /// Mismatched frames tolerated while waiting for one response
    pub max_discarded_frames: u32,
    /// Bytes requested per schema chunk
    pub schema_chunk_size: u16,
    /// Attempts per schema offset before the fetch fails
    pub schema_chunk_attempts: u32,
    /// Upper bound on the schema text size
    pub max_schema_len: usize,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            read_timeout_ms: 500,
            write_attempts: 5,
            max_discarded_frames: 64,
            schema_chunk_size: 64,
            schema_chunk_attempts: 3,
            max_schema_len: 1024 * 1024,
        }
    }
}

impl ProtocolSettings {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    /// Number of device slots
    pub max_devices: usize,
    /// Interval between hotplug scans of the background worker
    pub scan_interval_ms: u64,
    /// Whether the background worker also refreshes the value cache
    pub refresh_cache: bool,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            max_devices: 4,
            scan_interval_ms: 1000,
            refresh_cache: false,
        }
    }
}

impl RegistrySettings {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }
}

impl BackendConfig {
    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| Err(BackendError::InvalidConfig(message));

        if self.usb.endpoint_out & 0x80 != 0 {
            return invalid(format!(
                "endpoint_out {:#04x} is an IN endpoint",
                self.usb.endpoint_out
            ));
        }
        if self.usb.endpoint_in & 0x80 == 0 {
            return invalid(format!(
                "endpoint_in {:#04x} is an OUT endpoint",
                self.usb.endpoint_in
            ));
        }
        if self.usb.transfer_timeout_ms == 0 {
            return invalid("transfer_timeout_ms must be positive".to_string());
        }

        let protocol = &self.protocol;
        if protocol.read_timeout_ms == 0 {
            return invalid("read_timeout_ms must be positive".to_string());
        }
        if protocol.write_attempts == 0 || protocol.schema_chunk_attempts == 0 {
            return invalid("retry attempts must be at least 1".to_string());
        }
        // Chunk size plus the echoed sequence must fit one bulk-in transfer length
        if protocol.schema_chunk_size == 0 || protocol.schema_chunk_size > u16::MAX - 2 {
            return invalid(format!(
                "schema_chunk_size {} out of range",
                protocol.schema_chunk_size
            ));
        }
        if protocol.max_schema_len == 0 {
            return invalid("max_schema_len must be positive".to_string());
        }

        if self.registry.max_devices == 0 {
            return invalid("max_devices must be at least 1".to_string());
        }
        if self.registry.scan_interval_ms == 0 {
            return invalid("scan_interval_ms must be positive".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BackendConfig::default();
        assert_eq!(config.usb.vendor_id, 0x1209);
        assert_eq!(config.usb.product_id, 0x0d32);
        assert_eq!(config.usb.interface, 2);
        assert_eq!(config.usb.transfer_timeout(), Duration::from_secs(1));
        assert_eq!(config.protocol.read_timeout(), Duration::from_millis(500));
        assert_eq!(config.protocol.write_attempts, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: BackendConfig = toml::from_str(
            r#"
            [registry]
            max_devices = 2

            [protocol]
            read_timeout_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.registry.max_devices, 2);
        assert_eq!(config.registry.scan_interval_ms, 1000);
        assert_eq!(config.protocol.read_timeout_ms, 250);
        assert_eq!(config.protocol.max_discarded_frames, 64);
        assert_eq!(config.usb, UsbSettings::default());
    }

    #[test]
    fn test_config_serialization() {
        let config = BackendConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: BackendConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = BackendConfig::default();
        config.usb.endpoint_out = 0x83;
        assert!(config.validate().is_err());

        let mut config = BackendConfig::default();
        config.usb.endpoint_in = 0x03;
        assert!(config.validate().is_err());

        let mut config = BackendConfig::default();
        config.registry.max_devices = 0;
        assert!(config.validate().is_err());

        let mut config = BackendConfig::default();
        config.protocol.write_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = BackendConfig::default();
        config.protocol.schema_chunk_size = u16::MAX;
        assert!(matches!(
            config.validate(),
            Err(BackendError::InvalidConfig(_))
        ));
    }
}
