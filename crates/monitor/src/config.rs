//! Monitor configuration management

use anyhow::{Context, Result, anyhow};
use backend::{BackendConfig, ProtocolSettings, RegistrySettings, UsbSettings, parse_path};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub monitor: MonitorSettings,
    #[serde(default)]
    pub usb: UsbSettings,
    #[serde(default)]
    pub protocol: ProtocolSettings,
    #[serde(default)]
    pub registry: RegistrySettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub log_level: String,
    /// How often the watched endpoints are read and printed
    pub refresh_interval_ms: u64,
    /// Full endpoint paths, e.g. `odrv0.vbus_voltage`
    pub watch: Vec<String>,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            refresh_interval_ms: 1000,
            watch: vec!["odrv0.vbus_voltage".to_string()],
        }
    }
}

impl MonitorSettings {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }
}

impl MonitorConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/odrive-monitor/monitor.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: MonitorConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", config_path.display()))?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {:#}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("odrive-monitor").join("monitor.toml")
        } else {
            PathBuf::from(".config/odrive-monitor/monitor.toml")
        }
    }

    /// Backend half of the configuration
    pub fn backend(&self) -> BackendConfig {
        BackendConfig {
            usb: self.usb.clone(),
            protocol: self.protocol.clone(),
            registry: self.registry.clone(),
        }
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.monitor.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.monitor.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.monitor.refresh_interval_ms == 0 {
            return Err(anyhow!("refresh_interval_ms must be greater than 0"));
        }

        for path in &self.monitor.watch {
            let (slot, _) = parse_path(path)?;
            if slot >= self.registry.max_devices {
                return Err(anyhow!(
                    "Watched path '{}' refers to slot {}, but max_devices is {}",
                    path,
                    slot,
                    self.registry.max_devices
                ));
            }
        }

        self.backend().validate()?;
        Ok(())
    }
}

/// Expand `~` and load from an explicit path
pub fn load_config(path: &str) -> Result<MonitorConfig> {
    MonitorConfig::load(Some(expand_path(path)))
}

pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}
