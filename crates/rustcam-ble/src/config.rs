//! BLE peripheral configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{
    DEFAULT_DEVICE_NAME, DEFAULT_READ_MESSAGE, MAX_DEVICE_NAME_LEN, MAX_READ_MESSAGE_LEN,
};

/// Advertising interval range accepted by controllers, in milliseconds
pub const MIN_ADV_INTERVAL_MS: u16 = 20;
pub const MAX_ADV_INTERVAL_MS: u16 = 10240;

// ----------------------------------------------------------------------------
// Backend Selection
// ----------------------------------------------------------------------------

/// Which stack the peripheral drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Event-driven host stack on a BlueZ adapter
    Host,
    /// Kernel-native stack driven through control calls on a raw HCI socket
    Native,
    /// No BLE support; every operation reports `NotSupported`
    None,
}

impl Default for BackendKind {
    fn default() -> Self {
        if cfg!(target_os = "linux") {
            Self::Host
        } else {
            Self::None
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Host => "host",
            Self::Native => "native",
            Self::None => "none",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "host" => Ok(Self::Host),
            "native" => Ok(Self::Native),
            "none" => Ok(Self::None),
            other => Err(ConfigError::Validation(format!(
                "unknown backend '{}', expected host, native or none",
                other
            ))),
        }
    }
}

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Configuration for the BLE peripheral
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeripheralConfig {
    /// Stack backend to drive
    pub backend: BackendKind,
    /// HCI controller index (`hciN`)
    pub hci_device: u16,
    /// Interface brought up before the stack starts; empty skips it
    pub interface: String,
    /// Name used until the caller advertises with another one
    pub device_name: String,
    /// Initial response for the read characteristic
    pub read_message: String,
    /// Upper bound on a single HCI command or adapter call
    pub command_timeout_ms: u64,
    /// Advertising interval
    pub adv_interval_ms: u16,
    /// Poll interval of the GATT server run loop
    pub poll_interval_ms: u64,
}

impl Default for PeripheralConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            hci_device: 0,
            interface: "hci0".to_string(),
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            read_message: DEFAULT_READ_MESSAGE.to_string(),
            command_timeout_ms: 1000,
            adv_interval_ms: 100,
            poll_interval_ms: 100,
        }
    }
}

impl PeripheralConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the backend
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Set the HCI controller index
    pub fn with_hci_device(mut self, dev_id: u16) -> Self {
        self.hci_device = dev_id;
        self
    }

    /// Set the interface brought up during init
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = interface.into();
        self
    }

    /// Set the default device name
    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = name.into();
        self
    }

    /// Set the initial read response
    pub fn with_read_message(mut self, message: impl Into<String>) -> Self {
        self.read_message = message.into();
        self
    }

    /// Set the HCI command timeout
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the advertising interval in milliseconds
    pub fn with_adv_interval_ms(mut self, interval: u16) -> Self {
        self.adv_interval_ms = interval;
        self
    }

    /// Set the run-loop poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Advertising interval, clamped to the range controllers accept
    pub fn adv_interval(&self) -> Duration {
        Duration::from_millis(u64::from(
            self.adv_interval_ms
                .clamp(MIN_ADV_INTERVAL_MS, MAX_ADV_INTERVAL_MS),
        ))
    }

    /// Advertising interval in 0.625 ms controller units, clamped like
    /// [`adv_interval`](Self::adv_interval)
    pub fn adv_interval_units(&self) -> u16 {
        let ms = u32::from(
            self.adv_interval_ms
                .clamp(MIN_ADV_INTERVAL_MS, MAX_ADV_INTERVAL_MS),
        );
        u16::try_from(ms * 1000 / 625).unwrap_or(u16::MAX)
    }

    /// Check the configuration for values the stack would reject
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_name.is_empty() {
            return Err(ConfigError::Validation("device_name must not be empty".into()));
        }
        if self.device_name.len() > MAX_DEVICE_NAME_LEN {
            return Err(ConfigError::Validation(format!(
                "device_name is {} bytes (max {})",
                self.device_name.len(),
                MAX_DEVICE_NAME_LEN
            )));
        }
        if self.device_name.contains('\0') {
            return Err(ConfigError::Validation("device_name contains NUL".into()));
        }
        if self.read_message.len() > MAX_READ_MESSAGE_LEN {
            return Err(ConfigError::Validation(format!(
                "read_message is {} bytes (max {})",
                self.read_message.len(),
                MAX_READ_MESSAGE_LEN
            )));
        }
        if self.command_timeout_ms == 0 {
            return Err(ConfigError::Validation("command_timeout_ms must be > 0".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Validation("poll_interval_ms must be > 0".into()));
        }
        if !(MIN_ADV_INTERVAL_MS..=MAX_ADV_INTERVAL_MS).contains(&self.adv_interval_ms) {
            return Err(ConfigError::Validation(format!(
                "adv_interval_ms {} outside {}..={}",
                self.adv_interval_ms, MIN_ADV_INTERVAL_MS, MAX_ADV_INTERVAL_MS
            )));
        }
        Ok(())
    }
}
