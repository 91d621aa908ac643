//! RustCam CLI configuration
//!
//! Configuration comes from a TOML file when one is given, defaults
//! otherwise; command-line flags override both.

use std::path::Path;

use serde::{Deserialize, Serialize};

use rustcam_ble::PeripheralConfig;

use crate::cli::Cli;
use crate::error::Result;

// ----------------------------------------------------------------------------
// Application Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for the CLI
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// BLE peripheral configuration
    pub peripheral: PeripheralConfig,

    /// CLI-specific configuration
    pub cli: CliConfig,
}

/// CLI-specific configuration options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Enable verbose logging output
    pub verbose: bool,

    /// Command that ends `serve` when a central writes it
    pub exit_command: Option<String>,

    /// Print received commands as hex as well as text
    pub hex_dump: bool,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            exit_command: Some("quit".to_string()),
            hex_dump: false,
        }
    }
}

// ----------------------------------------------------------------------------
// Loading
// ----------------------------------------------------------------------------

impl AppConfig {
    /// Load configuration from a TOML file; missing keys take defaults
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: AppConfig = toml::from_str(&contents)?;
        config.peripheral.validate()?;
        Ok(config)
    }

    /// Apply command-line overrides and validate the result
    pub fn apply_cli(mut self, cli: &Cli) -> Result<Self> {
        if let Some(backend) = cli.backend {
            self.peripheral.backend = backend;
        }
        if let Some(hci) = cli.hci {
            self.peripheral.hci_device = hci;
            self.peripheral.interface = format!("hci{}", hci);
        }
        if cli.verbose {
            self.cli.verbose = true;
        }
        self.peripheral.validate()?;
        Ok(self)
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
