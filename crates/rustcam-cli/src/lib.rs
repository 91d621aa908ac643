//! RustCam CLI library
//!
//! Command-line driver for the RustCam BLE peripheral: argument parsing,
//! configuration loading and the command handlers.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;

pub use cli::{Cli, Commands};
pub use config::{AppConfig, CliConfig};
pub use error::{CliError, Result};
