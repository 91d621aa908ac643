//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand};
use rustcam_ble::BackendKind;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<String>,

    /// Stack backend (host, native or none)
    #[arg(short, long)]
    pub backend: Option<BackendKind>,

    /// HCI controller index
    #[arg(long)]
    pub hci: Option<u16>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Advertise and print commands written by centrals
    Serve {
        /// Advertised device name
        #[arg(short, long)]
        name: Option<String>,
        /// Stop after this many seconds
        #[arg(short, long)]
        timeout: Option<u64>,
        /// Response served by the read characteristic
        #[arg(short, long)]
        message: Option<String>,
    },
    /// Advertise for a fixed time, then exit
    Advertise {
        /// Advertised device name
        #[arg(short, long)]
        name: Option<String>,
        /// Seconds to advertise
        #[arg(short, long, default_value_t = 30)]
        duration: u64,
    },
    /// Initialize the stack and print peripheral status
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration as TOML
    Config,
}
