//! RustCam BLE CLI entry point

use clap::Parser;
use tracing::{error, info};

use rustcam_cli::{cli::Cli, commands::CommandDispatcher, config::AppConfig, error::Result};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse();

    // Load configuration before logging so the file can enable verbose output
    let config = match load_configuration(&cli) {
        Ok(config) => config,
        Err(e) => {
            setup_logging(cli.verbose);
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize logging
    setup_logging(config.cli.verbose);
    info!(
        "RustCam BLE ({} backend, hci{})",
        config.peripheral.backend, config.peripheral.hci_device
    );

    // Execute the command
    if let Err(e) = CommandDispatcher::execute(cli.command, config).await {
        error!("Command execution failed: {}", e);
        std::process::exit(1);
    }

    Ok(())
}

/// Setup logging based on verbosity level
fn setup_logging(verbose: bool) {
    let log_level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

/// Load configuration from file or use defaults, then apply flags
fn load_configuration(cli: &Cli) -> Result<AppConfig> {
    let config = if let Some(config_path) = &cli.config {
        AppConfig::load_from_file(config_path)?
    } else {
        AppConfig::default()
    };
    config.apply_cli(cli)
}
