//! Command handlers for the RustCam CLI

use std::ops::ControlFlow;
use std::time::Duration;

use tracing::{info, warn};

use rustcam_ble::{LinkState, Peripheral};

use crate::cli::Commands;
use crate::config::AppConfig;
use crate::error::Result;

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    pub async fn execute(command: Commands, config: AppConfig) -> Result<()> {
        match command {
            Commands::Serve {
                name,
                timeout,
                message,
            } => Self::handle_serve_command(config, name, timeout, message).await,
            Commands::Advertise { name, duration } => {
                Self::handle_advertise_command(config, name, duration).await
            }
            Commands::Status { json } => Self::handle_status_command(config, json).await,
            Commands::Config => Self::handle_config_command(&config),
        }
    }

    /// Handle the serve command: run the GATT server until timeout,
    /// the exit command or Ctrl+C
    async fn handle_serve_command(
        config: AppConfig,
        name: Option<String>,
        timeout: Option<u64>,
        message: Option<String>,
    ) -> Result<()> {
        let peripheral = Peripheral::new(config.peripheral.clone());
        peripheral.init().await?;
        if message.is_some() {
            peripheral.set_read_message(message.as_deref())?;
        }

        let exit_command = config.cli.exit_command.clone();
        let hex_dump = config.cli.hex_dump;
        let on_command = |command: &[u8]| {
            let text = String::from_utf8_lossy(command);
            if hex_dump {
                println!("Command: {} [{}]", text, hex::encode(command));
            } else {
                println!("Command: {}", text);
            }
            match exit_command.as_deref() {
                Some(exit) if exit.as_bytes() == command => ControlFlow::Break(()),
                _ => ControlFlow::Continue(()),
            }
        };

        println!(
            "Serving as '{}' (read message: '{}')",
            name.as_deref().unwrap_or(&config.peripheral.device_name),
            peripheral.read_message()
        );
        let result = tokio::select! {
            result = peripheral.run_gatt_server(
                name.as_deref(),
                timeout.map(Duration::from_secs),
                on_command,
            ) => result,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                Ok(())
            }
        };

        Self::shutdown(&peripheral).await;
        result.map_err(Into::into)
    }

    /// Handle the advertise command
    async fn handle_advertise_command(
        config: AppConfig,
        name: Option<String>,
        duration: u64,
    ) -> Result<()> {
        let peripheral = Peripheral::new(config.peripheral);
        peripheral.init().await?;
        peripheral.start_advertising(name.as_deref()).await?;

        let mut state = peripheral.watch_state();
        let deadline = tokio::time::sleep(Duration::from_secs(duration));
        tokio::pin!(deadline);
        let mut last_link = LinkState::Idle;

        loop {
            let link = state.borrow_and_update().link;
            if link != last_link {
                println!("State: {}", link);
                last_link = link;
            }
            tokio::select! {
                _ = &mut deadline => break,
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, shutting down");
                    break;
                }
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        Self::shutdown(&peripheral).await;
        Ok(())
    }

    /// Handle the status command
    async fn handle_status_command(config: AppConfig, json: bool) -> Result<()> {
        let peripheral = Peripheral::new(config.peripheral);
        if let Err(e) = peripheral.init().await {
            warn!("BLE initialization failed: {}", e);
        }

        let status = peripheral.status().await;
        if json {
            println!("{}", serde_json::to_string_pretty(&status)?);
        } else {
            println!("{}", status);
        }

        Self::shutdown(&peripheral).await;
        Ok(())
    }

    /// Handle the config command
    fn handle_config_command(config: &AppConfig) -> Result<()> {
        print!("{}", config.to_toml()?);
        Ok(())
    }

    /// Tear the peripheral down if it was brought up
    async fn shutdown(peripheral: &Peripheral) {
        if !peripheral.snapshot().await.state.initialized {
            return;
        }
        if let Err(e) = peripheral.deinit().await {
            warn!("BLE deinit failed: {}", e);
        }
    }
}
