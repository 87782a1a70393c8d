//! # virtshift
//!
//! Command-line front end for the virtshift VM tooling: migrations between
//! hypervisors plus the basic lifecycle commands (start, stop, restart,
//! attribute sync).
//!
//! ## Usage
//! ```bash
//! virtshift migrate web-01.example.com hv-02.example.com
//! virtshift migrate web-01.example.com hv-02.example.com --offline --runpuppet
//! virtshift stop web-01.example.com --force
//! ```
//!
//! Exit status is non-zero on any failure; a failed migration leaves the VM
//! running on its source hypervisor and the destination clean.

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

mod cli;
mod commands;
mod config;

use cli::{Args, Command};
use config::Config;
use virtshift_migrate::MigrateOptions;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.json_logs {
        virtshift_common::init_logging_json(&args.log_level)?;
    } else {
        virtshift_common::init_logging(&args.log_level)?;
    }

    // Load configuration, falling back to defaults when the standard path
    // has no file.
    let config = match Config::load(&args.config) {
        Ok(config) => {
            info!(config_path = %args.config, "Configuration loaded");
            config
        }
        Err(_) if args.config == "/etc/virtshift/config.yaml" => {
            info!("No config file found, using defaults");
            Config::default()
        }
        Err(err) => {
            error!(error = %err, path = %args.config, "Failed to load configuration");
            return Err(err);
        }
    };

    let ctx = commands::Context::new(config).await?;

    let result = match args.command {
        Command::Migrate {
            ref vm_hostname,
            ref destination,
            offline,
            newip,
            runpuppet,
        } => {
            commands::migrate(
                &ctx,
                vm_hostname,
                destination,
                MigrateOptions {
                    offline,
                    newip,
                    runpuppet,
                },
            )
            .await
        }
        Command::Start { ref vm_hostname } => commands::start(&ctx, vm_hostname).await,
        Command::Stop {
            ref vm_hostname,
            force,
        } => commands::stop(&ctx, vm_hostname, force).await,
        Command::Restart {
            ref vm_hostname,
            force,
        } => commands::restart(&ctx, vm_hostname, force).await,
        Command::Sync { ref vm_hostname } => commands::sync(&ctx, vm_hostname).await,
    };

    if let Err(ref err) = result {
        error!(error = %err, "Command failed");
    }
    result
}
