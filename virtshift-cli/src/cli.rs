//! Command-line argument parsing.

use std::net::IpAddr;

use clap::{Parser, Subcommand};

/// virtshift - VM lifecycle and migration tooling
#[derive(Parser, Debug)]
#[command(name = "virtshift")]
#[command(about = "virtshift - VM lifecycle and migration tooling")]
#[command(version)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/virtshift/config.yaml")]
    pub config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Migrate a VM to another hypervisor
    Migrate {
        vm_hostname: String,
        destination: String,

        /// Shut the VM down and copy the disk instead of a live hand-off
        #[arg(long)]
        offline: bool,

        /// Address the VM gets on the destination
        /// (requires --offline and --runpuppet)
        #[arg(long)]
        newip: Option<IpAddr>,

        /// Re-run puppet in the copied system before its first boot
        #[arg(long)]
        runpuppet: bool,
    },

    /// Start a VM
    Start { vm_hostname: String },

    /// Stop a VM
    Stop {
        vm_hostname: String,

        /// Pull the plug instead of a graceful shutdown
        #[arg(long)]
        force: bool,
    },

    /// Restart a VM
    Restart {
        vm_hostname: String,

        /// Pull the plug instead of a graceful shutdown
        #[arg(long)]
        force: bool,
    },

    /// Synchronize VM resource attributes to the inventory
    Sync { vm_hostname: String },
}
