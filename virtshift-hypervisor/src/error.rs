//! Error types for remote execution and the hypervisor proxy.

use thiserror::Error;
use virtshift_inventory::InventoryError;

/// Errors raised by the remote execution channel.
#[derive(Error, Debug)]
pub enum RemoteExecError {
    /// The channel itself could not be used (spawn failure, broken pipe).
    #[error("Failed to reach {host}: {source}")]
    Transport {
        host: String,
        #[source]
        source: std::io::Error,
    },

    /// The remote command exited non-zero.
    #[error("Command failed on {host} (exit {status}): {cmd}: {stderr}")]
    CommandFailed {
        host: String,
        cmd: String,
        status: i32,
        stderr: String,
    },

    /// A file transfer did not complete.
    #[error("Transfer of {path} to {host} failed: {reason}")]
    TransferFailed {
        host: String,
        path: String,
        reason: String,
    },

    /// Channel-internal failure.
    #[error("Remote channel failure on {host}: {reason}")]
    Channel { host: String, reason: String },
}

/// Errors that can occur during hypervisor operations.
#[derive(Error, Debug)]
pub enum HypervisorError {
    /// The underlying shell command failed.
    #[error(transparent)]
    Remote(#[from] RemoteExecError),

    /// An inventory attribute the operation depends on was unavailable.
    #[error(transparent)]
    Inventory(#[from] InventoryError),

    /// The VM is not known to the hypervisor.
    #[error("VM not found: {0}")]
    VmNotFound(String),

    /// No backing volume exists for the VM.
    #[error("No volume for {vm} in volume group {vg}")]
    VolumeNotFound { vm: String, vg: String },

    /// The VM is in the wrong state for the requested transition.
    #[error("Invalid VM state for operation: {0}")]
    InvalidState(String),

    /// Hypervisor tool output did not parse.
    #[error("Failed to parse {what} from hypervisor output: {output:?}")]
    UnparsableOutput { what: &'static str, output: String },

    /// General operation failure.
    #[error("Operation failed: {0}")]
    OperationFailed(String),
}

/// Result type alias for hypervisor operations.
pub type Result<T> = std::result::Result<T, HypervisorError>;
