//! Error types for the migration engine.

use std::time::Duration;

use thiserror::Error;
use virtshift_hypervisor::{HypervisorError, RemoteExecError};
use virtshift_inventory::{AttributeValue, InventoryError};

/// Everything that can go wrong during an orchestration.
///
/// The dedicated variants carry the pre-flight and policy failures; the
/// transparent ones forward component errors from the layers below.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// The fleet is not in the state the operation requires.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// An inventory attribute disagrees with the hypervisor's live value.
    #[error("{attribute} is {inventory} in the inventory but {live} on the hypervisor")]
    InconsistentAttribute {
        attribute: String,
        inventory: AttributeValue,
        live: AttributeValue,
    },

    /// The requested option combination is not supported.
    #[error("Incompatible options: {0}")]
    IncompatibleOptions(String),

    /// The destination cannot hold the VM.
    #[error("Insufficient resources on {host}: {details}")]
    InsufficientResources { host: String, details: String },

    /// Replication did not finish within the configured ceiling.
    #[error("Replication did not reach UpToDate/UpToDate within {0:?}")]
    SyncTimeout(Duration),

    /// The orchestration was cancelled; rollback has run.
    #[error("Migration cancelled")]
    Cancelled,

    /// A query returned something unparsable.
    #[error("Unexpected output while reading {what}: {output:?}")]
    UnexpectedOutput { what: &'static str, output: String },

    #[error(transparent)]
    Remote(#[from] RemoteExecError),

    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),

    #[error(transparent)]
    Inventory(#[from] InventoryError),
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
