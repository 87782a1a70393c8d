//! Error types for inventory access.

use thiserror::Error;

/// Errors that can occur while reading or writing inventory records.
#[derive(Error, Debug)]
pub enum InventoryError {
    /// No record exists for the requested hostname.
    #[error("No inventory record for {0}")]
    HostNotFound(String),

    /// The record exists but lacks the requested attribute.
    #[error("{host} has no attribute {attribute}")]
    AttributeMissing { host: String, attribute: String },

    /// The attribute exists but holds an unexpected type.
    #[error("{host}: attribute {attribute} is not {expected}")]
    TypeMismatch {
        host: String,
        attribute: String,
        expected: &'static str,
    },

    /// Reading or writing the backing file failed.
    #[error("Inventory I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The backing file is not valid JSON.
    #[error("Malformed inventory data: {0}")]
    Format(#[from] serde_json::Error),
}

/// Result type alias for inventory operations.
pub type Result<T> = std::result::Result<T, InventoryError>;
