//! # virtshift Migrate
//!
//! The live-migration engine: relocates a VM's storage and runtime state
//! from one hypervisor to another with minimal downtime and guaranteed
//! rollback on any step failure.
//!
//! Disk state moves through a DRBD replication session spliced under the
//! running VM at the device-mapper layer ([`DrbdEndpoint`]); memory and
//! runtime state move through a libvirt live migration. The
//! [`MigrationOrchestrator`] sequences both, enforces the pre-flight
//! invariants, and unwinds partial state in reverse order when anything
//! fails.

pub mod drbd;
pub mod error;
pub mod migration;

pub use drbd::{sync_block_size, DrbdEndpoint, DrbdRole};
pub use error::MigrateError;
pub use migration::{CancelFlag, MigrateOptions, MigrationConfig, MigrationOrchestrator};
