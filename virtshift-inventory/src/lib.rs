//! # virtshift Inventory
//!
//! Adapter over the fleet inventory: the typed attribute store that holds the
//! canonical record for every VM and hypervisor.
//!
//! The inventory service itself is an external system. This crate provides
//! the [`InventoryStore`] seam plus two concrete adapters (an in-memory store
//! for tests and a JSON file store for standalone use), and the lazy-loading
//! [`Host`] view with staged mutations and explicit commit.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use virtshift_inventory::{MemoryStore, Vm};
//! use std::sync::Arc;
//!
//! let store = Arc::new(MemoryStore::new());
//! let vm = Vm::new("web-01.example.com", store);
//! let owner = vm.xen_host().await?;
//! vm.set("xen_host", "hv-02.example.com");
//! vm.commit().await?;
//! ```

pub mod attrs;
pub mod error;
pub mod host;
pub mod store;

pub use attrs::{AttributeMap, AttributeValue};
pub use error::InventoryError;
pub use host::{Host, Hypervisor, HypervisorType, Vm};
pub use store::{FileStore, InventoryStore, MemoryStore};
