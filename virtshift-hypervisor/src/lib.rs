//! # virtshift Hypervisor
//!
//! The per-host execution surface of virtshift: a pre-authenticated remote
//! shell channel and the hypervisor proxy built on top of it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │           HypervisorProxy               │
//! │  (virsh, LVM, device-mapper, files)     │
//! └─────────────────────┬───────────────────┘
//!                       │
//!         ┌─────────────┴─────────────┐
//!         ▼                           ▼
//! ┌───────────────────┐     ┌───────────────────┐
//! │    SshChannel     │     │    MockRemote     │
//! │  (remote hosts)   │     │ (in-process host) │
//! └───────────────────┘     └───────────────────┘
//! ```
//!
//! The proxy never opens a hypervisor API connection itself; every operation
//! is a shell command on the remote host, so one code path serves production
//! SSH sessions and the in-process mock host used by the test suites.

pub mod error;
pub mod mock;
pub mod proxy;
pub mod remote;
mod xml;

pub use error::{HypervisorError, RemoteExecError};
pub use mock::MockRemote;
pub use proxy::{HypervisorProxy, Volume};
pub use remote::{RemoteExec, RunOpts, SshChannel};
