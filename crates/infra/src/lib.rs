//! # TillSync Infrastructure
//!
//! Infrastructure implementations of core domain ports.
//!
//! This crate contains:
//! - SQLite repositories for the queue, metadata, analytics and
//!   reconciliation tables
//! - HTTP adapter for the remote system of record
//! - Local upload store for reconciliation files
//! - Configuration loading and tracing setup
//! - Background worker driving scheduled and reconnect drains
//!
//! ## Architecture
//! - Implements traits defined in `tillsync-core`
//! - Depends on `tillsync-domain` and `tillsync-core`
//! - Contains all "impure" code (I/O, network, clocks on real time)

pub mod config;
pub mod database;
pub mod errors;
pub mod files;
pub mod observability;
pub mod remote;
pub mod sync;

// Re-export commonly used items
pub use database::*;
pub use errors::{map_join_error, InfraError};
pub use files::LocalFileStore;
pub use observability::init_tracing;
pub use remote::{HttpRemoteStore, RemoteClientConfig};
pub use sync::{SyncWorker, SyncWorkerConfig, WorkerError};
