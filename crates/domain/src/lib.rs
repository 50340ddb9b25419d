//! # TillSync Domain
//!
//! Domain types for the offline sync and reconciliation engine.
//!
//! This crate contains:
//! - Queue, metadata, analytics and reconciliation records
//! - Status enums with stable string representations
//! - Domain error type and `Result` alias
//! - Configuration structures
//! - Engine events consumed by notification layers
//!
//! ## Architecture
//! - No dependencies on other TillSync crates
//! - No I/O

pub mod config;
pub mod errors;
pub mod events;
pub mod macros;
pub mod types;

// Re-export commonly used items
pub use config::*;
pub use errors::*;
pub use events::*;
pub use types::*;
