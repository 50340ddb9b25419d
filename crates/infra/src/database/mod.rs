//! Database implementations

pub mod analytics_repository;
pub mod manager;
pub mod metadata_repository;
pub mod pool;
pub mod queue_repository;
pub mod reconciliation_repository;
pub(crate) mod support;

pub use analytics_repository::*;
pub use manager::*;
pub use metadata_repository::*;
pub use pool::*;
pub use queue_repository::*;
pub use reconciliation_repository::*;
