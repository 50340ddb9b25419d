//! Reconciliation
//!
//! Bulk comparison of uploaded datasets against the system of record, and
//! the operator workflow that settles each divergence.

pub mod comparator;
pub mod dataset;
pub mod mapping;
pub mod ports;
pub mod processor;

pub use comparator::FieldComparator;
pub use dataset::{parse_csv, Dataset, DatasetRow};
pub use mapping::TableMapping;
pub use processor::{JobReport, ReconciliationProcessor, ResolveRequest};
