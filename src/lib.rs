//! On-line streaming aggregation service for measurement frameworks.
//!
//! The service ingests high-frequency measurement snapshots on arbitrary
//! application threads, possibly from signal context, and maintains a
//! compact per-thread database of per-key running statistics (min, max,
//! sum, count). On flush the databases are drained into a reduced stream
//! of synthetic snapshots.
//!
//! The hot path is lock-free and allocation-free when the host reports
//! signal context: composite keys are packed into fixed stack buffers,
//! indexed by a block-allocated byte trie, and samples that would need a
//! fresh allocation are counted and dropped instead.
//!
//! The host framework side of the contract lives in [`host`]; the
//! service is registered through [`AggregateService::register`] and then
//! driven entirely by host events.

pub mod config;
pub mod db;
pub mod error;
pub mod host;
pub mod registry;
pub mod service;

pub use config::AggregateConfig;
pub use error::{AggregateError, Result};
pub use service::{AggregateService, SERVICE_NAME};
