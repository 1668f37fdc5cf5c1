//! tally: budget allocation loader.
//!
//! Extracts marketing budget-allocation records from a spreadsheet worksheet,
//! normalizes and enriches them, loads them into a partitioned warehouse
//! table with key-scoped delete-then-append conflict resolution, and triggers
//! the downstream materialization build.

pub mod batch;
pub mod config;
pub mod error;
pub mod materialize;
pub mod pipeline;
pub mod schema;
pub mod secrets;
pub mod source;
pub mod transform;
pub mod warehouse;

pub use batch::{Batch, ColumnType, Value};
pub use config::Config;
pub use error::{ErrorClass, RunError};
pub use pipeline::{Pipeline, RunOutcome};
pub use source::{Extraction, GoogleSheetsSource, RecordSource};
pub use warehouse::bigquery::BigQueryWarehouse;
pub use warehouse::memory::MemoryWarehouse;
pub use warehouse::{LoadMode, LoadResult, LoadSpec, TableManager, TableTarget, Warehouse};

use tracing_subscriber::EnvFilter;

/// Initialize tracing from `RUST_LOG`, defaulting to `info`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
