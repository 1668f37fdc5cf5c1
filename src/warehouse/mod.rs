//! Warehouse abstraction: targets, schemas, load specs and the backend trait.
//!
//! The [`Warehouse`] trait is semantic rather than SQL-shaped so the in-memory
//! backend used in tests shares the exact observable behavior of the BigQuery
//! backend without parsing queries.

pub mod bigquery;
pub mod manager;
pub mod memory;

pub use crate::error::WarehouseError;
pub use manager::TableManager;

use crate::batch::{Batch, ColumnType, Value};
use crate::error::{InvalidIdentifierSnafu, InvalidTargetSnafu};
use async_trait::async_trait;
use serde::Deserialize;
use snafu::prelude::*;
use std::fmt;

/// How conflicting rows in the target table are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    /// Append without any conflict resolution.
    Insert,
    /// Delete rows matching the batch's key values, then append.
    Upsert,
}

/// Day-granularity partitioning on a single column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSpec {
    pub field: String,
}

/// Full description of one load operation.
#[derive(Debug, Clone)]
pub struct LoadSpec {
    pub mode: LoadMode,
    /// Deduplication key columns; required non-empty for upserts.
    pub keys: Vec<String>,
    pub partition: Option<PartitionSpec>,
    /// Clustering columns, in priority order.
    pub cluster: Vec<String>,
}

/// Write disposition for a batch load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteDisposition {
    Append,
    Truncate,
}

/// Outcome of a completed load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadResult {
    pub deleted: u64,
    pub written: u64,
    pub target: TableTarget,
}

/// A fully qualified `project.dataset.table` reference.
///
/// Construction validates each component against the identifier allow-list,
/// so a held `TableTarget` is always safe to interpolate into backtick-quoted
/// SQL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableTarget {
    project: String,
    dataset: String,
    table: String,
}

impl TableTarget {
    pub fn new(project: &str, dataset: &str, table: &str) -> Result<Self, WarehouseError> {
        Ok(Self {
            project: validate_identifier(project)?.to_string(),
            dataset: validate_identifier(dataset)?.to_string(),
            table: validate_identifier(table)?.to_string(),
        })
    }

    /// Parse a dotted `project.dataset.table` path.
    pub fn parse(path: &str) -> Result<Self, WarehouseError> {
        let parts: Vec<&str> = path.split('.').collect();
        match parts.as_slice() {
            [project, dataset, table] => Self::new(project, dataset, table),
            _ => InvalidTargetSnafu { target: path }.fail(),
        }
    }

    /// Sibling table in the same project and dataset.
    pub fn sibling(&self, table: &str) -> Result<Self, WarehouseError> {
        Self::new(&self.project, &self.dataset, table)
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn path(&self) -> String {
        format!("{}.{}.{}", self.project, self.dataset, self.table)
    }
}

impl fmt::Display for TableTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}

/// Allow-list check applied to every identifier before SQL interpolation.
pub fn validate_identifier(identifier: &str) -> Result<&str, WarehouseError> {
    let ok = !identifier.is_empty()
        && identifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    ensure!(ok, InvalidIdentifierSnafu { identifier });
    Ok(identifier)
}

/// Ordered column schema of an existing table. Authoritative once the table
/// exists; the manager never alters it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TableSchema {
    columns: Vec<(String, ColumnType)>,
}

impl TableSchema {
    pub fn new(columns: Vec<(String, ColumnType)>) -> Self {
        Self { columns }
    }

    pub fn columns(&self) -> &[(String, ColumnType)] {
        &self.columns
    }

    pub fn column_type(&self, name: &str) -> Option<ColumnType> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, ty)| *ty)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(n, _)| n.as_str())
    }
}

/// Backend operations the table manager composes into a load.
#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn dataset_exists(&self, project: &str, dataset: &str) -> Result<bool, WarehouseError>;

    /// Create a dataset in the given location. Tolerates concurrent creation
    /// (already-exists is success).
    async fn create_dataset(
        &self,
        project: &str,
        dataset: &str,
        location: &str,
    ) -> Result<(), WarehouseError>;

    async fn table_exists(&self, target: &TableTarget) -> Result<bool, WarehouseError>;

    /// Authoritative schema of an existing table.
    async fn table_schema(&self, target: &TableTarget) -> Result<TableSchema, WarehouseError>;

    async fn create_table(
        &self,
        target: &TableTarget,
        schema: &TableSchema,
        partition: Option<&PartitionSpec>,
        cluster: &[String],
    ) -> Result<(), WarehouseError>;

    /// Count rows whose `key` column equals any of `values`.
    async fn count_key_matches(
        &self,
        target: &TableTarget,
        key: &str,
        values: &[Value],
    ) -> Result<u64, WarehouseError>;

    /// Delete rows whose `key` column equals any of `values`; returns the
    /// number of deleted rows.
    async fn delete_key_matches(
        &self,
        target: &TableTarget,
        key: &str,
        values: &[Value],
    ) -> Result<u64, WarehouseError>;

    /// Count rows of `target` with a matching key tuple in `staging`.
    async fn count_join_matches(
        &self,
        target: &TableTarget,
        staging: &TableTarget,
        keys: &[String],
    ) -> Result<u64, WarehouseError>;

    /// Delete rows of `target` with a matching key tuple in `staging`;
    /// returns the number of deleted rows.
    async fn delete_join_matches(
        &self,
        target: &TableTarget,
        staging: &TableTarget,
        keys: &[String],
    ) -> Result<u64, WarehouseError>;

    /// Load a batch into an existing table; returns the written row count.
    async fn load_batch(
        &self,
        target: &TableTarget,
        batch: &Batch,
        disposition: WriteDisposition,
    ) -> Result<u64, WarehouseError>;

    /// Drop a table if it exists.
    async fn drop_table(&self, target: &TableTarget) -> Result<(), WarehouseError>;
}
