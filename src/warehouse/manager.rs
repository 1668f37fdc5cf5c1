//! The table manager: dataset/table bootstrap plus key-scoped conflict
//! resolution ahead of an append-disposition load.
//!
//! Every [`TableManager::load`] re-evaluates dataset and table existence from
//! scratch, so concurrent or repeated runs converge on the same state. Rows
//! matching the batch's key values are deleted before the append, which makes
//! re-running the same load idempotent.

use crate::batch::{Batch, Value};
use crate::error::{
    KeyColumnsAbsentSnafu, KeyTypeMismatchSnafu, MissingKeysSnafu, StagingCleanupSnafu,
};
use crate::warehouse::{
    LoadMode, LoadResult, LoadSpec, TableSchema, TableTarget, Warehouse, WarehouseError,
    WriteDisposition,
};
use snafu::prelude::*;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Prefix for short-lived key staging tables.
const STAGING_PREFIX: &str = "_staging_delete_keys_";

/// Drives one load through bootstrap, conflict resolution and append.
pub struct TableManager<'a, W: Warehouse + ?Sized> {
    warehouse: &'a W,
    /// Region for datasets created on demand.
    location: String,
}

impl<'a, W: Warehouse + ?Sized> TableManager<'a, W> {
    pub fn new(warehouse: &'a W, location: impl Into<String>) -> Self {
        Self {
            warehouse,
            location: location.into(),
        }
    }

    /// Load `batch` into `target` according to `spec`.
    ///
    /// Freshly created tables skip conflict resolution: they cannot contain
    /// conflicting rows, and the batch itself is assumed deduplicated
    /// upstream.
    pub async fn load(
        &self,
        batch: &Batch,
        target: &TableTarget,
        spec: &LoadSpec,
    ) -> Result<LoadResult, WarehouseError> {
        self.ensure_dataset(target).await?;
        let existed = self.ensure_table(batch, target, spec).await?;

        let deleted = if existed && spec.mode == LoadMode::Upsert {
            self.resolve_conflicts(batch, target, spec).await?
        } else {
            if spec.mode == LoadMode::Insert {
                debug!(target = %target, "insert mode, skipping conflict resolution");
            }
            0
        };

        let written = self
            .warehouse
            .load_batch(target, batch, WriteDisposition::Append)
            .await?;
        info!(target = %target, deleted, written, "load complete");

        Ok(LoadResult {
            deleted,
            written,
            target: target.clone(),
        })
    }

    async fn ensure_dataset(&self, target: &TableTarget) -> Result<(), WarehouseError> {
        if self
            .warehouse
            .dataset_exists(target.project(), target.dataset())
            .await?
        {
            return Ok(());
        }
        info!(dataset = target.dataset(), location = %self.location, "creating dataset");
        self.warehouse
            .create_dataset(target.project(), target.dataset(), &self.location)
            .await
    }

    /// Returns whether the table already existed before this call.
    async fn ensure_table(
        &self,
        batch: &Batch,
        target: &TableTarget,
        spec: &LoadSpec,
    ) -> Result<bool, WarehouseError> {
        if self.warehouse.table_exists(target).await? {
            return Ok(true);
        }
        let schema = TableSchema::new(batch.infer_schema());
        info!(
            target = %target,
            columns = schema.columns().len(),
            partition = spec.partition.as_ref().map(|p| p.field.as_str()),
            "creating table"
        );
        self.warehouse
            .create_table(target, &schema, spec.partition.as_ref(), &spec.cluster)
            .await?;
        Ok(false)
    }

    /// Delete target rows that collide with the batch on the declared keys.
    async fn resolve_conflicts(
        &self,
        batch: &Batch,
        target: &TableTarget,
        spec: &LoadSpec,
    ) -> Result<u64, WarehouseError> {
        ensure!(
            !spec.keys.is_empty(),
            MissingKeysSnafu {
                target: target.path()
            }
        );
        let absent: Vec<String> = spec
            .keys
            .iter()
            .filter(|k| !batch.has_column(k))
            .cloned()
            .collect();
        ensure!(absent.is_empty(), KeyColumnsAbsentSnafu { columns: absent });

        // Keys were just validated present, so the projection cannot fail.
        let key_rows = batch
            .distinct_non_null(&spec.keys)
            .unwrap_or_else(|| Batch::new(spec.keys.clone()));
        if key_rows.is_empty() {
            debug!(target = %target, "no non-null key values, nothing to delete");
            return Ok(0);
        }

        if let [key] = spec.keys.as_slice() {
            self.delete_single_key(target, key, &key_rows).await
        } else {
            self.delete_composite_keys(batch, target, spec, &key_rows)
                .await
        }
    }

    /// Single-key path: parameterized set-membership delete, preceded by a
    /// count so clean loads skip the DML statement entirely.
    async fn delete_single_key(
        &self,
        target: &TableTarget,
        key: &str,
        key_rows: &Batch,
    ) -> Result<u64, WarehouseError> {
        let values: Vec<Value> = key_rows.rows().iter().map(|r| r[0].clone()).collect();
        let matches = self
            .warehouse
            .count_key_matches(target, key, &values)
            .await?;
        if matches == 0 {
            debug!(target = %target, key, "no conflicting rows");
            return Ok(0);
        }
        let deleted = self
            .warehouse
            .delete_key_matches(target, key, &values)
            .await?;
        info!(target = %target, key, deleted, "deleted conflicting rows");
        Ok(deleted)
    }

    /// Composite-key path: stage the distinct key tuples in a uniquely named
    /// sibling table and delete via a key-tuple join. The staging table is
    /// dropped in a final cleanup step regardless of how the delete went.
    async fn delete_composite_keys(
        &self,
        batch: &Batch,
        target: &TableTarget,
        spec: &LoadSpec,
        key_rows: &Batch,
    ) -> Result<u64, WarehouseError> {
        self.check_key_types(batch, target, spec).await?;

        let suffix = Uuid::new_v4().simple().to_string();
        let staging = target.sibling(&format!("{STAGING_PREFIX}{}", &suffix[..8]))?;

        let schema = TableSchema::new(key_rows.infer_schema());
        self.warehouse
            .create_table(&staging, &schema, None, &[])
            .await?;
        debug!(staging = %staging, tuples = key_rows.row_count(), "staged delete keys");

        let outcome = self.join_delete(target, &staging, key_rows, spec).await;
        let cleanup = self.warehouse.drop_table(&staging).await;

        match (outcome, cleanup) {
            (Ok(deleted), Ok(())) => Ok(deleted),
            (Ok(_), Err(e)) => StagingCleanupSnafu {
                staging: staging.path(),
                message: e.to_string(),
            }
            .fail(),
            (Err(e), cleanup) => {
                if let Err(cleanup_err) = cleanup {
                    // Never mask the delete failure with the cleanup failure.
                    warn!(staging = %staging, error = %cleanup_err, "staging cleanup failed");
                }
                Err(e)
            }
        }
    }

    async fn join_delete(
        &self,
        target: &TableTarget,
        staging: &TableTarget,
        key_rows: &Batch,
        spec: &LoadSpec,
    ) -> Result<u64, WarehouseError> {
        self.warehouse
            .load_batch(staging, key_rows, WriteDisposition::Truncate)
            .await?;
        let matches = self
            .warehouse
            .count_join_matches(target, staging, &spec.keys)
            .await?;
        if matches == 0 {
            debug!(target = %target, "no conflicting rows");
            return Ok(0);
        }
        let deleted = self
            .warehouse
            .delete_join_matches(target, staging, &spec.keys)
            .await?;
        info!(target = %target, deleted, "deleted conflicting rows");
        Ok(deleted)
    }

    /// Assert every key's batch type matches the target table's authoritative
    /// column type before any DML runs.
    async fn check_key_types(
        &self,
        batch: &Batch,
        target: &TableTarget,
        spec: &LoadSpec,
    ) -> Result<(), WarehouseError> {
        let table_schema = self.warehouse.table_schema(target).await?;
        for key in &spec.keys {
            let Some(expected) = table_schema.column_type(key) else {
                return KeyColumnsAbsentSnafu {
                    columns: vec![key.clone()],
                }
                .fail();
            };
            // All-null key columns never reach here; distinct_non_null
            // produced at least one concrete value per key row.
            if let Some(actual) = batch.column_type(key) {
                ensure!(
                    actual == expected,
                    KeyTypeMismatchSnafu {
                        column: key.clone(),
                        expected: expected.to_string(),
                        actual: actual.to_string(),
                    }
                );
            }
        }
        Ok(())
    }
}
