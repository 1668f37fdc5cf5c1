//! In-memory warehouse backend.
//!
//! Mirrors the observable semantics of the BigQuery backend (existence checks,
//! schema-ordered storage, key deletes, append/truncate loads) for tests and
//! dry runs, plus failure injection for the cleanup-guarantee tests.

use crate::batch::{Batch, Value};
use crate::warehouse::{
    PartitionSpec, TableSchema, TableTarget, Warehouse, WarehouseError, WriteDisposition,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

/// Stored shape of one table.
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub schema: TableSchema,
    pub partition: Option<PartitionSpec>,
    pub cluster: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

#[derive(Debug, Default)]
struct Inner {
    datasets: BTreeSet<String>,
    tables: BTreeMap<String, TableInfo>,
    fail_next_join_delete: bool,
    fail_next_drop: bool,
}

/// HashMap-backed warehouse used by unit and integration tests.
#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    inner: Mutex<Inner>,
}

impl MemoryWarehouse {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next `delete_join_matches` call fail.
    pub fn inject_join_delete_failure(&self) {
        self.lock().fail_next_join_delete = true;
    }

    /// Make the next `drop_table` call fail.
    pub fn inject_drop_failure(&self) {
        self.lock().fail_next_drop = true;
    }

    pub fn has_dataset(&self, project: &str, dataset: &str) -> bool {
        self.lock().datasets.contains(&format!("{project}.{dataset}"))
    }

    pub fn has_table(&self, path: &str) -> bool {
        self.lock().tables.contains_key(path)
    }

    /// All table paths currently present, sorted.
    pub fn table_names(&self) -> Vec<String> {
        self.lock().tables.keys().cloned().collect()
    }

    pub fn table_info(&self, path: &str) -> Option<TableInfo> {
        self.lock().tables.get(path).cloned()
    }

    pub fn table_rows(&self, path: &str) -> Option<Vec<Vec<Value>>> {
        self.lock().tables.get(path).map(|t| t.rows.clone())
    }

    /// True when no dataset or table was ever created.
    pub fn is_untouched(&self) -> bool {
        let inner = self.lock();
        inner.datasets.is_empty() && inner.tables.is_empty()
    }
}

fn missing(target: &TableTarget) -> WarehouseError {
    WarehouseError::TableMissing {
        target: target.path(),
    }
}

fn column_index(info: &TableInfo, name: &str) -> Option<usize> {
    info.schema.column_names().position(|n| n == name)
}

/// Does `row` of `target_info` match any staged key tuple?
fn matches_staged(
    row: &[Value],
    target_info: &TableInfo,
    staging_info: &TableInfo,
    keys: &[String],
) -> bool {
    staging_info.rows.iter().any(|staged| {
        keys.iter().all(|key| {
            let target_idx = column_index(target_info, key);
            let staging_idx = column_index(staging_info, key);
            match (target_idx, staging_idx) {
                (Some(t), Some(s)) => row[t] == staged[s],
                _ => false,
            }
        })
    })
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn dataset_exists(&self, project: &str, dataset: &str) -> Result<bool, WarehouseError> {
        Ok(self.lock().datasets.contains(&format!("{project}.{dataset}")))
    }

    async fn create_dataset(
        &self,
        project: &str,
        dataset: &str,
        _location: &str,
    ) -> Result<(), WarehouseError> {
        // Already-exists is success, matching the real backend's tolerance.
        self.lock().datasets.insert(format!("{project}.{dataset}"));
        Ok(())
    }

    async fn table_exists(&self, target: &TableTarget) -> Result<bool, WarehouseError> {
        Ok(self.lock().tables.contains_key(&target.path()))
    }

    async fn table_schema(&self, target: &TableTarget) -> Result<TableSchema, WarehouseError> {
        self.lock()
            .tables
            .get(&target.path())
            .map(|t| t.schema.clone())
            .ok_or_else(|| missing(target))
    }

    async fn create_table(
        &self,
        target: &TableTarget,
        schema: &TableSchema,
        partition: Option<&PartitionSpec>,
        cluster: &[String],
    ) -> Result<(), WarehouseError> {
        let mut inner = self.lock();
        if inner.tables.contains_key(&target.path()) {
            return Err(WarehouseError::Backend {
                message: format!("table {} already exists", target.path()),
            });
        }
        inner.tables.insert(
            target.path(),
            TableInfo {
                schema: schema.clone(),
                partition: partition.cloned(),
                cluster: cluster.to_vec(),
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    async fn count_key_matches(
        &self,
        target: &TableTarget,
        key: &str,
        values: &[Value],
    ) -> Result<u64, WarehouseError> {
        let inner = self.lock();
        let info = inner.tables.get(&target.path()).ok_or_else(|| missing(target))?;
        let Some(idx) = column_index(info, key) else {
            return Ok(0);
        };
        Ok(info.rows.iter().filter(|r| values.contains(&r[idx])).count() as u64)
    }

    async fn delete_key_matches(
        &self,
        target: &TableTarget,
        key: &str,
        values: &[Value],
    ) -> Result<u64, WarehouseError> {
        let mut inner = self.lock();
        let info = inner
            .tables
            .get_mut(&target.path())
            .ok_or_else(|| missing(target))?;
        let Some(idx) = column_index(info, key) else {
            return Ok(0);
        };
        let before = info.rows.len();
        info.rows.retain(|r| !values.contains(&r[idx]));
        Ok((before - info.rows.len()) as u64)
    }

    async fn count_join_matches(
        &self,
        target: &TableTarget,
        staging: &TableTarget,
        keys: &[String],
    ) -> Result<u64, WarehouseError> {
        let inner = self.lock();
        let target_info = inner.tables.get(&target.path()).ok_or_else(|| missing(target))?;
        let staging_info = inner
            .tables
            .get(&staging.path())
            .ok_or_else(|| missing(staging))?;
        Ok(target_info
            .rows
            .iter()
            .filter(|r| matches_staged(r, target_info, staging_info, keys))
            .count() as u64)
    }

    async fn delete_join_matches(
        &self,
        target: &TableTarget,
        staging: &TableTarget,
        keys: &[String],
    ) -> Result<u64, WarehouseError> {
        let mut inner = self.lock();
        if inner.fail_next_join_delete {
            inner.fail_next_join_delete = false;
            return Err(WarehouseError::Backend {
                message: "injected delete failure".to_string(),
            });
        }
        let staging_info = inner
            .tables
            .get(&staging.path())
            .ok_or_else(|| missing(staging))?
            .clone();
        let target_info = inner
            .tables
            .get_mut(&target.path())
            .ok_or_else(|| missing(target))?;
        let snapshot = target_info.clone();
        let before = target_info.rows.len();
        target_info
            .rows
            .retain(|r| !matches_staged(r, &snapshot, &staging_info, keys));
        Ok((before - target_info.rows.len()) as u64)
    }

    async fn load_batch(
        &self,
        target: &TableTarget,
        batch: &Batch,
        disposition: WriteDisposition,
    ) -> Result<u64, WarehouseError> {
        let mut inner = self.lock();
        let info = inner
            .tables
            .get_mut(&target.path())
            .ok_or_else(|| missing(target))?;
        if disposition == WriteDisposition::Truncate {
            info.rows.clear();
        }
        // Rows are reordered into the table's schema order; columns the table
        // does not know are dropped, absent ones become null.
        let indices: Vec<Option<usize>> = info
            .schema
            .column_names()
            .map(|name| batch.column_index(name))
            .collect();
        for row in batch.rows() {
            info.rows.push(
                indices
                    .iter()
                    .map(|idx| idx.map_or(Value::Null, |i| row[i].clone()))
                    .collect(),
            );
        }
        Ok(batch.row_count() as u64)
    }

    async fn drop_table(&self, target: &TableTarget) -> Result<(), WarehouseError> {
        let mut inner = self.lock();
        if inner.fail_next_drop {
            inner.fail_next_drop = false;
            return Err(WarehouseError::Backend {
                message: "injected drop failure".to_string(),
            });
        }
        // Absent table is fine, mirroring DROP TABLE IF EXISTS.
        inner.tables.remove(&target.path());
        Ok(())
    }
}
