//! BigQuery backend for the [`Warehouse`] trait.
//!
//! Existence checks go through the REST `get` endpoints (404 means absent),
//! DDL and key deletes run as standard SQL jobs with named query parameters,
//! and batch loads stream through `tabledata().insert_all`. Every identifier
//! reaching a SQL string has passed the allow-list in [`TableTarget`] or
//! [`validate_identifier`].

use crate::batch::{Batch, ColumnType, Value};
use crate::error::ServiceSnafu;
use crate::warehouse::{
    validate_identifier, PartitionSpec, TableSchema, TableTarget, Warehouse, WarehouseError,
    WriteDisposition,
};
use async_trait::async_trait;
use gcp_bigquery_client::error::BQError;
use gcp_bigquery_client::model::dataset::Dataset;
use gcp_bigquery_client::model::field_type::FieldType;
use gcp_bigquery_client::model::query_parameter::QueryParameter;
use gcp_bigquery_client::model::query_parameter_type::QueryParameterType;
use gcp_bigquery_client::model::query_parameter_value::QueryParameterValue;
use gcp_bigquery_client::model::query_request::QueryRequest;
use gcp_bigquery_client::model::query_response::{QueryResponse, ResultSet};
use gcp_bigquery_client::model::table_data_insert_all_request::TableDataInsertAllRequest;
use gcp_bigquery_client::Client;
use snafu::prelude::*;
use tracing::debug;

/// Rows per streaming insert request.
const INSERT_CHUNK_ROWS: usize = 500;

pub struct BigQueryWarehouse {
    client: Client,
}

impl BigQueryWarehouse {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn from_service_account_key_file(path: &str) -> Result<Self, WarehouseError> {
        let client = Client::from_service_account_key_file(path)
            .await
            .context(ServiceSnafu)?;
        Ok(Self { client })
    }

    async fn run_query(
        &self,
        project: &str,
        request: QueryRequest,
    ) -> Result<QueryResponse, WarehouseError> {
        let response = self
            .client
            .job()
            .query(project, request)
            .await
            .context(ServiceSnafu)?;
        if !response.job_complete.unwrap_or(false) {
            return Err(WarehouseError::Backend {
                message: "query did not complete".to_string(),
            });
        }
        Ok(response)
    }

    async fn run_count(
        &self,
        project: &str,
        request: QueryRequest,
    ) -> Result<u64, WarehouseError> {
        let response = self.run_query(project, request).await?;
        let mut rows = ResultSet::new_from_query_response(response);
        if !rows.next_row() {
            return Ok(0);
        }
        let count = rows.get_i64_by_name("match_count").context(ServiceSnafu)?;
        Ok(count.unwrap_or(0).max(0) as u64)
    }

    async fn run_dml(
        &self,
        project: &str,
        request: QueryRequest,
    ) -> Result<u64, WarehouseError> {
        let response = self.run_query(project, request).await?;
        Ok(affected_rows(&response))
    }
}

fn affected_rows(response: &QueryResponse) -> u64 {
    response
        .num_dml_affected_rows
        .as_deref()
        .and_then(|n| n.parse::<u64>().ok())
        .unwrap_or(0)
}

fn is_not_found(error: &BQError) -> bool {
    matches!(error, BQError::ResponseError { error } if error.error.code == 404)
}

fn is_already_exists(error: &BQError) -> bool {
    matches!(error, BQError::ResponseError { error } if error.error.code == 409)
}

/// Map the REST schema's field type onto the loader's column types. The API
/// reports legacy names (`INTEGER`, `FLOAT`, `BOOLEAN`) even for tables
/// created with standard SQL types.
fn column_type_from_field(field_type: &FieldType) -> ColumnType {
    match field_type {
        FieldType::Integer => ColumnType::Int64,
        FieldType::Float => ColumnType::Float64,
        FieldType::Boolean => ColumnType::Bool,
        FieldType::Timestamp => ColumnType::Timestamp,
        _ => ColumnType::String,
    }
}

// ---- SQL construction ----
//
// Targets are pre-validated; column names are validated here, right before
// interpolation.

fn create_table_sql(
    target: &TableTarget,
    schema: &TableSchema,
    partition: Option<&PartitionSpec>,
    cluster: &[String],
) -> Result<String, WarehouseError> {
    let columns: Vec<String> = schema
        .columns()
        .iter()
        .map(|(name, ty)| {
            validate_identifier(name).map(|name| format!("`{name}` {}", ty.sql_name()))
        })
        .collect::<Result<_, _>>()?;
    let mut sql = format!("CREATE TABLE `{}` ({})", target.path(), columns.join(", "));
    if let Some(partition) = partition {
        let field = validate_identifier(&partition.field)?;
        sql.push_str(&format!(" PARTITION BY DATE(`{field}`)"));
    }
    if !cluster.is_empty() {
        let fields: Vec<String> = cluster
            .iter()
            .map(|f| validate_identifier(f).map(|f| format!("`{f}`")))
            .collect::<Result<_, _>>()?;
        sql.push_str(&format!(" CLUSTER BY {}", fields.join(", ")));
    }
    Ok(sql)
}

fn single_key_count_sql(target: &TableTarget, key: &str) -> Result<String, WarehouseError> {
    let key = validate_identifier(key)?;
    Ok(format!(
        "SELECT COUNT(*) AS match_count FROM `{}` WHERE `{key}` IN UNNEST(@keys)",
        target.path()
    ))
}

fn single_key_delete_sql(target: &TableTarget, key: &str) -> Result<String, WarehouseError> {
    let key = validate_identifier(key)?;
    Ok(format!(
        "DELETE FROM `{}` WHERE `{key}` IN UNNEST(@keys)",
        target.path()
    ))
}

fn join_predicate(keys: &[String]) -> Result<String, WarehouseError> {
    let clauses: Vec<String> = keys
        .iter()
        .map(|k| validate_identifier(k).map(|k| format!("main.`{k}` = staged.`{k}`")))
        .collect::<Result<_, _>>()?;
    Ok(clauses.join(" AND "))
}

fn join_count_sql(
    target: &TableTarget,
    staging: &TableTarget,
    keys: &[String],
) -> Result<String, WarehouseError> {
    Ok(format!(
        "SELECT COUNT(*) AS match_count FROM `{}` main \
         WHERE EXISTS (SELECT 1 FROM `{}` staged WHERE {})",
        target.path(),
        staging.path(),
        join_predicate(keys)?
    ))
}

fn join_delete_sql(
    target: &TableTarget,
    staging: &TableTarget,
    keys: &[String],
) -> Result<String, WarehouseError> {
    Ok(format!(
        "DELETE FROM `{}` main \
         WHERE EXISTS (SELECT 1 FROM `{}` staged WHERE {})",
        target.path(),
        staging.path(),
        join_predicate(keys)?
    ))
}

/// Text form of a value inside a query parameter.
fn parameter_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Int(n) => n.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Str(s) => s.clone(),
        Value::Timestamp(ts) => ts.to_rfc3339(),
    }
}

/// Typed `ARRAY` parameter carrying the key values with their native type.
fn array_parameter(name: &str, values: &[Value]) -> QueryParameter {
    let element_type = values
        .iter()
        .find_map(Value::column_type)
        .unwrap_or(ColumnType::String);
    QueryParameter {
        name: Some(name.to_string()),
        parameter_type: Some(QueryParameterType {
            r#type: "ARRAY".to_string(),
            array_type: Some(Box::new(QueryParameterType {
                r#type: element_type.sql_name().to_string(),
                array_type: None,
                struct_types: None,
            })),
            struct_types: None,
        }),
        parameter_value: Some(QueryParameterValue {
            value: None,
            array_values: Some(
                values
                    .iter()
                    .map(|v| QueryParameterValue {
                        value: Some(parameter_text(v)),
                        array_values: None,
                        struct_values: None,
                    })
                    .collect(),
            ),
            struct_values: None,
        }),
    }
}

fn keyed_request(sql: String, values: &[Value]) -> QueryRequest {
    let mut request = QueryRequest::new(sql);
    request.query_parameters = Some(vec![array_parameter("keys", values)]);
    request.parameter_mode = Some("NAMED".to_string());
    request
}

/// JSON object for one streamed row. Nulls are omitted rather than sent.
fn row_object(columns: &[String], row: &[Value]) -> serde_json::Map<String, serde_json::Value> {
    let mut object = serde_json::Map::new();
    for (name, value) in columns.iter().zip(row) {
        let json = match value {
            Value::Null => continue,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(n) => serde_json::Value::from(*n),
            Value::Float(f) => serde_json::Value::from(*f),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::Timestamp(ts) => serde_json::Value::String(ts.to_rfc3339()),
        };
        object.insert(name.clone(), json);
    }
    object
}

#[async_trait]
impl Warehouse for BigQueryWarehouse {
    async fn dataset_exists(&self, project: &str, dataset: &str) -> Result<bool, WarehouseError> {
        match self.client.dataset().get(project, dataset).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e).context(ServiceSnafu),
        }
    }

    async fn create_dataset(
        &self,
        project: &str,
        dataset: &str,
        location: &str,
    ) -> Result<(), WarehouseError> {
        let spec = Dataset::new(project, dataset).location(location);
        match self.client.dataset().create(spec).await {
            Ok(_) => Ok(()),
            // A concurrent run may have won the race; that is fine.
            Err(e) if is_already_exists(&e) => Ok(()),
            Err(e) => Err(e).context(ServiceSnafu),
        }
    }

    async fn table_exists(&self, target: &TableTarget) -> Result<bool, WarehouseError> {
        match self
            .client
            .table()
            .get(target.project(), target.dataset(), target.table(), None)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e).context(ServiceSnafu),
        }
    }

    async fn table_schema(&self, target: &TableTarget) -> Result<TableSchema, WarehouseError> {
        let table = match self
            .client
            .table()
            .get(target.project(), target.dataset(), target.table(), None)
            .await
        {
            Ok(table) => table,
            Err(e) if is_not_found(&e) => {
                return Err(WarehouseError::TableMissing {
                    target: target.path(),
                })
            }
            Err(e) => return Err(e).context(ServiceSnafu),
        };
        let columns = table
            .schema
            .fields
            .unwrap_or_default()
            .iter()
            .map(|field| (field.name.clone(), column_type_from_field(&field.r#type)))
            .collect();
        Ok(TableSchema::new(columns))
    }

    async fn create_table(
        &self,
        target: &TableTarget,
        schema: &TableSchema,
        partition: Option<&PartitionSpec>,
        cluster: &[String],
    ) -> Result<(), WarehouseError> {
        let sql = create_table_sql(target, schema, partition, cluster)?;
        debug!(target = %target, "creating table");
        self.run_query(target.project(), QueryRequest::new(sql))
            .await?;
        Ok(())
    }

    async fn count_key_matches(
        &self,
        target: &TableTarget,
        key: &str,
        values: &[Value],
    ) -> Result<u64, WarehouseError> {
        let sql = single_key_count_sql(target, key)?;
        self.run_count(target.project(), keyed_request(sql, values))
            .await
    }

    async fn delete_key_matches(
        &self,
        target: &TableTarget,
        key: &str,
        values: &[Value],
    ) -> Result<u64, WarehouseError> {
        let sql = single_key_delete_sql(target, key)?;
        self.run_dml(target.project(), keyed_request(sql, values))
            .await
    }

    async fn count_join_matches(
        &self,
        target: &TableTarget,
        staging: &TableTarget,
        keys: &[String],
    ) -> Result<u64, WarehouseError> {
        let sql = join_count_sql(target, staging, keys)?;
        self.run_count(target.project(), QueryRequest::new(sql))
            .await
    }

    async fn delete_join_matches(
        &self,
        target: &TableTarget,
        staging: &TableTarget,
        keys: &[String],
    ) -> Result<u64, WarehouseError> {
        let sql = join_delete_sql(target, staging, keys)?;
        self.run_dml(target.project(), QueryRequest::new(sql))
            .await
    }

    async fn load_batch(
        &self,
        target: &TableTarget,
        batch: &Batch,
        disposition: WriteDisposition,
    ) -> Result<u64, WarehouseError> {
        if disposition == WriteDisposition::Truncate {
            let sql = format!("TRUNCATE TABLE `{}`", target.path());
            self.run_query(target.project(), QueryRequest::new(sql))
                .await?;
        }
        for chunk in batch.rows().chunks(INSERT_CHUNK_ROWS) {
            let mut request = TableDataInsertAllRequest::new();
            for row in chunk {
                request
                    .add_row(None, row_object(batch.columns(), row))
                    .context(ServiceSnafu)?;
            }
            let response = self
                .client
                .tabledata()
                .insert_all(target.project(), target.dataset(), target.table(), request)
                .await
                .context(ServiceSnafu)?;
            if let Some(errors) = &response.insert_errors {
                if !errors.is_empty() {
                    return Err(WarehouseError::RowsRejected {
                        target: target.path(),
                        count: errors.len(),
                    });
                }
            }
        }
        // The streaming API does not report a written count; the request only
        // succeeds when every row was accepted.
        Ok(batch.row_count() as u64)
    }

    async fn drop_table(&self, target: &TableTarget) -> Result<(), WarehouseError> {
        let sql = format!("DROP TABLE IF EXISTS `{}`", target.path());
        self.run_query(target.project(), QueryRequest::new(sql))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn target() -> TableTarget {
        TableTarget::parse("proj.raw.budget_m012025").unwrap()
    }

    #[test]
    fn create_table_ddl_includes_partition_and_cluster() {
        let schema = TableSchema::new(vec![
            ("month".to_string(), ColumnType::String),
            ("actual_budget".to_string(), ColumnType::Int64),
            ("last_updated_at".to_string(), ColumnType::Timestamp),
        ]);
        let sql = create_table_sql(
            &target(),
            &schema,
            Some(&PartitionSpec {
                field: "last_updated_at".into(),
            }),
            &["month".to_string()],
        )
        .unwrap();
        assert_eq!(
            sql,
            "CREATE TABLE `proj.raw.budget_m012025` \
             (`month` STRING, `actual_budget` INT64, `last_updated_at` TIMESTAMP) \
             PARTITION BY DATE(`last_updated_at`) CLUSTER BY `month`"
        );
    }

    #[test]
    fn create_table_ddl_rejects_bad_column_name() {
        let schema = TableSchema::new(vec![("bad`col".to_string(), ColumnType::String)]);
        assert!(create_table_sql(&target(), &schema, None, &[]).is_err());
    }

    #[test]
    fn single_key_sql_uses_set_membership() {
        let sql = single_key_delete_sql(&target(), "month").unwrap();
        assert_eq!(
            sql,
            "DELETE FROM `proj.raw.budget_m012025` WHERE `month` IN UNNEST(@keys)"
        );
        assert!(single_key_delete_sql(&target(), "mo nth").is_err());
    }

    #[test]
    fn join_delete_sql_correlates_all_keys() {
        let staging = target().sibling("_staging_delete_keys_ab12cd34").unwrap();
        let keys = vec!["month".to_string(), "region".to_string()];
        let sql = join_delete_sql(&target(), &staging, &keys).unwrap();
        assert_eq!(
            sql,
            "DELETE FROM `proj.raw.budget_m012025` main \
             WHERE EXISTS (SELECT 1 FROM `proj.raw._staging_delete_keys_ab12cd34` staged \
             WHERE main.`month` = staged.`month` AND main.`region` = staged.`region`)"
        );
    }

    #[test]
    fn array_parameter_keeps_native_element_type() {
        let param = array_parameter("keys", &[Value::Int(202501), Value::Int(202502)]);
        let ty = param.parameter_type.unwrap();
        assert_eq!(ty.r#type, "ARRAY");
        assert_eq!(ty.array_type.unwrap().r#type, "INT64");
        let values = param.parameter_value.unwrap().array_values.unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values[0].value.as_deref(), Some("202501"));
    }

    #[test]
    fn array_parameter_defaults_to_string() {
        let param = array_parameter("keys", &[Value::Str("2025-01".into())]);
        let ty = param.parameter_type.unwrap();
        assert_eq!(ty.array_type.unwrap().r#type, "STRING");
    }

    #[test]
    fn row_object_omits_nulls_and_formats_timestamps() {
        let columns = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let ts = Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap();
        let object = row_object(
            &columns,
            &[Value::Null, Value::Int(5), Value::Timestamp(ts)],
        );
        assert!(!object.contains_key("a"));
        assert_eq!(object["b"], serde_json::json!(5));
        assert_eq!(object["c"], serde_json::json!("2025-01-15T00:00:00+00:00"));
    }
}
