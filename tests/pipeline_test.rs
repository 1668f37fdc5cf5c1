//! End-to-end runs against the in-memory warehouse and a scripted source.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tally::error::ExtractError;
use tally::schema::{enforce, DeclaredSchema};
use tally::source::{Extraction, RecordSource};
use tally::transform::REQUIRED_COLUMNS;
use tally::warehouse::WriteDisposition;
use tally::{
    Batch, Config, MemoryWarehouse, Pipeline, RunError, RunOutcome, TableTarget, Value, Warehouse,
};

const TARGET_PATH: &str =
    "acme-analytics.acme_dataset_recon_api_raw.acme_table_budget_growth_paid_media_allocation_m012025";

/// Pops one scripted response per fetch call and counts the calls.
struct ScriptedSource {
    responses: Mutex<VecDeque<Result<Extraction, ExtractError>>>,
    calls: AtomicU32,
}

impl ScriptedSource {
    fn new(responses: Vec<Result<Extraction, ExtractError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            calls: AtomicU32::new(0),
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordSource for ScriptedSource {
    async fn fetch(
        &self,
        _spreadsheet_id: &str,
        _worksheet: &str,
    ) -> Result<Extraction, ExtractError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .expect("scripted source ran out of responses")
    }
}

fn config(extra: &str) -> Config {
    let raw = format!(
        r#"
identity:
  company: acme
  project: acme-analytics
  department: growth
  account: paid_media
source:
  month: "2025-01"
  spreadsheet_id: sheet-123
  token: test-token
retry:
  attempts: 3
  backoff_secs: 0
  backoff_step_secs: 0
materialize:
  enabled: false
{extra}"#
    );
    Config::parse(&raw).unwrap()
}

/// A worksheet batch in the raw fetch shape.
fn sheet_rows(rows: &[(&str, &str, &str, i64)]) -> Extraction {
    let columns: Vec<String> = REQUIRED_COLUMNS.iter().map(|c| c.to_string()).collect();
    let mut batch = Batch::new(columns);
    for (month, region, group, initial) in rows {
        batch.push_row(vec![
            Value::Str(month.to_string()),
            Value::Str(region.to_string()),
            Value::Str(group.to_string()),
            Value::Str("sub".into()),
            Value::Str("cat".into()),
            Value::Str("track".into()),
            Value::Str("pillar".into()),
            Value::Str("content".into()),
            Value::Str("social".into()),
            Value::Str("reach".into()),
            Value::Str("2025-01-01".into()),
            Value::Str("2025-01-31".into()),
            Value::Int(*initial),
            Value::Int(10),
            Value::Int(5),
        ]);
    }
    Extraction {
        batch,
        elapsed: Duration::from_millis(1),
    }
}

fn empty_sheet() -> Extraction {
    Extraction {
        batch: Batch::default(),
        elapsed: Duration::from_millis(1),
    }
}

fn retryable() -> ExtractError {
    ExtractError::SheetStatus { status: 503 }
}

#[tokio::test]
async fn empty_worksheet_skips_without_touching_warehouse() {
    let config = config("");
    let source = ScriptedSource::new(vec![Ok(empty_sheet())]);
    let warehouse = MemoryWarehouse::default();

    let outcome = Pipeline::new(&source, &warehouse, &config)
        .run("sheet-123")
        .await
        .unwrap();

    assert_eq!(outcome, RunOutcome::SkippedEmpty);
    assert!(warehouse.is_untouched());
    assert_eq!(source.calls(), 1);
}

#[tokio::test]
async fn first_load_creates_partitioned_clustered_table() {
    let config = config("");
    let source = ScriptedSource::new(vec![Ok(sheet_rows(&[
        ("2025-01", "north", "KP", 100),
        ("2025-01", "south", "NC", 200),
    ]))]);
    let warehouse = MemoryWarehouse::default();

    let outcome = Pipeline::new(&source, &warehouse, &config)
        .run("sheet-123")
        .await
        .unwrap();

    let RunOutcome::Loaded(result) = outcome else {
        panic!("expected a load");
    };
    assert_eq!(result.deleted, 0);
    assert_eq!(result.written, 2);
    assert_eq!(result.target.path(), TARGET_PATH);

    let table = warehouse.table_info(TARGET_PATH).unwrap();
    assert_eq!(table.partition.unwrap().field, "last_updated_at");
    assert_eq!(table.cluster, ["month"]);
    let expected_columns: Vec<&str> = DeclaredSchema::staging_budget_allocation()
        .columns()
        .iter()
        .map(|c| c.name)
        .collect();
    let actual_columns: Vec<&str> = table.schema.column_names().collect();
    assert_eq!(actual_columns, expected_columns);
    assert_eq!(table.rows.len(), 2);
}

#[tokio::test]
async fn rerunning_the_same_load_is_idempotent() {
    let config = config("");
    let rows = [("2025-01", "north", "KP", 100), ("2025-01", "south", "NC", 200)];
    let source = ScriptedSource::new(vec![Ok(sheet_rows(&rows)), Ok(sheet_rows(&rows))]);
    let warehouse = MemoryWarehouse::default();
    let pipeline = Pipeline::new(&source, &warehouse, &config);

    pipeline.run("sheet-123").await.unwrap();
    let second = pipeline.run("sheet-123").await.unwrap();

    let RunOutcome::Loaded(result) = second else {
        panic!("expected a load");
    };
    assert_eq!(result.deleted, 2);
    assert_eq!(result.written, 2);
    assert_eq!(warehouse.table_rows(TARGET_PATH).unwrap().len(), 2);
}

#[tokio::test]
async fn reload_leaves_other_months_untouched() {
    let config = config("");
    let first = [
        ("2025-01", "north", "KP", 100),
        ("2025-01", "south", "NC", 200),
        ("2025-01", "east", "KD", 300),
        ("2025-01", "west", "CS", 400),
        ("2025-01", "center", "HC", 500),
    ];
    let second = [
        ("2025-01", "north", "KP", 111),
        ("2025-01", "south", "NC", 222),
        ("2025-01", "east", "KD", 333),
    ];
    let source = ScriptedSource::new(vec![Ok(sheet_rows(&first)), Ok(sheet_rows(&second))]);
    let warehouse = MemoryWarehouse::default();
    let pipeline = Pipeline::new(&source, &warehouse, &config);
    pipeline.run("sheet-123").await.unwrap();

    // Seed rows for a neighboring month directly into the same table.
    let target = TableTarget::parse(TARGET_PATH).unwrap();
    let other = enforce(
        &sheet_rows(&[
            ("2025-02", "north", "KP", 1),
            ("2025-02", "south", "NC", 2),
            ("2025-02", "east", "KD", 3),
        ])
        .batch,
        &DeclaredSchema::fetch_budget_allocation(),
    );
    warehouse
        .load_batch(&target, &other, WriteDisposition::Append)
        .await
        .unwrap();
    assert_eq!(warehouse.table_rows(TARGET_PATH).unwrap().len(), 8);

    let outcome = pipeline.run("sheet-123").await.unwrap();
    let RunOutcome::Loaded(result) = outcome else {
        panic!("expected a load");
    };
    assert_eq!(result.deleted, 5);
    assert_eq!(result.written, 3);
    assert_eq!(warehouse.table_rows(TARGET_PATH).unwrap().len(), 6);
}

#[tokio::test]
async fn transient_failures_retry_until_success() {
    let config = config("");
    let source = ScriptedSource::new(vec![
        Err(retryable()),
        Err(retryable()),
        Ok(sheet_rows(&[("2025-01", "north", "KP", 100)])),
    ]);
    let warehouse = MemoryWarehouse::default();

    let outcome = Pipeline::new(&source, &warehouse, &config)
        .run("sheet-123")
        .await
        .unwrap();

    assert!(matches!(outcome, RunOutcome::Loaded(_)));
    assert_eq!(source.calls(), 3);
}

#[tokio::test]
async fn retries_stop_at_the_attempt_budget() {
    let config = config("");
    let source = ScriptedSource::new(vec![
        Err(retryable()),
        Err(retryable()),
        Err(retryable()),
    ]);
    let warehouse = MemoryWarehouse::default();

    let err = Pipeline::new(&source, &warehouse, &config)
        .run("sheet-123")
        .await
        .unwrap_err();

    assert!(matches!(err, RunError::AttemptsExhausted { attempts: 3, .. }));
    assert_eq!(source.calls(), 3);
    assert!(warehouse.is_untouched());
}

#[tokio::test]
async fn fatal_failure_aborts_on_first_attempt() {
    let config = config("");
    let source = ScriptedSource::new(vec![Err(ExtractError::AuthExpired { status: 401 })]);
    let warehouse = MemoryWarehouse::default();

    let err = Pipeline::new(&source, &warehouse, &config)
        .run("sheet-123")
        .await
        .unwrap_err();

    assert!(matches!(err, RunError::Extract { .. }));
    assert_eq!(source.calls(), 1);
}

#[tokio::test]
async fn composite_key_runs_leave_no_staging_tables() {
    let config = config("load:\n  keys: [month, region]\n");
    let rows = [("2025-01", "north", "KP", 100), ("2025-01", "south", "NC", 200)];
    let source = ScriptedSource::new(vec![Ok(sheet_rows(&rows)), Ok(sheet_rows(&rows))]);
    let warehouse = MemoryWarehouse::default();
    let pipeline = Pipeline::new(&source, &warehouse, &config);

    pipeline.run("sheet-123").await.unwrap();
    pipeline.run("sheet-123").await.unwrap();

    assert_eq!(warehouse.table_names(), vec![TARGET_PATH.to_string()]);
    assert_eq!(warehouse.table_rows(TARGET_PATH).unwrap().len(), 2);
}

#[tokio::test]
async fn staging_is_dropped_even_when_the_delete_fails() {
    let config = config("load:\n  keys: [month, region]\n");
    let rows = [("2025-01", "north", "KP", 100)];
    let source = ScriptedSource::new(vec![Ok(sheet_rows(&rows)), Ok(sheet_rows(&rows))]);
    let warehouse = MemoryWarehouse::default();
    let pipeline = Pipeline::new(&source, &warehouse, &config);

    pipeline.run("sheet-123").await.unwrap();
    warehouse.inject_join_delete_failure();
    let err = pipeline.run("sheet-123").await.unwrap_err();

    assert!(err.is_warehouse());
    assert_eq!(warehouse.table_names(), vec![TARGET_PATH.to_string()]);
}

#[tokio::test]
async fn enrichment_lands_in_the_warehouse_rows() {
    let config = config("");
    let source = ScriptedSource::new(vec![Ok(sheet_rows(&[("2025-01", "north", "KP", 100)]))]);
    let warehouse = MemoryWarehouse::default();

    Pipeline::new(&source, &warehouse, &config)
        .run("sheet-123")
        .await
        .unwrap();

    let table = warehouse.table_info(TARGET_PATH).unwrap();
    let col = |name: &str| table.schema.column_names().position(|n| n == name).unwrap();
    let row = &table.rows[0];
    // initial 100 + adjusted 10 + additional 5
    assert_eq!(row[col("actual_budget")], Value::Int(115));
    assert_eq!(row[col("grouped_marketing_budget")], Value::Int(115));
    assert_eq!(row[col("grouped_supplier_budget")], Value::Int(0));
    assert_eq!(row[col("year")], Value::Int(2025));
    assert_eq!(row[col("total_effective_days")], Value::Int(30));
    assert!(matches!(row[col("last_updated_at")], Value::Timestamp(_)));
}
