//! Enrichment: derived budget metrics, group buckets and date arithmetic.
//!
//! Input is the normalized worksheet batch; output adds the derived columns
//! the warehouse table carries. Date arithmetic runs in the UTC+7 civil
//! calendar the budgets are planned in.

use crate::batch::{Batch, Value};
use crate::error::{MissingColumnsSnafu, TransformError};
use crate::schema::parse_timestamp;
use chrono::{DateTime, FixedOffset, Utc};
use snafu::prelude::*;

/// Columns the enrichment stage requires in its input.
pub const REQUIRED_COLUMNS: [&str; 15] = [
    "month",
    "region",
    "budget_group_1",
    "budget_group_2",
    "category_level_1",
    "track_group",
    "pillar_group",
    "content_group",
    "platform",
    "objective",
    "start_date",
    "end_date",
    "initial_budget",
    "adjusted_budget",
    "additional_budget",
];

/// Budget-group codes and the bucket column each one feeds.
const BUCKETS: [(&str, &str); 5] = [
    ("KP", "grouped_marketing_budget"),
    ("NC", "grouped_supplier_budget"),
    ("KD", "grouped_retail_budget"),
    ("CS", "grouped_customer_budget"),
    ("HC", "grouped_recruitment_budget"),
];

/// Planning timezone for date arithmetic.
fn planning_offset() -> FixedOffset {
    FixedOffset::east_opt(7 * 3600).expect("UTC+7 is a valid offset")
}

/// Enrich a normalized batch with the derived warehouse columns.
pub fn enrich(batch: &Batch) -> Result<Batch, TransformError> {
    enrich_at(batch, Utc::now())
}

/// Enrichment with an explicit clock, the seam the tests use.
pub fn enrich_at(batch: &Batch, now: DateTime<Utc>) -> Result<Batch, TransformError> {
    let missing: Vec<String> = REQUIRED_COLUMNS
        .iter()
        .filter(|c| !batch.has_column(c))
        .map(|c| c.to_string())
        .collect();
    ensure!(missing.is_empty(), MissingColumnsSnafu { columns: missing });

    let offset = planning_offset();
    let today = now.with_timezone(&offset).date_naive();

    let mut columns: Vec<String> = batch.columns().to_vec();
    columns.extend(
        [
            "actual_budget",
            "grouped_marketing_budget",
            "grouped_supplier_budget",
            "grouped_retail_budget",
            "grouped_customer_budget",
            "grouped_recruitment_budget",
            "year",
            "total_effective_days",
            "total_elapsed_days",
            "last_updated_at",
        ]
        .map(String::from),
    );
    let mut out = Batch::new(columns);

    let start_idx = batch.column_index("start_date");
    let end_idx = batch.column_index("end_date");

    for row_idx in 0..batch.row_count() {
        let mut row: Vec<Value> = batch.rows()[row_idx].clone();

        let actual = amount(batch, row_idx, "initial_budget")
            + amount(batch, row_idx, "adjusted_budget")
            + amount(batch, row_idx, "additional_budget");

        let group = batch
            .value(row_idx, "budget_group_1")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or("");

        let start = date_value(&row, start_idx);
        let end = date_value(&row, end_idx);

        // Dates are rewritten in place as parsed timestamps.
        if let (Some(idx), Some(ts)) = (start_idx, start) {
            row[idx] = Value::Timestamp(ts);
        }
        if let (Some(idx), Some(ts)) = (end_idx, end) {
            row[idx] = Value::Timestamp(ts);
        }

        row.push(Value::Int(actual));
        for (code, _) in BUCKETS {
            row.push(if group == code {
                Value::Int(actual)
            } else {
                Value::Int(0)
            });
        }

        row.push(year_of(batch.value(row_idx, "month")));

        let effective = match (start, end) {
            (Some(s), Some(e)) => {
                let days = (e.with_timezone(&offset).date_naive()
                    - s.with_timezone(&offset).date_naive())
                .num_days();
                Value::Int(days)
            }
            _ => Value::Null,
        };
        row.push(effective);

        let elapsed = match start {
            Some(s) => {
                let days = (today - s.with_timezone(&offset).date_naive()).num_days();
                // Allocations starting in the future count as zero elapsed.
                Value::Int(days.max(0))
            }
            None => Value::Null,
        };
        row.push(elapsed);

        row.push(Value::Timestamp(now));
        out.push_row(row);
    }
    Ok(out)
}

fn amount(batch: &Batch, row: usize, column: &str) -> i64 {
    batch
        .value(row, column)
        .and_then(Value::as_i64)
        .unwrap_or(0)
}

fn date_value(row: &[Value], idx: Option<usize>) -> Option<DateTime<Utc>> {
    match row.get(idx?)? {
        Value::Timestamp(ts) => Some(*ts),
        Value::Str(s) => parse_timestamp(s),
        _ => None,
    }
}

fn year_of(month: Option<&Value>) -> Value {
    month
        .and_then(Value::as_str)
        .and_then(|m| m.get(..4))
        .and_then(|y| y.parse::<i64>().ok())
        .map_or(Value::Null, Value::Int)
}
