//! Declared schemas and total coercion.
//!
//! `enforce` never fails: missing declared columns are filled in, extra
//! columns are dropped, and every value is coerced to its declared type with
//! deterministic fallbacks (zero for unparseable numbers, empty string for
//! strings, null for timestamps). Unparseable numerics are logged once per
//! column as a soft warning.

use crate::batch::{Batch, ColumnType, Value};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use tracing::warn;

/// One declared column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub ty: ColumnType,
}

/// Ordered declared schema for one pipeline stage.
#[derive(Debug, Clone)]
pub struct DeclaredSchema {
    columns: Vec<ColumnSpec>,
}

const fn col(name: &'static str, ty: ColumnType) -> ColumnSpec {
    ColumnSpec { name, ty }
}

impl DeclaredSchema {
    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    /// Raw worksheet shape: descriptive strings plus integer budget amounts.
    /// Dates stay as strings here; the enrichment stage parses them.
    pub fn fetch_budget_allocation() -> Self {
        Self {
            columns: vec![
                col("month", ColumnType::String),
                col("region", ColumnType::String),
                col("budget_group_1", ColumnType::String),
                col("budget_group_2", ColumnType::String),
                col("category_level_1", ColumnType::String),
                col("track_group", ColumnType::String),
                col("pillar_group", ColumnType::String),
                col("content_group", ColumnType::String),
                col("platform", ColumnType::String),
                col("objective", ColumnType::String),
                col("start_date", ColumnType::String),
                col("end_date", ColumnType::String),
                col("initial_budget", ColumnType::Int64),
                col("adjusted_budget", ColumnType::Int64),
                col("additional_budget", ColumnType::Int64),
            ],
        }
    }

    /// Warehouse-ready shape after enrichment: typed dates plus the derived
    /// budget metrics. Column order here is the table's column order.
    pub fn staging_budget_allocation() -> Self {
        Self {
            columns: vec![
                col("month", ColumnType::String),
                col("year", ColumnType::Int64),
                col("region", ColumnType::String),
                col("budget_group_1", ColumnType::String),
                col("budget_group_2", ColumnType::String),
                col("category_level_1", ColumnType::String),
                col("track_group", ColumnType::String),
                col("pillar_group", ColumnType::String),
                col("content_group", ColumnType::String),
                col("platform", ColumnType::String),
                col("objective", ColumnType::String),
                col("start_date", ColumnType::Timestamp),
                col("end_date", ColumnType::Timestamp),
                col("initial_budget", ColumnType::Int64),
                col("adjusted_budget", ColumnType::Int64),
                col("additional_budget", ColumnType::Int64),
                col("actual_budget", ColumnType::Int64),
                col("grouped_marketing_budget", ColumnType::Int64),
                col("grouped_supplier_budget", ColumnType::Int64),
                col("grouped_retail_budget", ColumnType::Int64),
                col("grouped_customer_budget", ColumnType::Int64),
                col("grouped_recruitment_budget", ColumnType::Int64),
                col("total_effective_days", ColumnType::Int64),
                col("total_elapsed_days", ColumnType::Int64),
                col("last_updated_at", ColumnType::Timestamp),
            ],
        }
    }
}

/// Coerce `batch` into the declared shape. Total and idempotent.
pub fn enforce(batch: &Batch, schema: &DeclaredSchema) -> Batch {
    let mut out = Batch::new(
        schema
            .columns
            .iter()
            .map(|c| c.name.to_string())
            .collect(),
    );

    // Column-major pass so unparseable values warn once per column.
    let mut coerced: Vec<Vec<Value>> = Vec::with_capacity(schema.columns.len());
    for spec in &schema.columns {
        let mut lossy = 0usize;
        let column: Vec<Value> = match batch.column_index(spec.name) {
            Some(idx) => batch
                .rows()
                .iter()
                .map(|row| coerce(&row[idx], spec.ty, &mut lossy))
                .collect(),
            None => (0..batch.row_count())
                .map(|_| coerce(&Value::Null, spec.ty, &mut lossy))
                .collect(),
        };
        if lossy > 0 {
            warn!(column = spec.name, count = lossy, "substituted 0 for unparseable numeric values");
        }
        coerced.push(column);
    }

    for row_idx in 0..batch.row_count() {
        out.push_row(coerced.iter().map(|c| c[row_idx].clone()).collect());
    }
    out
}

fn coerce(value: &Value, ty: ColumnType, lossy: &mut usize) -> Value {
    match ty {
        ColumnType::String => coerce_string(value),
        ColumnType::Int64 => coerce_int(value, lossy),
        ColumnType::Float64 => coerce_float(value, lossy),
        ColumnType::Bool => coerce_bool(value),
        ColumnType::Timestamp => coerce_timestamp(value),
    }
}

fn coerce_string(value: &Value) -> Value {
    let s = match value {
        Value::Str(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Int(n) => n.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Timestamp(ts) => ts.to_rfc3339(),
    };
    Value::Str(s)
}

fn coerce_int(value: &Value, lossy: &mut usize) -> Value {
    match value {
        Value::Int(n) => Value::Int(*n),
        Value::Float(f) => Value::Int(*f as i64),
        Value::Bool(b) => Value::Int(i64::from(*b)),
        Value::Null => Value::Int(0),
        Value::Str(s) => match parse_number(s) {
            Some(f) => Value::Int(f as i64),
            None => {
                if !s.trim().is_empty() {
                    *lossy += 1;
                }
                Value::Int(0)
            }
        },
        Value::Timestamp(_) => {
            *lossy += 1;
            Value::Int(0)
        }
    }
}

fn coerce_float(value: &Value, lossy: &mut usize) -> Value {
    match value {
        Value::Float(f) => Value::Float(*f),
        Value::Int(n) => Value::Float(*n as f64),
        Value::Bool(b) => Value::Float(f64::from(u8::from(*b))),
        Value::Null => Value::Float(0.0),
        Value::Str(s) => match parse_number(s) {
            Some(f) => Value::Float(f),
            None => {
                if !s.trim().is_empty() {
                    *lossy += 1;
                }
                Value::Float(0.0)
            }
        },
        Value::Timestamp(_) => {
            *lossy += 1;
            Value::Float(0.0)
        }
    }
}

fn coerce_bool(value: &Value) -> Value {
    match value {
        Value::Bool(b) => Value::Bool(*b),
        Value::Int(n) => Value::Bool(*n != 0),
        Value::Str(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Value::Bool(true),
            "false" | "0" | "no" => Value::Bool(false),
            _ => Value::Null,
        },
        _ => Value::Null,
    }
}

fn coerce_timestamp(value: &Value) -> Value {
    match value {
        Value::Timestamp(ts) => Value::Timestamp(*ts),
        Value::Str(s) => parse_timestamp(s).map_or(Value::Null, Value::Timestamp),
        _ => Value::Null,
    }
}

/// Parse a human-entered number, accepting decimal-comma notation.
fn parse_number(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let normalized = trimmed.replace(',', ".");
    normalized.parse::<f64>().ok().filter(|f| f.is_finite())
}

/// Permissive timestamp parsing: RFC 3339, then the date formats spreadsheet
/// cells commonly carry. Naive inputs are read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    for format in ["%Y-%m-%d", "%d/%m/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return Some(date.and_hms_opt(0, 0, 0)?.and_utc());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tiny_schema() -> DeclaredSchema {
        DeclaredSchema {
            columns: vec![
                col("name", ColumnType::String),
                col("amount", ColumnType::Int64),
                col("when", ColumnType::Timestamp),
            ],
        }
    }

    #[test]
    fn fills_missing_columns_and_drops_extras() {
        let batch = Batch::from_rows(
            vec!["name".into(), "extra".into()],
            vec![vec![Value::Str("a".into()), Value::Str("x".into())]],
        );
        let out = enforce(&batch, &tiny_schema());
        assert_eq!(out.columns(), ["name", "amount", "when"]);
        assert_eq!(out.value(0, "amount"), Some(&Value::Int(0)));
        assert_eq!(out.value(0, "when"), Some(&Value::Null));
        assert!(!out.has_column("extra"));
    }

    #[test]
    fn output_order_is_declared_order() {
        let batch = Batch::from_rows(
            vec!["when".into(), "amount".into(), "name".into()],
            vec![vec![Value::Null, Value::Int(5), Value::Str("a".into())]],
        );
        let out = enforce(&batch, &tiny_schema());
        assert_eq!(out.columns(), ["name", "amount", "when"]);
        assert_eq!(out.rows()[0][1], Value::Int(5));
    }

    #[test]
    fn decimal_comma_parses() {
        let batch = Batch::from_rows(
            vec!["amount".into()],
            vec![vec![Value::Str("1234,56".into())]],
        );
        let out = enforce(&batch, &tiny_schema());
        assert_eq!(out.value(0, "amount"), Some(&Value::Int(1234)));
    }

    #[test]
    fn unparseable_numeric_becomes_zero() {
        let batch = Batch::from_rows(
            vec!["amount".into()],
            vec![vec![Value::Str("n/a".into())], vec![Value::Str("".into())]],
        );
        let out = enforce(&batch, &tiny_schema());
        assert_eq!(out.value(0, "amount"), Some(&Value::Int(0)));
        assert_eq!(out.value(1, "amount"), Some(&Value::Int(0)));
    }

    #[test]
    fn permissive_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap();
        for raw in ["2025-01-15", "15/01/2025", "2025-01-15 00:00:00", "2025-01-15T00:00:00Z"] {
            assert_eq!(parse_timestamp(raw), Some(expected), "input {raw:?}");
        }
        assert_eq!(parse_timestamp("not a date"), None);
        assert_eq!(parse_timestamp(""), None);
    }

    #[test]
    fn enforce_is_idempotent() {
        let batch = Batch::from_rows(
            vec!["name".into(), "amount".into(), "when".into()],
            vec![
                vec![
                    Value::Null,
                    Value::Str("12,5".into()),
                    Value::Str("2025-01-15".into()),
                ],
                vec![Value::Int(7), Value::Str("bad".into()), Value::Str("nope".into())],
            ],
        );
        let once = enforce(&batch, &tiny_schema());
        let twice = enforce(&once, &tiny_schema());
        assert_eq!(once, twice);
    }

    #[test]
    fn staging_schema_types_dates_and_metrics() {
        let schema = DeclaredSchema::staging_budget_allocation();
        let ty = |name: &str| {
            schema
                .columns()
                .iter()
                .find(|c| c.name == name)
                .map(|c| c.ty)
        };
        assert_eq!(ty("start_date"), Some(ColumnType::Timestamp));
        assert_eq!(ty("actual_budget"), Some(ColumnType::Int64));
        assert_eq!(ty("total_elapsed_days"), Some(ColumnType::Int64));
        assert_eq!(ty("last_updated_at"), Some(ColumnType::Timestamp));
    }
}
