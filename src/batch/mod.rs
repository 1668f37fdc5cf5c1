//! Typed tabular batches passed between pipeline stages.
//!
//! A [`Batch`] is an ordered set of column names plus row-major values. Stages
//! never mutate their input in place; each returns a fresh batch so a failed
//! stage leaves nothing half-transformed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Timestamp(DateTime<Utc>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The warehouse column type this value carries, if any.
    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(ColumnType::Bool),
            Value::Int(_) => Some(ColumnType::Int64),
            Value::Float(_) => Some(ColumnType::Float64),
            Value::Str(_) => Some(ColumnType::String),
            Value::Timestamp(_) => Some(ColumnType::Timestamp),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view of the value; integers widen to f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Float(f) => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }
}

/// Warehouse column types supported by the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Bool,
    Int64,
    Float64,
    String,
    Timestamp,
}

impl ColumnType {
    /// Standard SQL type name used in DDL and query parameters.
    pub fn sql_name(&self) -> &'static str {
        match self {
            ColumnType::Bool => "BOOL",
            ColumnType::Int64 => "INT64",
            ColumnType::Float64 => "FLOAT64",
            ColumnType::String => "STRING",
            ColumnType::Timestamp => "TIMESTAMP",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sql_name())
    }
}

/// Ordered columns plus row-major values.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Batch {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Batch {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn from_rows(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        debug_assert!(rows.iter().all(|r| r.len() == columns.len()));
        Self { columns, rows }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn push_row(&mut self, row: Vec<Value>) {
        debug_assert_eq!(row.len(), self.columns.len());
        self.rows.push(row);
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// Cell lookup by row index and column name.
    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row)?.get(idx)
    }

    /// Infer a column's type from its first non-null value.
    ///
    /// An all-null (or absent) column has no inherent type; callers decide the
    /// fallback. Schema inference for table creation falls back to String.
    pub fn column_type(&self, name: &str) -> Option<ColumnType> {
        let idx = self.column_index(name)?;
        self.rows.iter().find_map(|r| r[idx].column_type())
    }

    /// Column list with inferred types, in batch order. All-null columns
    /// default to String.
    pub fn infer_schema(&self) -> Vec<(String, ColumnType)> {
        self.columns
            .iter()
            .map(|name| {
                let ty = self.column_type(name).unwrap_or(ColumnType::String);
                (name.clone(), ty)
            })
            .collect()
    }

    /// Project the batch onto the named columns, preserving their given order.
    /// Returns `None` if any column is absent.
    pub fn project(&self, names: &[String]) -> Option<Batch> {
        let indices: Vec<usize> = names
            .iter()
            .map(|n| self.column_index(n))
            .collect::<Option<_>>()?;
        let rows = self
            .rows
            .iter()
            .map(|r| indices.iter().map(|&i| r[i].clone()).collect())
            .collect();
        Some(Batch::from_rows(names.to_vec(), rows))
    }

    /// Distinct rows of the named columns where every key value is non-null.
    /// Row order follows first occurrence.
    pub fn distinct_non_null(&self, keys: &[String]) -> Option<Batch> {
        let projected = self.project(keys)?;
        let mut seen: Vec<Vec<Value>> = Vec::new();
        for row in projected.rows {
            if row.iter().any(Value::is_null) {
                continue;
            }
            if !seen.contains(&row) {
                seen.push(row);
            }
        }
        Some(Batch::from_rows(keys.to_vec(), seen))
    }
}
