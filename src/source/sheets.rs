//! Google Sheets REST source.
//!
//! Reads a worksheet through the `values` endpoint and converts it into a
//! typed batch: the first row becomes normalized column names, blank cells
//! become nulls.

use crate::batch::{Batch, Value};
use crate::error::{ExtractError, SheetTransportSnafu};
use crate::source::{normalize_header, Extraction, RecordSource};
use async_trait::async_trait;
use serde::Deserialize;
use snafu::prelude::*;
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
}

/// Spreadsheet source backed by the Sheets REST API.
pub struct GoogleSheetsSource {
    http: reqwest::Client,
    endpoint: String,
    token: String,
}

impl GoogleSheetsSource {
    pub fn new(
        endpoint: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ExtractError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context(SheetTransportSnafu)?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            token: token.into(),
        })
    }
}

#[async_trait]
impl RecordSource for GoogleSheetsSource {
    async fn fetch(
        &self,
        spreadsheet_id: &str,
        worksheet: &str,
    ) -> Result<Extraction, ExtractError> {
        let started = Instant::now();
        let url = format!(
            "{}/v4/spreadsheets/{}/values/{}?majorDimension=ROWS",
            self.endpoint, spreadsheet_id, worksheet
        );
        debug!(worksheet, "fetching worksheet");

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .context(SheetTransportSnafu)?;

        let status = response.status().as_u16();
        if status != 200 {
            let message = response
                .json::<ApiError>()
                .await
                .map(|e| e.error.message)
                .unwrap_or_default();
            return Err(status_error(status, &message, worksheet));
        }

        let range: ValueRange = response.json().await.context(SheetTransportSnafu)?;
        let batch = batch_from_values(range.values);
        let elapsed = started.elapsed();
        info!(
            worksheet,
            rows = batch.row_count(),
            elapsed_ms = elapsed.as_millis() as u64,
            "worksheet fetched"
        );
        Ok(Extraction { batch, elapsed })
    }
}

/// Map a non-200 response to its extraction error.
///
/// The API reports a missing worksheet as a 400 "Unable to parse range"
/// rather than a 404, so both shapes map to `WorksheetNotFound`.
fn status_error(status: u16, message: &str, worksheet: &str) -> ExtractError {
    match status {
        404 => ExtractError::WorksheetNotFound {
            worksheet: worksheet.to_string(),
        },
        400 if message.contains("Unable to parse range") => ExtractError::WorksheetNotFound {
            worksheet: worksheet.to_string(),
        },
        401 | 403 => ExtractError::AuthExpired { status },
        _ => ExtractError::SheetStatus { status },
    }
}

/// First row becomes normalized headers; remaining rows are padded with nulls
/// to the header width and truncated past it.
fn batch_from_values(values: Vec<Vec<serde_json::Value>>) -> Batch {
    let mut rows = values.into_iter();
    let Some(header_row) = rows.next() else {
        return Batch::default();
    };
    let headers: Vec<String> = header_row
        .iter()
        .map(|cell| normalize_header(cell.as_str().unwrap_or_default()))
        .collect();
    let width = headers.len();

    let mut batch = Batch::new(headers);
    for raw in rows {
        let mut row: Vec<Value> = raw.iter().take(width).map(convert_cell).collect();
        row.resize(width, Value::Null);
        batch.push_row(row);
    }
    batch
}

fn convert_cell(cell: &serde_json::Value) -> Value {
    match cell {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                Value::Null
            } else {
                Value::Str(trimmed.to_string())
            }
        }
        other => Value::Str(other.to_string()),
    }
}
