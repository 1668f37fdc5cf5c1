//! Error types for tally using snafu.
//!
//! Each subsystem gets its own error enum; `RunError` aggregates them at the
//! orchestrator boundary. Extraction errors carry a retryable/fatal
//! classification that drives the orchestrator's bounded retry loop.

use snafu::prelude::*;

/// Classification of a failure for retry purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient condition; a later attempt may succeed.
    Retryable,
    /// Retrying cannot help; abort immediately.
    Fatal,
}

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file {path}"))]
    ReadFile {
        source: std::io::Error,
        path: String,
    },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML configuration"))]
    YamlParse { source: serde_yaml::Error },

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed: {message}"))]
    EnvInterpolation { message: String },

    /// A required identity field is empty.
    #[snafu(display("Identity field '{field}' cannot be empty"))]
    EmptyIdentity { field: &'static str },

    /// Allocation month does not match YYYY-MM.
    #[snafu(display("Invalid allocation month '{month}', expected YYYY-MM"))]
    InvalidMonth { month: String },

    /// Retry attempts must be at least 1.
    #[snafu(display("retry.attempts must be at least 1"))]
    ZeroAttempts,

    /// The warehouse client needs a service account key file.
    #[snafu(display("load.service_account_key is required"))]
    MissingServiceAccountKey,
}

// ============ Extraction Errors ============

/// Errors that can occur while fetching records from the spreadsheet source.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ExtractError {
    /// The named worksheet does not exist in the spreadsheet.
    #[snafu(display("Worksheet '{worksheet}' not found in spreadsheet"))]
    WorksheetNotFound { worksheet: String },

    /// Credentials were rejected; re-authentication is required.
    #[snafu(display("Authorization failed with status {status}; credentials expired or revoked"))]
    AuthExpired { status: u16 },

    /// Transport-level failure (timeout, connect, protocol).
    #[snafu(display("Sheets API request failed"))]
    SheetTransport { source: reqwest::Error },

    /// The API answered with an unexpected HTTP status.
    #[snafu(display("Sheets API returned status {status}"))]
    SheetStatus { status: u16 },

    /// The response body could not be decoded into records.
    #[snafu(display("Failed to decode worksheet response: {message}"))]
    SheetDecode { message: String },
}

impl ExtractError {
    /// Classify this failure for the orchestrator's retry loop.
    ///
    /// Request timeouts, connection failures and 408/429/5xx gateway statuses
    /// are worth retrying; auth failures and missing resources are not.
    pub fn class(&self) -> ErrorClass {
        match self {
            ExtractError::WorksheetNotFound { .. }
            | ExtractError::AuthExpired { .. }
            | ExtractError::SheetDecode { .. } => ErrorClass::Fatal,
            ExtractError::SheetTransport { source } => {
                if source.is_timeout() || source.is_connect() {
                    ErrorClass::Retryable
                } else {
                    ErrorClass::Fatal
                }
            }
            ExtractError::SheetStatus { status } => match status {
                408 | 429 | 500 | 502 | 503 | 504 => ErrorClass::Retryable,
                _ => ErrorClass::Fatal,
            },
        }
    }
}

// ============ Transform Errors ============

/// Errors that can occur during enrichment.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransformError {
    /// Required input columns are absent from the batch.
    #[snafu(display("Missing required columns: {}", columns.join(", ")))]
    MissingColumns { columns: Vec<String> },
}

// ============ Warehouse Errors ============

/// Errors that can occur during warehouse table operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum WarehouseError {
    /// Table path is not a fully qualified project.dataset.table triple.
    #[snafu(display("Invalid table target '{target}', expected project.dataset.table"))]
    InvalidTarget { target: String },

    /// Identifier failed allow-list validation before SQL interpolation.
    #[snafu(display("Invalid identifier '{identifier}'"))]
    InvalidIdentifier { identifier: String },

    /// Upsert mode requires at least one deduplication key.
    #[snafu(display("Upsert into {target} requires deduplication keys"))]
    MissingKeys { target: String },

    /// Declared keys are not present in the batch.
    #[snafu(display("Key column(s) absent from batch: {}", columns.join(", ")))]
    KeyColumnsAbsent { columns: Vec<String> },

    /// A key column's value type does not match the target table's column type.
    #[snafu(display("Key type mismatch on '{column}': batch has {actual}, table has {expected}"))]
    KeyTypeMismatch {
        column: String,
        expected: String,
        actual: String,
    },

    /// The table does not exist.
    #[snafu(display("Table {target} does not exist"))]
    TableMissing { target: String },

    /// BigQuery API call failed.
    #[snafu(display("BigQuery operation failed"))]
    Service {
        source: gcp_bigquery_client::error::BQError,
    },

    /// Streaming insert reported per-row failures.
    #[snafu(display("Insert into {target} rejected {count} row(s)"))]
    RowsRejected { target: String, count: usize },

    /// The staging table could not be dropped after a successful delete.
    #[snafu(display("Failed to drop staging table {staging}: {message}"))]
    StagingCleanup { staging: String, message: String },

    /// Backend-specific failure without a richer classification.
    #[snafu(display("Warehouse backend error: {message}"))]
    Backend { message: String },
}

// ============ Materialization Errors ============

/// Errors that can occur when invoking the external build tool.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MaterializeError {
    /// The build tool could not be spawned.
    #[snafu(display("Failed to spawn build tool '{tool}'"))]
    Spawn {
        source: std::io::Error,
        tool: String,
    },

    /// The build tool exited non-zero.
    #[snafu(display("Build failed with exit status {status}"))]
    BuildFailed { status: i32 },
}

// ============ Secret Errors ============

/// Errors that can occur during secret retrieval.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SecretError {
    /// Retrieval exceeded the bounded wait.
    #[snafu(display("Timed out accessing secret {path}"))]
    SecretTimeout { path: String },

    /// Transport-level failure talking to the secret store.
    #[snafu(display("Secret store request failed"))]
    SecretTransport { source: reqwest::Error },

    /// The secret store answered with an unexpected HTTP status.
    #[snafu(display("Secret store returned status {status} for {path}"))]
    SecretStatus { status: u16, path: String },

    /// The secret payload could not be decoded.
    #[snafu(display("Failed to decode secret payload: {message}"))]
    SecretPayload { message: String },

    /// The environment variable backing the secret is not set.
    #[snafu(display("Secret '{path}' is not set in the environment"))]
    SecretMissing { path: String },
}

// ============ Run Error (top-level) ============

/// Top-level run errors that aggregate all subsystem error types.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RunError {
    /// Configuration error.
    #[snafu(display("Configuration error"))]
    Config { source: ConfigError },

    /// Extraction failed with a non-retryable condition.
    #[snafu(display("Extraction failed with a non-retryable error"))]
    Extract { source: ExtractError },

    /// Extraction kept failing after the bounded retries were spent.
    #[snafu(display("Extraction failed after {attempts} attempt(s)"))]
    AttemptsExhausted { attempts: u32, source: ExtractError },

    /// Transform error.
    #[snafu(display("Transform error"))]
    Transform { source: TransformError },

    /// Warehouse error.
    #[snafu(display("Warehouse error"))]
    Warehouse { source: WarehouseError },

    /// Materialization error.
    #[snafu(display("Materialization error"))]
    Materialize { source: MaterializeError },

    /// Secret retrieval error.
    #[snafu(display("Secret retrieval error"))]
    Secret { source: SecretError },
}

impl RunError {
    /// True when the run failed because bounded extraction retries were spent.
    pub fn is_attempts_exhausted(&self) -> bool {
        matches!(self, RunError::AttemptsExhausted { .. })
    }

    /// True for any warehouse-side failure.
    pub fn is_warehouse(&self) -> bool {
        matches!(self, RunError::Warehouse { .. })
    }
}
