//! YAML configuration for a tally run.
//!
//! The config file is environment-interpolated before parsing, then validated.
//! Identity fields are opaque strings threaded into derived dataset, table and
//! secret names.

pub mod vars;

use crate::error::{ConfigError, EmptyIdentitySnafu, InvalidMonthSnafu, ReadFileSnafu, YamlParseSnafu, ZeroAttemptsSnafu};
use crate::warehouse::{LoadMode, LoadSpec, PartitionSpec, TableTarget, WarehouseError};
use chrono::NaiveDate;
use serde::Deserialize;
use snafu::prelude::*;
use std::path::Path;
use std::time::Duration;

/// Top-level run configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub identity: IdentityConfig,
    pub source: SourceConfig,
    #[serde(default)]
    pub load: LoadConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub materialize: MaterializeConfig,
}

/// Business identifiers woven into derived resource names.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentityConfig {
    pub company: String,
    pub project: String,
    pub department: String,
    pub account: String,
    #[serde(default = "default_mode")]
    pub mode: String,
}

/// Spreadsheet source settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    /// Allocation month, `YYYY-MM`.
    pub month: String,
    /// Literal spreadsheet id. When absent the id is resolved from the secret
    /// store using the derived secret path.
    #[serde(default)]
    pub spreadsheet_id: Option<String>,
    /// OAuth bearer token for the Sheets and Secret Manager APIs.
    pub token: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_secret_timeout_secs")]
    pub secret_timeout_secs: u64,
}

/// Warehouse load settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoadConfig {
    #[serde(default = "default_load_mode")]
    pub mode: LoadMode,
    #[serde(default = "default_keys")]
    pub keys: Vec<String>,
    #[serde(default = "default_partition_field")]
    pub partition_field: Option<String>,
    #[serde(default = "default_cluster")]
    pub cluster: Vec<String>,
    #[serde(default = "default_location")]
    pub location: String,
    /// Path to a service account key file for the warehouse client.
    #[serde(default)]
    pub service_account_key: Option<String>,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            mode: default_load_mode(),
            keys: default_keys(),
            partition_field: default_partition_field(),
            cluster: default_cluster(),
            location: default_location(),
            service_account_key: None,
        }
    }
}

impl LoadConfig {
    pub fn to_spec(&self) -> LoadSpec {
        LoadSpec {
            mode: self.mode,
            keys: self.keys.clone(),
            partition: self
                .partition_field
                .as_ref()
                .map(|field| PartitionSpec { field: field.clone() }),
            cluster: self.cluster.clone(),
        }
    }
}

/// Bounded retry settings for extraction.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
    #[serde(default = "default_backoff_step_secs")]
    pub backoff_step_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            backoff_secs: default_backoff_secs(),
            backoff_step_secs: default_backoff_step_secs(),
        }
    }
}

impl RetryConfig {
    /// Linear backoff before the next attempt: `base + (attempt - 1) * step`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let secs = self.backoff_secs + u64::from(attempt.saturating_sub(1)) * self.backoff_step_secs;
        Duration::from_secs(secs)
    }
}

/// Materialization build trigger settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MaterializeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_tool")]
    pub tool: String,
    #[serde(default = "default_selector")]
    pub selector: String,
    #[serde(default = "default_working_dir")]
    pub working_dir: String,
}

impl Default for MaterializeConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            tool: default_tool(),
            selector: default_selector(),
            working_dir: default_working_dir(),
        }
    }
}

fn default_mode() -> String {
    "all".to_string()
}

fn default_endpoint() -> String {
    "https://sheets.googleapis.com".to_string()
}

fn default_http_timeout_secs() -> u64 {
    30
}

fn default_secret_timeout_secs() -> u64 {
    10
}

fn default_load_mode() -> LoadMode {
    LoadMode::Upsert
}

fn default_keys() -> Vec<String> {
    vec!["month".to_string()]
}

fn default_partition_field() -> Option<String> {
    Some("last_updated_at".to_string())
}

fn default_cluster() -> Vec<String> {
    vec!["month".to_string()]
}

fn default_location() -> String {
    "asia-southeast1".to_string()
}

fn default_attempts() -> u32 {
    3
}

fn default_backoff_secs() -> u64 {
    60
}

fn default_backoff_step_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_tool() -> String {
    "dbt".to_string()
}

fn default_selector() -> String {
    "tag:budget_allocation".to_string()
}

fn default_working_dir() -> String {
    "dbt".to_string()
}

impl Config {
    /// Load, interpolate, parse and validate a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).context(ReadFileSnafu {
            path: path.display().to_string(),
        })?;
        Self::parse(&raw)
    }

    /// Parse configuration from raw YAML text.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let interpolated = vars::interpolate(raw)?;
        let config: Config = serde_yaml::from_str(&interpolated).context(YamlParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let identity = &self.identity;
        for (field, value) in [
            ("company", &identity.company),
            ("project", &identity.project),
            ("department", &identity.department),
            ("account", &identity.account),
            ("mode", &identity.mode),
        ] {
            ensure!(!value.trim().is_empty(), EmptyIdentitySnafu { field });
        }
        validate_month(&self.source.month)?;
        ensure!(self.retry.attempts >= 1, ZeroAttemptsSnafu);
        Ok(())
    }

    /// Dataset holding all raw reconciliation tables for this company.
    pub fn dataset_name(&self) -> String {
        format!("{}_dataset_recon_api_raw", self.identity.company)
    }

    /// Fully qualified target for the given worksheet's allocation table.
    pub fn table_target(&self, worksheet: &str) -> Result<TableTarget, WarehouseError> {
        let table = format!(
            "{}_table_budget_{}_{}_allocation_{}",
            self.identity.company, self.identity.department, self.identity.account, worksheet
        );
        TableTarget::new(&self.identity.project, &self.dataset_name(), &table)
    }

    /// Secret Manager resource path for the spreadsheet id.
    pub fn secret_path(&self) -> String {
        format!(
            "projects/{}/secrets/{}_secret_{}_recon_sheet_id_{}/versions/latest",
            self.identity.project,
            self.identity.company,
            self.identity.department,
            self.identity.account
        )
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.source.http_timeout_secs)
    }

    pub fn secret_timeout(&self) -> Duration {
        Duration::from_secs(self.source.secret_timeout_secs)
    }
}

/// Check that `month` is a real `YYYY-MM` month.
pub fn validate_month(month: &str) -> Result<(), ConfigError> {
    let ok = month.len() == 7
        && NaiveDate::parse_from_str(&format!("{month}-01"), "%Y-%m-%d").is_ok();
    ensure!(ok, InvalidMonthSnafu { month });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
identity:
  company: acme
  project: acme-analytics
  department: growth
  account: paid_media
source:
  month: "2025-01"
  token: test-token
"#;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config = Config::parse(MINIMAL).unwrap();
        assert_eq!(config.identity.mode, "all");
        assert_eq!(config.load.mode, LoadMode::Upsert);
        assert_eq!(config.load.keys, ["month"]);
        assert_eq!(config.load.location, "asia-southeast1");
        assert_eq!(config.retry.attempts, 3);
        assert!(config.materialize.enabled);
        assert_eq!(config.materialize.tool, "dbt");
    }

    #[test]
    fn derives_resource_names() {
        let config = Config::parse(MINIMAL).unwrap();
        assert_eq!(config.dataset_name(), "acme_dataset_recon_api_raw");
        let target = config.table_target("m012025").unwrap();
        assert_eq!(
            target.path(),
            "acme-analytics.acme_dataset_recon_api_raw.acme_table_budget_growth_paid_media_allocation_m012025"
        );
        assert_eq!(
            config.secret_path(),
            "projects/acme-analytics/secrets/acme_secret_growth_recon_sheet_id_paid_media/versions/latest"
        );
    }

    #[test]
    fn rejects_malformed_month() {
        let raw = MINIMAL.replace("\"2025-01\"", "\"2025-13\"");
        let err = Config::parse(&raw).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidMonth { .. }));
    }

    #[test]
    fn rejects_month_without_zero_padding() {
        assert!(validate_month("2025-1").is_err());
        assert!(validate_month("202501").is_err());
        assert!(validate_month("2025-01").is_ok());
    }

    #[test]
    fn rejects_empty_identity_field() {
        let raw = MINIMAL.replace("company: acme", "company: \"\"");
        let err = Config::parse(&raw).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyIdentity { field: "company" }));
    }

    #[test]
    fn rejects_zero_attempts() {
        let raw = format!("{MINIMAL}retry:\n  attempts: 0\n");
        let err = Config::parse(&raw).unwrap_err();
        assert!(matches!(err, ConfigError::ZeroAttempts));
    }

    #[test]
    fn backoff_is_linear() {
        let retry = RetryConfig {
            attempts: 3,
            backoff_secs: 60,
            backoff_step_secs: 30,
        };
        assert_eq!(retry.backoff(1), Duration::from_secs(60));
        assert_eq!(retry.backoff(2), Duration::from_secs(90));
        assert_eq!(retry.backoff(3), Duration::from_secs(120));
    }
}
