//! The run orchestrator.
//!
//! Stages run strictly in order: extract (with bounded retries) → normalize →
//! enrich → normalize to the warehouse shape → load → materialize. The first
//! stage error fails the run; only extraction is ever retried.

use crate::config::Config;
use crate::error::{ErrorClass, ExtractError, RunError};
use crate::materialize::materialize;
use crate::schema::{enforce, DeclaredSchema};
use crate::source::{worksheet_for_month, Extraction, RecordSource};
use crate::transform::enrich;
use crate::warehouse::{LoadResult, TableManager, Warehouse};
use snafu::prelude::*;
use tracing::{info, warn};

/// How a successful run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Records were loaded (and the materialization build ran if enabled).
    Loaded(LoadResult),
    /// The worksheet had no records; the warehouse was not touched.
    SkippedEmpty,
}

/// One configured run wired to a source and a warehouse backend.
pub struct Pipeline<'a, S: RecordSource + ?Sized, W: Warehouse + ?Sized> {
    source: &'a S,
    warehouse: &'a W,
    config: &'a Config,
}

impl<'a, S: RecordSource + ?Sized, W: Warehouse + ?Sized> Pipeline<'a, S, W> {
    pub fn new(source: &'a S, warehouse: &'a W, config: &'a Config) -> Self {
        Self {
            source,
            warehouse,
            config,
        }
    }

    /// Execute the full run for the configured month.
    pub async fn run(&self, spreadsheet_id: &str) -> Result<RunOutcome, RunError> {
        let worksheet =
            worksheet_for_month(&self.config.source.month).context(crate::error::ConfigSnafu)?;
        info!(
            month = %self.config.source.month,
            worksheet,
            "starting budget allocation run"
        );

        let extraction = self.extract_with_retry(spreadsheet_id, &worksheet).await?;
        if extraction.is_empty() {
            info!(worksheet, "worksheet is empty, nothing to load");
            return Ok(RunOutcome::SkippedEmpty);
        }

        let normalized = enforce(&extraction.batch, &DeclaredSchema::fetch_budget_allocation());
        let enriched = enrich(&normalized).context(crate::error::TransformSnafu)?;
        let staged = enforce(&enriched, &DeclaredSchema::staging_budget_allocation());

        let target = self
            .config
            .table_target(&worksheet)
            .context(crate::error::WarehouseSnafu)?;
        let spec = self.config.load.to_spec();
        let manager = TableManager::new(self.warehouse, &self.config.load.location);
        let result = manager
            .load(&staged, &target, &spec)
            .await
            .context(crate::error::WarehouseSnafu)?;

        if self.config.materialize.enabled {
            materialize(&self.config.materialize)
                .await
                .context(crate::error::MaterializeSnafu)?;
        }

        Ok(RunOutcome::Loaded(result))
    }

    /// Bounded retry loop around extraction. Fatal failures abort on the
    /// spot; retryable ones wait out a linear backoff until the attempt
    /// budget is spent.
    async fn extract_with_retry(
        &self,
        spreadsheet_id: &str,
        worksheet: &str,
    ) -> Result<Extraction, RunError> {
        let retry = &self.config.retry;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.source.fetch(spreadsheet_id, worksheet).await {
                Ok(extraction) => {
                    info!(
                        attempt,
                        rows = extraction.row_count(),
                        "extraction succeeded"
                    );
                    return Ok(extraction);
                }
                Err(error) => {
                    if error.class() == ErrorClass::Fatal {
                        return Err(RunError::Extract { source: error });
                    }
                    if attempt >= retry.attempts {
                        return Err(RunError::AttemptsExhausted {
                            attempts: retry.attempts,
                            source: error,
                        });
                    }
                    let wait = retry.backoff(attempt);
                    warn!(
                        attempt,
                        wait_secs = wait.as_secs(),
                        error = %display_chain(&error),
                        "extraction attempt failed, will retry"
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}

fn display_chain(error: &ExtractError) -> String {
    use std::error::Error as _;
    match error.source() {
        Some(source) => format!("{error}: {source}"),
        None => error.to_string(),
    }
}
