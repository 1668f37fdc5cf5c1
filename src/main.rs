//! CLI entry point for tally.

use clap::Parser;
use std::process::ExitCode;
use tally::secrets::{GoogleSecretManager, SecretStore};
use tally::{
    BigQueryWarehouse, Config, GoogleSheetsSource, Pipeline, RunError, RunOutcome,
};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "tally", about = "Budget allocation loader", version)]
struct CliArgs {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "tally.yaml")]
    config: String,

    /// Override the configured allocation month (YYYY-MM).
    #[arg(long)]
    month: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tally::init_tracing();
    let args = CliArgs::parse();

    let mut config = match Config::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %args.config, "{e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(month) = args.month {
        config.source.month = month;
    }

    match run(&config).await {
        Ok(RunOutcome::Loaded(result)) => {
            info!(
                target = %result.target,
                deleted = result.deleted,
                written = result.written,
                "run complete"
            );
            ExitCode::SUCCESS
        }
        Ok(RunOutcome::SkippedEmpty) => {
            info!("run complete, worksheet was empty");
            ExitCode::SUCCESS
        }
        Err(e) => {
            report(&e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: &Config) -> Result<RunOutcome, RunError> {
    let spreadsheet_id = resolve_spreadsheet_id(config).await?;

    let source = GoogleSheetsSource::new(
        config.source.endpoint.clone(),
        config.source.token.clone(),
        config.http_timeout(),
    )
    .map_err(|source| RunError::Extract { source })?;

    let warehouse = match &config.load.service_account_key {
        Some(path) => BigQueryWarehouse::from_service_account_key_file(path)
            .await
            .map_err(|source| RunError::Warehouse { source })?,
        None => {
            return Err(RunError::Config {
                source: tally::error::ConfigError::MissingServiceAccountKey,
            })
        }
    };

    Pipeline::new(&source, &warehouse, config)
        .run(&spreadsheet_id)
        .await
}

/// Use the configured literal id when present, otherwise resolve it from
/// Secret Manager with the derived path.
async fn resolve_spreadsheet_id(config: &Config) -> Result<String, RunError> {
    if let Some(id) = &config.source.spreadsheet_id {
        return Ok(id.clone());
    }
    let path = config.secret_path();
    info!(path, "resolving spreadsheet id from secret store");
    let store = GoogleSecretManager::new(config.source.token.clone())
        .map_err(|source| RunError::Secret { source })?;
    let payload = store
        .access(&path, config.secret_timeout())
        .await
        .map_err(|source| RunError::Secret { source })?;
    Ok(String::from_utf8_lossy(&payload).trim().to_string())
}

fn report(e: &RunError) {
    error!("{e}");
    let mut source = std::error::Error::source(e);
    while let Some(cause) = source {
        error!("  caused by: {cause}");
        source = cause.source();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        CliArgs::command().debug_assert();
    }

    #[test]
    fn month_override_applies() {
        let args = CliArgs::parse_from(["tally", "--month", "2025-02"]);
        assert_eq!(args.month.as_deref(), Some("2025-02"));
        assert_eq!(args.config, "tally.yaml");
    }
}
