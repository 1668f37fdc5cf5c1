//! Materialization trigger: run the templated model build after a load.
//!
//! The build tool runs as a child process from the configured working
//! directory with the parent's environment. tally only cares about the exit
//! status; the tool's own output goes straight to the run's stdout/stderr.

use crate::config::MaterializeConfig;
use crate::error::{BuildFailedSnafu, MaterializeError, SpawnSnafu};
use snafu::prelude::*;
use tokio::process::Command;
use tracing::info;

/// Invoke `<tool> build --profiles-dir . --select <selector>`.
pub async fn materialize(config: &MaterializeConfig) -> Result<(), MaterializeError> {
    info!(
        tool = %config.tool,
        selector = %config.selector,
        "triggering materialization build"
    );
    let status = Command::new(&config.tool)
        .arg("build")
        .args(["--profiles-dir", "."])
        .args(["--select", &config.selector])
        .current_dir(&config.working_dir)
        .status()
        .await
        .context(SpawnSnafu {
            tool: config.tool.clone(),
        })?;
    ensure!(
        status.success(),
        BuildFailedSnafu {
            status: status.code().unwrap_or(-1),
        }
    );
    info!("materialization build complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn script_config(dir: &std::path::Path, body: &str) -> MaterializeConfig {
        use std::os::unix::fs::PermissionsExt;
        let script = dir.join("fake-build");
        std::fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        MaterializeConfig {
            enabled: true,
            tool: script.display().to_string(),
            selector: "tag:budget_allocation".to_string(),
            working_dir: dir.display().to_string(),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn succeeds_on_zero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let config = script_config(dir.path(), "exit 0");
        materialize(&config).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn passes_build_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("args.txt");
        let config = script_config(dir.path(), &format!("echo \"$@\" > {}", marker.display()));
        materialize(&config).await.unwrap();
        let args = std::fs::read_to_string(marker).unwrap();
        assert_eq!(
            args.trim(),
            "build --profiles-dir . --select tag:budget_allocation"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_is_build_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config = script_config(dir.path(), "exit 3");
        let err = materialize(&config).await.unwrap_err();
        assert!(matches!(err, MaterializeError::BuildFailed { status: 3 }));
    }

    #[tokio::test]
    async fn missing_tool_is_spawn_error() {
        let config = MaterializeConfig {
            enabled: true,
            tool: "/nonexistent/build-tool".to_string(),
            selector: "tag:x".to_string(),
            working_dir: ".".to_string(),
        };
        let err = materialize(&config).await.unwrap_err();
        assert!(matches!(err, MaterializeError::Spawn { .. }));
    }
}
