//! Secret retrieval with a bounded wait.
//!
//! The orchestrator resolves the spreadsheet id from a secret path during
//! setup. The Google Secret Manager implementation talks REST and decodes the
//! base64 payload; the env-backed implementation serves local runs and tests.

use crate::error::{
    SecretError, SecretMissingSnafu, SecretPayloadSnafu, SecretStatusSnafu, SecretTimeoutSnafu,
    SecretTransportSnafu,
};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use snafu::prelude::*;
use std::time::Duration;
use tracing::debug;

/// Read-only access to versioned secrets.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch the secret's payload, waiting at most `timeout`.
    async fn access(&self, path: &str, timeout: Duration) -> Result<Vec<u8>, SecretError>;
}

#[derive(Debug, Deserialize)]
struct AccessResponse {
    payload: AccessPayload,
}

#[derive(Debug, Deserialize)]
struct AccessPayload {
    #[serde(default)]
    data: String,
}

/// Google Secret Manager REST client.
pub struct GoogleSecretManager {
    http: reqwest::Client,
    endpoint: String,
    token: String,
}

impl GoogleSecretManager {
    pub fn new(token: impl Into<String>) -> Result<Self, SecretError> {
        Self::with_endpoint("https://secretmanager.googleapis.com", token)
    }

    pub fn with_endpoint(
        endpoint: impl Into<String>,
        token: impl Into<String>,
    ) -> Result<Self, SecretError> {
        let http = reqwest::Client::builder()
            .build()
            .context(SecretTransportSnafu)?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            token: token.into(),
        })
    }

    async fn request(&self, path: &str) -> Result<Vec<u8>, SecretError> {
        let url = format!("{}/v1/{}:access", self.endpoint, path);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .context(SecretTransportSnafu)?;
        let status = response.status().as_u16();
        ensure!(status == 200, SecretStatusSnafu { status, path });
        let body: AccessResponse = response.json().await.context(SecretTransportSnafu)?;
        BASE64
            .decode(body.payload.data.as_bytes())
            .ok()
            .context(SecretPayloadSnafu {
                message: "payload is not valid base64",
            })
    }
}

#[async_trait]
impl SecretStore for GoogleSecretManager {
    async fn access(&self, path: &str, timeout: Duration) -> Result<Vec<u8>, SecretError> {
        debug!(path, "accessing secret");
        match tokio::time::timeout(timeout, self.request(path)).await {
            Ok(result) => result,
            Err(_) => SecretTimeoutSnafu { path }.fail(),
        }
    }
}

/// Secrets read from environment variables, keyed by the full path.
pub struct EnvSecretStore;

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn access(&self, path: &str, _timeout: Duration) -> Result<Vec<u8>, SecretError> {
        std::env::var(path)
            .map(String::into_bytes)
            .ok()
            .context(SecretMissingSnafu { path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn env_store_returns_payload_bytes() {
        std::env::set_var("TALLY_TEST_SECRET", "sheet-id-123");
        let value = EnvSecretStore
            .access("TALLY_TEST_SECRET", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(value, b"sheet-id-123");
    }

    #[tokio::test]
    async fn env_store_reports_missing_secret() {
        std::env::remove_var("TALLY_TEST_SECRET_MISSING");
        let err = EnvSecretStore
            .access("TALLY_TEST_SECRET_MISSING", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SecretError::SecretMissing { .. }));
    }
}
