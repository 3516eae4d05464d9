//! HTTP client for the HIS directory endpoints

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Per-request timeout mandated by the backend contract
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum HisError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Backend rejected request (status {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Backend reported failure: {0}")]
    Failure(String),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterPortRequest<'a> {
    tenant_id: &'a str,
    port: u16,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HeartbeatRequest<'a> {
    tenant_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct BackendResponse {
    success: bool,
    #[serde(default)]
    message: String,
}

/// Client for the HIS backend directory
pub struct HisClient {
    base_url: String,
    relay_secret: String,
    http: reqwest::Client,
}

impl HisClient {
    pub fn new(base_url: String, relay_secret: String) -> Result<Self, HisError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            relay_secret,
            http,
        })
    }

    /// Report a freshly-assigned public port for a tenant
    pub async fn register_port(&self, tenant_id: &str, port: u16) -> Result<(), HisError> {
        let url = format!("{}/api/v2/tatbeeb-link/register-port", self.base_url);
        self.post(&url, &RegisterPortRequest { tenant_id, port })
            .await
    }

    /// Report that a tenant is still attached
    pub async fn heartbeat(&self, tenant_id: &str) -> Result<(), HisError> {
        let url = format!("{}/api/v2/tatbeeb-link/heartbeat", self.base_url);
        self.post(&url, &HeartbeatRequest { tenant_id }).await
    }

    async fn post<B: Serialize>(&self, url: &str, body: &B) -> Result<(), HisError> {
        let response = self
            .http
            .post(url)
            .header("X-Relay-Secret", &self.relay_secret)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() != 200 {
            let body = response.text().await.unwrap_or_default();
            return Err(HisError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: BackendResponse = response.json().await?;
        if !parsed.success {
            return Err(HisError::Failure(parsed.message));
        }

        Ok(())
    }
}
