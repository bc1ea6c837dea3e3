//! HTTP client for the profile worker service

use crate::executor::{CriticalCause, HealthProbe, SendExecutor, SendOutcome, SendRequest, SendResult};
use anyhow::Result;
use async_trait::async_trait;
use courier_common::config::WorkerConfig;
use courier_common::types::{Availability, ProfileId};
use hmac::{Hmac, Mac};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_HEADER: &str = "X-Courier-Signature";

/// Executor and health probe backed by the worker service
pub struct HttpWorkerClient {
    http_client: Client,
    base_url: String,
    signing_secret: Option<String>,
}

#[derive(Deserialize)]
struct HealthResponse {
    availability: Availability,
}

impl HttpWorkerClient {
    pub fn new(config: &WorkerConfig) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            signing_secret: config.signing_secret.clone(),
        })
    }

    fn sign(&self, body: &[u8]) -> Result<Option<String>> {
        let Some(secret) = &self.signing_secret else {
            return Ok(None);
        };
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| anyhow::anyhow!("Invalid HMAC key: {}", e))?;
        mac.update(body);
        Ok(Some(format!("sha256={}", hex::encode(mac.finalize().into_bytes()))))
    }

    async fn post_send(&self, request: &SendRequest) -> Result<reqwest::Response> {
        let body = serde_json::to_vec(request)?;
        let url = format!("{}/profiles/{}/send", self.base_url, request.profile_id);

        let mut http_request = self
            .http_client
            .post(url)
            .header("Content-Type", "application/json");
        if let Some(signature) = self.sign(&body)? {
            http_request = http_request.header(SIGNATURE_HEADER, signature);
        }
        Ok(http_request.body(body).send().await?)
    }
}

/// Classify a worker response status
pub fn classify_status(status: StatusCode) -> SendOutcome {
    match status {
        s if s.is_success() => SendOutcome::Sent,
        StatusCode::UNAUTHORIZED => SendOutcome::CriticalFailure(CriticalCause::LoginRequired),
        StatusCode::FORBIDDEN => SendOutcome::CriticalFailure(CriticalCause::Blocked),
        StatusCode::GONE => SendOutcome::CriticalFailure(CriticalCause::SessionLost),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => SendOutcome::TransientFailure,
        s if s.is_server_error() => SendOutcome::TransientFailure,
        _ => SendOutcome::PermanentFailure,
    }
}

#[async_trait]
impl SendExecutor for HttpWorkerClient {
    async fn send(&self, request: SendRequest) -> SendResult {
        let response = match self.post_send(&request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    profile_id = %request.profile_id,
                    message_id = %request.message_id,
                    "Worker request failed: {}",
                    e
                );
                return SendResult::failed(SendOutcome::TransientFailure, e.to_string());
            }
        };

        let status = response.status();
        let outcome = classify_status(status);
        if outcome == SendOutcome::Sent {
            return SendResult::sent();
        }

        let mut detail = response.text().await.unwrap_or_default();
        detail.truncate(500);
        debug!(
            profile_id = %request.profile_id,
            status = %status,
            outcome = outcome.label(),
            "Worker rejected send"
        );
        SendResult::failed(outcome, format!("worker returned {}: {}", status, detail))
    }
}

#[async_trait]
impl HealthProbe for HttpWorkerClient {
    async fn check_profile_health(&self, profile_id: ProfileId) -> Availability {
        let url = format!("{}/profiles/{}/health", self.base_url, profile_id);
        let response = match self.http_client.get(url).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                debug!(profile_id = %profile_id, status = %response.status(), "Health check failed");
                return Availability::Unhealthy;
            }
            Err(e) => {
                debug!(profile_id = %profile_id, "Health check failed: {}", e);
                return Availability::Unhealthy;
            }
        };
        match response.json::<HealthResponse>().await {
            Ok(health) => health.availability,
            Err(e) => {
                warn!(profile_id = %profile_id, "Malformed health response: {}", e);
                Availability::Unhealthy
            }
        }
    }
}
