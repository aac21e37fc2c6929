// sync/transport.rs - Wire protocol and HTTP transport to the sync service

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Map;

use super::queue::QueueOperation;
use super::retry::RetryPolicy;
use crate::{Error, Result};

/// One queued mutation on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushChange {
    pub table_name: String,
    pub operation: QueueOperation,
    pub record_id: String,
    pub data: Map<String, serde_json::Value>,
}

/// Batch of mutations sent to the server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub changes: Vec<PushChange>,
}

/// Per-item acknowledgement, matched positionally with the request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_updated_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    pub success: bool,
    #[serde(default)]
    pub results: Vec<PushResult>,
}

/// Incremental fetch request; `last_sync_at` is the pull watermark
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    pub last_sync_at: Option<i64>,
    pub tables: Vec<String>,
}

/// Change stanzas for one table
///
/// `created` / `updated` entries are raw server records (camelCase
/// fields, at least `id` and `updated_at`); `deleted` lists server ids.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableChanges {
    #[serde(default)]
    pub created: Vec<Map<String, serde_json::Value>>,
    #[serde(default)]
    pub updated: Vec<Map<String, serde_json::Value>>,
    #[serde(default)]
    pub deleted: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    pub timestamp: i64,
    #[serde(default)]
    pub changes: HashMap<String, TableChanges>,
}

/// Request/response channel to the sync service
///
/// Push is at-least-once: a crash between a successful `push` and the
/// local ack re-sends the same items, so the server must be idempotent
/// on `(record_id, operation)`.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn push(&self, request: &PushRequest) -> Result<PushResponse>;
    async fn pull(&self, request: &PullRequest) -> Result<PullResponse>;
}

/// HTTP implementation of [`SyncTransport`]
///
/// Transient connection failures are retried with capped exponential
/// backoff before the error surfaces to the pipelines.
#[derive(Clone)]
pub struct HttpTransport {
    base_url: String,
    bearer_token: Option<String>,
    http_client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpTransport {
    /// Create a new transport against the given service root
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_retry(base_url, RetryPolicy::default())
    }

    pub fn with_retry(base_url: &str, retry: RetryPolicy) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            bearer_token: None,
            http_client,
            retry,
        })
    }

    /// Attach a bearer token to every request
    pub fn with_token(mut self, token: &str) -> Self {
        self.bearer_token = Some(token.to_string());
        self
    }

    async fn post_json<T: Serialize, R: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &T,
    ) -> Result<R> {
        let url = format!("{}{}", self.base_url, endpoint);
        let headers = self.build_headers()?;

        let mut attempt = 0u32;
        let response = loop {
            let result = self
                .http_client
                .post(&url)
                .headers(headers.clone())
                .json(body)
                .send()
                .await;

            match result {
                Ok(response) => break response,
                Err(e) if (e.is_connect() || e.is_timeout()) && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for(attempt);
                    tracing::debug!(
                        "Transient transport failure on {} (attempt {}): {}; retrying in {:?}",
                        endpoint,
                        attempt,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(Error::Network(format!("POST {} failed: {}", endpoint, e)))
                }
            }
        };

        self.handle_response(response).await
    }

    /// Build headers for authenticated requests
    fn build_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();

        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(ref token) = self.bearer_token {
            let auth_value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| Error::Config(format!("Invalid bearer token: {}", e)))?;
            headers.insert(AUTHORIZATION, auth_value);
        }

        Ok(headers)
    }

    /// Handle HTTP response and extract JSON body
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());

            return Err(match status.as_u16() {
                404 => Error::NotFound(error_text),
                _ => Error::Network(format!(
                    "Request failed with status {}: {}",
                    status, error_text
                )),
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| Error::Network(format!("Failed to parse response: {}", e)))
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn push(&self, request: &PushRequest) -> Result<PushResponse> {
        self.post_json("/sync/push", request).await
    }

    async fn pull(&self, request: &PullRequest) -> Result<PullResponse> {
        self.post_json("/sync/pull", request).await
    }
}
