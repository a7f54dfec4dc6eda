//! Typed client for the diagnostic core HTTP API

use explain_gateway::{ExplanationResult, RetryPolicy};
use fault_rules::FaultRecord;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
/// Explanations wait on the remote service, which may take a minute
pub const EXPLAIN_TIMEOUT: Duration = Duration::from_secs(70);

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("server answered HTTP {status}: {message}")]
    Status { status: u16, message: String },
}

/// Sensor id to reading string
pub type Readings = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectReply {
    pub status: String,
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default)]
    pub detail: Option<String>,
}

impl ConnectReply {
    pub fn is_connected(&self) -> bool {
        matches!(self.status.as_str(), "connected" | "already_connected")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReply {
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClearReply {
    pub result: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplainReply {
    pub code: String,
    pub freeze_frame: Readings,
    #[serde(flatten)]
    pub result: ExplanationResult,
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
    retry: RetryPolicy,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        Ok(Self {
            http: reqwest::Client::builder().build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout: DEFAULT_TIMEOUT,
            retry: RetryPolicy::api_client(),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn connect(&self) -> Result<ConnectReply, ClientError> {
        self.get("/connect", self.timeout).await
    }

    pub async fn disconnect(&self) -> Result<StatusReply, ClientError> {
        self.get("/disconnect", self.timeout).await
    }

    /// Detected faults as (code, description) records
    pub async fn dtc(&self) -> Result<Vec<FaultRecord>, ClientError> {
        self.get("/dtc", self.timeout).await
    }

    pub async fn freeze(&self) -> Result<Readings, ClientError> {
        self.get("/freeze", self.timeout).await
    }

    pub async fn clear(&self) -> Result<ClearReply, ClientError> {
        self.get("/clear", self.timeout).await
    }

    pub async fn start_live(&self) -> Result<StatusReply, ClientError> {
        self.get("/live/start", self.timeout).await
    }

    pub async fn stop_live(&self) -> Result<StatusReply, ClientError> {
        self.get("/live/stop", self.timeout).await
    }

    pub async fn live_data(&self) -> Result<Readings, ClientError> {
        self.get("/live/data", self.timeout).await
    }

    pub async fn explain(&self, code: &str) -> Result<ExplainReply, ClientError> {
        self.get(&format!("/dtc/explain/{}", code), EXPLAIN_TIMEOUT).await
    }

    pub async fn ping(&self) -> Result<bool, ClientError> {
        let body: Value = self.get("/ping", self.timeout).await?;
        Ok(body["ok"].as_bool().unwrap_or(false))
    }

    pub async fn health(&self) -> Result<Value, ClientError> {
        self.get("/health", self.timeout).await
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        timeout: Duration,
    ) -> Result<T, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .retry
            .run(|attempt| {
                debug!(url = %url, attempt, "GET");
                self.http.get(&url).timeout(timeout).send()
            })
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                status: status.as_u16(),
                message: error_message(&text),
            });
        }
        Ok(response.json().await?)
    }
}

/// Message of a structured error body, or the raw body
fn error_message(text: &str) -> String {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|body| {
            ["error", "detail"]
                .iter()
                .find_map(|key| body[*key].as_str().map(str::to_string))
        })
        .unwrap_or_else(|| text.to_string())
}
