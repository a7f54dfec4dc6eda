//! Explanation Service Client

use crate::retry::RetryPolicy;
use obd_protocol::SensorSnapshot;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Public explanation endpoint
pub const DEFAULT_ENDPOINT: &str = "https://obdpluscloud.onrender.com/explain";

/// Default bound on one explanation call
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Gateway error types
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("gateway returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("gateway reported an error: {0}")]
    Remote(String),

    #[error("gateway did not answer within {0:?}")]
    Timeout(Duration),
}

/// Outcome of an explanation call. Serializes as `{"explanation": ...}` or
/// `{"error": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExplanationResult {
    Explanation { explanation: Value },
    Error { error: String },
}

impl ExplanationResult {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub url: String,
    /// Default per-call timeout
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_ENDPOINT.to_string(),
            timeout: DEFAULT_TIMEOUT,
            retry: RetryPolicy::gateway(),
        }
    }
}

#[derive(Serialize)]
struct ExplainRequest<'a> {
    code: &'a str,
    freeze_frame: &'a SensorSnapshot,
}

/// Client for the remote explanation service
#[derive(Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    config: GatewayConfig,
}

impl GatewayClient {
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder().use_rustls_tls().build()?;
        info!("Explanation gateway at {}", config.url);
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Ask the service to explain `code` given the freeze frame it was
    /// captured with.
    ///
    /// The whole call, retries included, finishes within `timeout` plus one
    /// backoff. `None` uses the configured timeout. Never fails: every
    /// problem is folded into [`ExplanationResult::Error`].
    pub async fn explain(
        &self,
        code: &str,
        freeze_frame: &SensorSnapshot,
        timeout: Option<Duration>,
    ) -> ExplanationResult {
        let timeout = timeout.unwrap_or(self.config.timeout);
        let deadline = timeout + self.config.retry.backoff;

        let outcome = tokio::time::timeout(deadline, self.request(code, freeze_frame, timeout))
            .await
            .unwrap_or(Err(GatewayError::Timeout(deadline)));

        match outcome {
            Ok(explanation) => {
                debug!(code, "Explanation received");
                ExplanationResult::Explanation { explanation }
            }
            Err(e) => {
                warn!(code, "Explanation failed: {}", e);
                metrics::counter!("obd_gateway_failures_total").increment(1);
                ExplanationResult::Error {
                    error: e.to_string(),
                }
            }
        }
    }

    async fn request(
        &self,
        code: &str,
        freeze_frame: &SensorSnapshot,
        timeout: Duration,
    ) -> Result<Value, GatewayError> {
        let body = ExplainRequest { code, freeze_frame };

        let response = self
            .config
            .retry
            .run(|attempt| {
                debug!(code, attempt, "Posting explanation request");
                metrics::counter!("obd_gateway_attempts_total").increment(1);
                self.http
                    .post(&self.config.url)
                    .timeout(timeout)
                    .json(&body)
                    .send()
            })
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(GatewayError::HttpStatus {
                status: status.as_u16(),
                body: text,
            });
        }
        parse_explanation(text)
    }
}

/// Pull the explanation out of a success body.
///
/// `{"explanation": x}` yields `x`; a body carrying only `error` is a remote
/// failure; any other JSON is returned whole and non-JSON becomes a string.
fn parse_explanation(text: String) -> Result<Value, GatewayError> {
    match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(mut map)) => {
            if let Some(explanation) = map.remove("explanation") {
                return Ok(explanation);
            }
            if let Some(Value::String(error)) = map.get("error") {
                return Err(GatewayError::Remote(error.clone()));
            }
            Ok(Value::Object(map))
        }
        Ok(other) => Ok(other),
        Err(_) => Ok(Value::String(text)),
    }
}
