//! Chat-completion client for a local OpenAI-compatible server.
//!
//! Two model tiers share one server: a fast default model and a larger
//! escalation model. [`InferenceCapability::complete`] performs a single
//! attempt bounded by the configured timeout; retry and backoff belong to
//! the caller, which knows whether a reply was usable.
//!
//! Retry strategy used by callers:
//! - timeout, HTTP 429 or 5xx, network error → retry with backoff
//! - other HTTP 4xx → fail immediately
//! - connection refused → retry; if every attempt is refused the server is
//!   considered unreachable

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::config::InferenceConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Default,
    Escalation,
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("inference request timed out")]
    Timeout,

    #[error("inference transport error: {0}")]
    Transport(String),

    #[error("inference server returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("inference server unreachable at {0}")]
    Unreachable(String),

    #[error("malformed inference reply: {0}")]
    Malformed(String),
}

impl InferenceError {
    pub fn is_retryable(&self) -> bool {
        match self {
            InferenceError::Timeout
            | InferenceError::Transport(_)
            | InferenceError::Unreachable(_)
            | InferenceError::Malformed(_) => true,
            InferenceError::Status { status, .. } => *status == 429 || *status >= 500,
        }
    }
}

/// Models the server reports as loaded.
#[derive(Debug, Clone, Default)]
pub struct Health {
    pub models: Vec<String>,
}

impl Health {
    pub fn has_model(&self, name: &str) -> bool {
        self.models.iter().any(|m| m == name)
    }
}

#[async_trait]
pub trait InferenceCapability: Send + Sync {
    /// One request at `tier`; returns the reply text.
    async fn complete(&self, tier: Tier, system: &str, user: &str)
        -> Result<String, InferenceError>;

    fn model_for(&self, tier: Tier) -> &str;

    async fn health(&self) -> Result<Health, InferenceError>;
}

/// Exponential backoff: `base * 2^(attempt-1)`, capped at `max`. Attempt 0
/// is the first try and never waits.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn from_config(config: &InferenceConfig) -> Self {
        Self {
            base: Duration::from_millis(config.backoff_base_ms),
            max: Duration::from_millis(config.backoff_max_ms),
        }
    }

    pub fn none() -> Self {
        Self {
            base: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32 << (attempt - 1).min(16);
        self.base.saturating_mul(factor).min(self.max)
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

pub struct OpenAiClient {
    client: reqwest::Client,
    base_url: String,
    default_model: String,
    escalation_model: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiClient {
    pub fn from_config(config: &InferenceConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            default_model: config.default_model.clone(),
            escalation_model: config.escalation_model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }

    fn classify(&self, e: reqwest::Error) -> InferenceError {
        if e.is_timeout() {
            InferenceError::Timeout
        } else if e.is_connect() {
            InferenceError::Unreachable(self.base_url.clone())
        } else {
            InferenceError::Transport(e.to_string())
        }
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, InferenceError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(InferenceError::Status {
            status: status.as_u16(),
            body: body.chars().take(500).collect(),
        })
    }
}

#[async_trait]
impl InferenceCapability for OpenAiClient {
    async fn complete(
        &self,
        tier: Tier,
        system: &str,
        user: &str,
    ) -> Result<String, InferenceError> {
        let body = ChatRequest {
            model: self.model_for(tier),
            messages: [
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.classify(e))?;
        let response = Self::check_status(response).await?;

        let text = response.text().await.map_err(|e| self.classify(e))?;
        let parsed: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| InferenceError::Malformed(format!("invalid completion envelope: {}", e)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| InferenceError::Malformed("completion has no content".to_string()))
    }

    fn model_for(&self, tier: Tier) -> &str {
        match tier {
            Tier::Default => &self.default_model,
            Tier::Escalation => &self.escalation_model,
        }
    }

    async fn health(&self) -> Result<Health, InferenceError> {
        let response = self
            .client
            .get(format!("{}/models", self.base_url))
            .send()
            .await
            .map_err(|e| self.classify(e))?;
        let response = Self::check_status(response).await?;
        let list: ModelList = response
            .json()
            .await
            .map_err(|e| InferenceError::Malformed(format!("invalid model list: {}", e)))?;

        Ok(Health {
            models: list.data.into_iter().map(|m| m.id).collect(),
        })
    }
}
