//! Agent reached over an Anthropic-style `/v1/messages` endpoint.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

use super::{Agent, Artifacts, InvocationContext, Outcome};
use crate::state_machine::WorkItem;

pub const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesRequest {
    pub model: String,
    pub max_tokens: u32,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub id: String,
    pub content: Vec<ContentBlock>,
    pub model: String,
    pub stop_reason: Option<String>,
}

/// The `type` field is renamed to match the wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default)]
    pub text: String,
}

impl MessagesResponse {
    fn text(&self) -> String {
        self.content
            .iter()
            .filter(|b| b.content_type == "text")
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("API error (status {status}): {message}")]
    Status { status: u16, message: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

impl ApiError {
    /// Rate limits, overload, server errors and network failures may clear
    /// up on their own; any other client error means the request is wrong.
    fn into_outcome(self) -> Outcome {
        match &self {
            ApiError::RateLimited { .. } | ApiError::Network(_) => {
                Outcome::Recoverable(self.to_string())
            }
            ApiError::Status { status, .. } => {
                let code = StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                if code.is_server_error() || code == StatusCode::REQUEST_TIMEOUT {
                    Outcome::Recoverable(self.to_string())
                } else {
                    Outcome::Fatal(self.to_string())
                }
            }
        }
    }
}

pub struct ApiAgent {
    api_key: String,
    model: String,
    max_tokens: u32,
    client: Client,
    base_url: String,
}

impl ApiAgent {
    pub fn with_base_url(
        api_key: String,
        model: String,
        max_tokens: u32,
        base_url: String,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            api_key,
            model,
            max_tokens,
            client,
            base_url,
        })
    }

    pub async fn send_message(&self, req: &MessagesRequest) -> Result<MessagesResponse, ApiError> {
        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(req)
            .send()
            .await?;

        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_ms = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map_or(1000, |secs| secs * 1000);
            return Err(ApiError::RateLimited { retry_after_ms });
        }

        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(ApiError::Status {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response.json::<MessagesResponse>().await?)
    }
}

impl Agent for ApiAgent {
    #[instrument(skip_all, fields(item = %item.id, model = %self.model))]
    async fn attempt(&self, item: &WorkItem, prompt: &str, _ctx: &InvocationContext) -> Outcome {
        let req = MessagesRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            messages: vec![Message {
                role: "user".into(),
                content: prompt.to_string(),
            }],
        };

        let response = match self.send_message(&req).await {
            Ok(response) => response,
            Err(e) => return e.into_outcome(),
        };
        debug!(id = %response.id, stop_reason = ?response.stop_reason, "agent replied");

        if response.stop_reason.as_deref() == Some("max_tokens") {
            return Outcome::Recoverable("agent reply truncated at max_tokens".to_string());
        }
        let text = response.text();
        if text.trim().is_empty() {
            return Outcome::Recoverable("agent reply was empty".to_string());
        }
        Outcome::Success(Artifacts(text))
    }
}
