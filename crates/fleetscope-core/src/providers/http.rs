//! Analysis provider speaking the Anthropic Messages API over HTTP.

use async_trait::async_trait;
use fleetscope_state::TokenUsage;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{AnalysisProvider, Completion, CompletionRequest};
use crate::domain::{ConfigError, ProviderError};
use crate::pipeline::render_prompt;

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const API_VERSION: &str = "2023-06-01";

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: [Message<'a>; 1],
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

pub struct HttpAnalysisProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpAnalysisProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("fleetscope/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConfigError::Invalid {
                field: "http_client",
                reason: e.to_string(),
            })?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    /// `ANTHROPIC_API_KEY` (required) and `FLEETSCOPE_ANALYSIS_URL` (optional).
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or(ConfigError::Invalid {
                field: "ANTHROPIC_API_KEY",
                reason: "not set".into(),
            })?;
        let base_url =
            std::env::var("FLEETSCOPE_ANALYSIS_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Self::new(base_url, api_key)
    }
}

fn map_status(status: StatusCode, body: &str) -> ProviderError {
    let detail = format!("{status}: {}", body.chars().take(500).collect::<String>());
    match status.as_u16() {
        429 => ProviderError::RateLimited(detail),
        408 | 500..=599 => ProviderError::ServiceError(detail),
        _ => ProviderError::Rejected(detail),
    }
}

fn parse_response(body: &str) -> Result<Completion, ProviderError> {
    let parsed: MessagesResponse = serde_json::from_str(body)
        .map_err(|e| ProviderError::ServiceError(format!("unparseable response: {e}")))?;
    if parsed.stop_reason.as_deref() == Some("refusal") {
        return Err(ProviderError::ContentPolicy("model declined to answer".into()));
    }
    let content = parsed
        .content
        .iter()
        .filter(|b| b.kind == "text")
        .filter_map(|b| b.text.as_deref())
        .collect::<Vec<_>>()
        .join("");
    let usage = parsed
        .usage
        .map(|u| TokenUsage {
            input_tokens: u.input_tokens,
            output_tokens: u.output_tokens,
        })
        .unwrap_or_default();
    Ok(Completion { content, usage })
}

#[async_trait]
impl AnalysisProvider for HttpAnalysisProvider {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<Completion, ProviderError> {
        let prompt = render_prompt(
            request.template,
            request.repo_structure,
            request.dependency_manifest,
            request.context,
        );
        let body = MessagesRequest {
            model: &request.model.model,
            max_tokens: request.model.max_tokens,
            messages: [Message {
                role: "user",
                content: &prompt,
            }],
        };

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::ServiceError(format!("request timed out: {e}"))
                } else {
                    ProviderError::ServiceError(e.to_string())
                }
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::ServiceError(e.to_string()))?;
        if !status.is_success() {
            return Err(map_status(status, &text));
        }
        let completion = parse_response(&text)?;
        debug!(
            step = %request.step_id,
            input_tokens = completion.usage.input_tokens,
            output_tokens = completion.usage.output_tokens,
            "analysis completed"
        );
        Ok(completion)
    }
}
