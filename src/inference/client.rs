//! OpenAI-compatible HTTP backend.
//!
//! Sends non-streaming chat completion requests to a hosted provider (or to
//! the local runtime's `/v1` endpoint) and returns the raw `Completion`.
//! Text-embedded tool calls are left untouched here; the recovery engine
//! reclassifies them one layer up.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use uuid::Uuid;

use super::backend::{Completion, ModelBackend};
use super::config::ProviderConfig;
use super::errors::InferenceError;
use super::types::{ChatCompletionRequest, ChatMessage, Message, ToolDefinition, ToolInvocation};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Total request timeout. Vision and tool turns on hosted providers can be slow.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

// ─── HttpBackend ─────────────────────────────────────────────────────────────

/// Chat completions client for one provider.
pub struct HttpBackend {
    http: HttpClient,
    provider: String,
    base_url: String,
    api_key: Option<String>,
    /// Hosted providers refuse to send without a key; the local runtime does not need one.
    requires_key: bool,
    temperature: f32,
    max_tokens: u32,
}

impl HttpBackend {
    /// Create a backend for a hosted provider.
    ///
    /// A key that is empty or lacks the provider's prefix is dropped here, so
    /// `send` reports `MissingCredentials` without touching the network.
    pub fn from_provider(provider: &str, config: &ProviderConfig) -> Result<Self, InferenceError> {
        Ok(Self {
            http: build_http_client(&config.base_url)?,
            provider: provider.to_string(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.usable_api_key().map(str::to_string),
            requires_key: true,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }

    /// Create a keyless backend for the local runtime's OpenAI-compatible API.
    pub fn local(base_url: &str) -> Result<Self, InferenceError> {
        let api_base = format!("{}/v1", base_url.trim_end_matches('/'));
        Ok(Self {
            http: build_http_client(&api_base)?,
            provider: "local".to_string(),
            base_url: api_base,
            api_key: None,
            requires_key: false,
            temperature: 0.7,
            max_tokens: 4096,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

fn build_http_client(endpoint: &str) -> Result<HttpClient, InferenceError> {
    HttpClient::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| InferenceError::ConnectionFailed {
            endpoint: endpoint.to_string(),
            reason: format!("failed to build HTTP client: {e}"),
        })
}

#[async_trait]
impl ModelBackend for HttpBackend {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn send(
        &self,
        messages: &[Message],
        model: &str,
        tools: Option<&[ToolDefinition]>,
    ) -> Result<Completion, InferenceError> {
        if self.requires_key && self.api_key.is_none() {
            return Err(InferenceError::MissingCredentials {
                provider: self.provider.clone(),
            });
        }

        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatCompletionRequest {
            model: model.to_string(),
            messages: messages.iter().map(ChatMessage::from).collect(),
            tools: tools.map(<[ToolDefinition]>::to_vec),
            tool_choice: tools.map(|_| "auto".to_string()),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream: false,
        };

        tracing::debug!(
            provider = %self.provider,
            model,
            message_count = messages.len(),
            tool_count = tools.map_or(0, <[ToolDefinition]>::len),
            "sending chat completion"
        );

        let mut request = self.http.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                InferenceError::Timeout {
                    duration_secs: REQUEST_TIMEOUT.as_secs(),
                }
            } else {
                InferenceError::ConnectionFailed {
                    endpoint: url.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }

        let body_text = response
            .text()
            .await
            .map_err(|e| InferenceError::ResponseParse {
                reason: format!("failed to read response body: {e}"),
            })?;

        parse_completion_response(&body_text)
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Parse a chat completion body into content and structured tool calls.
///
/// Tool call arguments are kept as the raw string the provider returned;
/// a missing call id is replaced with a generated one.
pub fn parse_completion_response(body: &str) -> Result<Completion, InferenceError> {
    #[derive(Deserialize)]
    struct CompletionResponse {
        choices: Vec<CompletionChoice>,
    }

    #[derive(Deserialize)]
    struct CompletionChoice {
        message: CompletionMessage,
    }

    #[derive(Deserialize)]
    struct CompletionMessage {
        content: Option<String>,
        tool_calls: Option<Vec<CompletionToolCall>>,
    }

    #[derive(Deserialize)]
    struct CompletionToolCall {
        id: Option<String>,
        function: CompletionFunction,
    }

    #[derive(Deserialize)]
    struct CompletionFunction {
        name: String,
        #[serde(default)]
        arguments: Option<String>,
    }

    let resp: CompletionResponse =
        serde_json::from_str(body).map_err(|e| InferenceError::ResponseParse {
            reason: format!("failed to parse completion response: {e}"),
        })?;

    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or(InferenceError::ResponseParse {
            reason: "empty choices array".into(),
        })?;

    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|tc| {
            let id = tc
                .id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| format!("call_{}", Uuid::new_v4()));
            let raw = tc.function.arguments.unwrap_or_else(|| "{}".to_string());
            ToolInvocation::new(id, tc.function.name, raw)
        })
        .collect();

    Ok(Completion {
        content: choice.message.content.filter(|c| !c.is_empty()),
        tool_calls,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
