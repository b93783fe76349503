//! HTTP transport for OpenAI-compatible chat completion endpoints.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use serde::{Deserialize, Serialize};

use super::error::{ErrorContext, ProviderError};
use super::types::*;

// =============================================================================
// TRAIT
// =============================================================================

/// One attempt against the completion API with a given credential secret.
///
/// The gateway owns retries, pacing and credential choice; implementations
/// only translate one request into one response or one classified error.
#[async_trait]
pub trait CompletionTransport: Send + Sync {
    async fn complete(
        &self,
        secret: &str,
        req: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError>;
}

// =============================================================================
// OPENAI-COMPATIBLE ADAPTER
// =============================================================================

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Maximum allowed response body length (1MB).
const MAX_RESPONSE_LEN: usize = 1_024 * 1_024;

/// Maximum allowed input characters (~125k tokens).
const MAX_INPUT_CHARS: usize = 500_000;

/// Client for `POST {base_url}/chat/completions` with bearer auth.
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleTransport {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl OpenAiCompatibleTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ProviderError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .gzip(true)
            .build()
            .map_err(|e| ProviderError::config(format!("Failed to create HTTP client: {e}")))?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self {
            client,
            base_url,
            timeout,
        })
    }

    /// Default endpoint with the given timeout.
    pub fn with_timeout(timeout: Duration) -> Result<Self, ProviderError> {
        Self::new(DEFAULT_BASE_URL, timeout)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    /// Extract request ID from response headers.
    fn extract_request_id(headers: &HeaderMap) -> Option<String> {
        headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }

    /// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
    fn extract_retry_after(headers: &HeaderMap) -> Option<Duration> {
        headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    fn error_for_status(
        status: u16,
        message: String,
        ctx: ErrorContext,
        retry_after: Option<Duration>,
    ) -> ProviderError {
        match status {
            401 | 403 => ProviderError::invalid_credential(message, ctx),
            429 => ProviderError::rate_limited(retry_after, ctx),
            s if s >= 500 => ProviderError::server(s, message, ctx),
            _ => ProviderError::invalid_request_with_context(message, ctx),
        }
    }
}

// =============================================================================
// API TYPES
// =============================================================================

#[derive(Serialize)]
struct ChatApiRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Deserialize)]
struct ChatApiResponse {
    choices: Option<Vec<Choice>>,
    usage: Option<Usage>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
    total_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ApiErrorEnvelope {
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct ApiError {
    message: Option<String>,
    code: Option<serde_json::Value>,
}

impl ApiError {
    fn code_string(&self) -> Option<String> {
        match self.code.as_ref()? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}

// =============================================================================
// TRANSPORT IMPL
// =============================================================================

#[async_trait]
impl CompletionTransport for OpenAiCompatibleTransport {
    async fn complete(
        &self,
        secret: &str,
        req: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let total_chars = req.input_chars();
        if total_chars > MAX_INPUT_CHARS {
            return Err(ProviderError::invalid_request(format!(
                "Input too large: {total_chars} chars (max {MAX_INPUT_CHARS})"
            )));
        }

        let mut auth_value = HeaderValue::from_str(&format!("Bearer {secret}"))
            .map_err(|_| ProviderError::config("Invalid API key format"))?;
        auth_value.set_sensitive(true);

        let api_req = ChatApiRequest {
            model: &req.model,
            messages: &req.messages,
            max_tokens: req.max_output_tokens,
            temperature: req.temperature,
        };

        let mut response = self
            .client
            .post(self.chat_url())
            .header(AUTHORIZATION, auth_value)
            .json(&api_req)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        let request_id = Self::extract_request_id(response.headers());
        let retry_after = Self::extract_retry_after(response.headers());

        // Stream response to enforce size limit
        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| self.map_send_error(e))? {
            let new_len = bytes.len() + chunk.len();
            if new_len > MAX_RESPONSE_LEN {
                return Err(ProviderError::malformed(format!(
                    "Response too large: {new_len} bytes"
                )));
            }
            bytes.extend_from_slice(&chunk);
        }

        let body = String::from_utf8_lossy(&bytes);

        let mut ctx = ErrorContext::new().with_status(status.as_u16());
        if let Some(id) = &request_id {
            ctx = ctx.with_request_id(id);
        }

        if !status.is_success() {
            let mut message = format!("HTTP {}", status.as_u16());
            if let Ok(ApiErrorEnvelope { error: Some(error) }) =
                serde_json::from_str::<ApiErrorEnvelope>(&body)
            {
                if let Some(code) = error.code_string() {
                    ctx = ctx.with_code(code);
                }
                if let Some(m) = error.message.filter(|m| !m.is_empty()) {
                    message = m;
                }
            }
            return Err(Self::error_for_status(status.as_u16(), message, ctx, retry_after));
        }

        let parsed: ChatApiResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::malformed(format!("Invalid JSON: {e}")))?;

        // Some gateways report errors with a 200.
        if let Some(error) = parsed.error {
            let message = error.message.clone().unwrap_or_default();
            if let Some(code) = error.code_string() {
                ctx = ctx.with_code(code);
            }
            return Err(ProviderError::invalid_request_with_context(message, ctx));
        }

        let choice = parsed
            .choices
            .and_then(|c| c.into_iter().next())
            .ok_or_else(|| ProviderError::malformed("No choices in response"))?;

        let text = choice
            .message
            .and_then(|m| m.content)
            .unwrap_or_default();

        let usage = parsed
            .usage
            .ok_or_else(|| ProviderError::malformed("Missing usage in response"))?;
        let prompt_tokens = usage.prompt_tokens.unwrap_or(0);
        let completion_tokens = usage.completion_tokens.unwrap_or(0);
        let total_tokens = usage
            .total_tokens
            .unwrap_or_else(|| prompt_tokens.saturating_add(completion_tokens));

        Ok(CompletionResponse {
            text,
            usage: TokenUsage {
                prompt_tokens,
                completion_tokens,
                total_tokens,
            },
            finish_reason: FinishReason::from(choice.finish_reason),
        })
    }
}

impl OpenAiCompatibleTransport {
    fn map_send_error(&self, e: reqwest::Error) -> ProviderError {
        if e.is_timeout() {
            ProviderError::Timeout(self.timeout)
        } else {
            ProviderError::Http(e)
        }
    }
}
