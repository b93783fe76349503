//! Error types for the request gateway.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::retry::ErrorClass;

/// Additional context from upstream errors for debugging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    /// HTTP status code from the upstream API.
    pub http_status: Option<u16>,
    /// Provider-specific error code (e.g. "rate_limit_exceeded").
    pub provider_code: Option<String>,
    /// Request ID from upstream (x-request-id header).
    pub request_id: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.provider_code = Some(code.into());
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }
}

/// Errors from a single attempt against the completion API.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The credential was rejected (401/403).
    #[error("invalid credential: {message}")]
    InvalidCredential {
        message: String,
        context: Option<ErrorContext>,
    },

    /// Rate limited (429). `retry_after` is the upstream hint, if any.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited {
        retry_after: Option<Duration>,
        context: Option<ErrorContext>,
    },

    /// Upstream 5xx.
    #[error("server error {status}: {message}")]
    Server {
        status: u16,
        message: String,
        context: Option<ErrorContext>,
    },

    /// Request did not finish within the configured timeout.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// HTTP/network error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Upstream refused the request shape (other 4xx, oversized input).
    #[error("invalid request: {message}")]
    InvalidRequest {
        message: String,
        context: Option<ErrorContext>,
    },

    /// 2xx with a body we could not use.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// Configuration error (unusable secret, bad base URL...).
    #[error("configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    pub fn invalid_credential(message: impl Into<String>, context: ErrorContext) -> Self {
        Self::InvalidCredential {
            message: message.into(),
            context: Some(context),
        }
    }

    pub fn rate_limited(retry_after: Option<Duration>, context: ErrorContext) -> Self {
        Self::RateLimited {
            retry_after,
            context: Some(context),
        }
    }

    pub fn server(status: u16, message: impl Into<String>, context: ErrorContext) -> Self {
        Self::Server {
            status,
            message: message.into(),
            context: Some(context),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
            context: None,
        }
    }

    pub fn invalid_request_with_context(message: impl Into<String>, context: ErrorContext) -> Self {
        Self::InvalidRequest {
            message: message.into(),
            context: Some(context),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedResponse(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Errors that no amount of retrying or credential switching will fix.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Get a short error code for logging.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidCredential { .. } => "invalid_credential",
            Self::RateLimited { .. } => "rate_limited",
            Self::Server { .. } => "server_error",
            Self::Timeout(_) => "timeout",
            Self::Http(_) => "http_error",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::MalformedResponse(_) => "malformed_response",
            Self::Config(_) => "config_error",
        }
    }

    /// Get the error context if available.
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::InvalidCredential { context, .. } => context.as_ref(),
            Self::RateLimited { context, .. } => context.as_ref(),
            Self::Server { context, .. } => context.as_ref(),
            Self::InvalidRequest { context, .. } => context.as_ref(),
            Self::Timeout(_) | Self::Http(_) | Self::MalformedResponse(_) | Self::Config(_) => None,
        }
    }

    /// HTTP status, if the error came from an HTTP response.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::Server { status, .. } => Some(*status),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => self.context().and_then(|c| c.http_status),
        }
    }

    /// Get the request ID if available.
    pub fn request_id(&self) -> Option<&str> {
        self.context().and_then(|c| c.request_id.as_deref())
    }
}

/// Terminal error returned by [`RequestGateway::execute`](super::RequestGateway::execute).
///
/// Cloneable because one settled operation is handed to every caller that was
/// coalesced onto it.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// Attempt budget used up; carries the last classified failure.
    #[error("request failed after {attempts} attempt(s) ({class}): {source}")]
    Exhausted {
        attempts: u32,
        class: ErrorClass,
        source: Arc<ProviderError>,
    },

    /// A failure that retrying cannot fix.
    #[error("fatal provider error: {0}")]
    Fatal(Arc<ProviderError>),

    /// The credential pool was built with no credentials.
    #[error("credential pool is empty")]
    EmptyPool,

    #[error("configuration error: {0}")]
    Config(String),

    /// The shared in-flight operation panicked or was torn down.
    #[error("in-flight request aborted: {0}")]
    Aborted(String),
}

impl GatewayError {
    pub fn exhausted(attempts: u32, class: ErrorClass, source: ProviderError) -> Self {
        Self::Exhausted {
            attempts,
            class,
            source: Arc::new(source),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// The class of the last failure, for errors that went through the retry loop.
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            Self::Exhausted { class, .. } => Some(*class),
            _ => None,
        }
    }

    /// The last provider error, if there was one.
    pub fn provider_error(&self) -> Option<&ProviderError> {
        match self {
            Self::Exhausted { source, .. } | Self::Fatal(source) => Some(source.as_ref()),
            _ => None,
        }
    }

    /// Get a short error code for logging.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Exhausted { .. } => "exhausted",
            Self::Fatal(_) => "fatal",
            Self::EmptyPool => "empty_pool",
            Self::Config(_) => "config_error",
            Self::Aborted(_) => "aborted",
        }
    }
}
