//! Usage tracking via the UsageSink trait.
//!
//! The gateway reports every network attempt and every cache hit through a
//! UsageSink. This keeps the gateway free of any storage backend:
//! - CLI tools use StderrUsageSink (JSON lines) or NoopUsageSink
//! - Tests use NoopUsageSink or a collecting sink of their own

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::retry::ErrorClass;

/// Status of a gateway call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Success,
    Error,
    CacheHit,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Success => "success",
            CallStatus::Error => "error",
            CallStatus::CacheHit => "cache_hit",
        }
    }
}

/// Record of one attempt (or cache hit) for logging.
#[derive(Debug, Clone, Serialize)]
pub struct CallRecord {
    /// Model requested.
    pub model: String,
    /// Short request fingerprint, to correlate attempts of one request.
    pub fingerprint: String,
    /// Credential id used; `None` for cache hits.
    pub credential_id: Option<String>,
    /// 1-based attempt number within one `execute`; 0 for cache hits.
    pub attempt: u32,
    /// Prompt tokens consumed.
    pub prompt_tokens: u32,
    /// Completion tokens generated.
    pub completion_tokens: u32,
    /// Latency of the network call in milliseconds.
    pub latency_ms: u64,
    /// Call status.
    pub status: CallStatus,
    /// Error code if status is Error.
    pub error_code: Option<&'static str>,
    /// Retry class if status is Error.
    pub error_class: Option<ErrorClass>,
    /// Upstream request ID (for debugging).
    pub request_id: Option<String>,
    /// Which code path made this call.
    pub caller: &'static str,
    /// Job this request is part of (if any).
    pub job_id: Option<Uuid>,
    /// When the record was made.
    pub timestamp: DateTime<Utc>,
}

impl CallRecord {
    /// Create a new record with required fields, defaulting others.
    pub fn new(model: impl Into<String>, fingerprint: impl Into<String>, caller: &'static str) -> Self {
        Self {
            model: model.into(),
            fingerprint: fingerprint.into(),
            credential_id: None,
            attempt: 0,
            prompt_tokens: 0,
            completion_tokens: 0,
            latency_ms: 0,
            status: CallStatus::Success,
            error_code: None,
            error_class: None,
            request_id: None,
            caller,
            job_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn credential(mut self, id: impl Into<String>) -> Self {
        self.credential_id = Some(id.into());
        self
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn tokens(mut self, prompt: u32, completion: u32) -> Self {
        self.prompt_tokens = prompt;
        self.completion_tokens = completion;
        self
    }

    pub fn latency(mut self, ms: u64) -> Self {
        self.latency_ms = ms;
        self
    }

    pub fn job(mut self, job_id: Option<Uuid>) -> Self {
        self.job_id = job_id;
        self
    }

    pub fn cache_hit(mut self) -> Self {
        self.status = CallStatus::CacheHit;
        self
    }

    pub fn error(mut self, code: &'static str, class: ErrorClass) -> Self {
        self.status = CallStatus::Error;
        self.error_code = Some(code);
        self.error_class = Some(class);
        self
    }

    pub fn request_id(mut self, id: Option<String>) -> Self {
        self.request_id = id;
        self
    }
}

/// Trait for recording gateway usage.
///
/// Implement this trait to customize where usage data is stored.
#[async_trait]
pub trait UsageSink: Send + Sync {
    /// Record a call. This should be fire-and-forget:
    /// failures should be logged but not propagated.
    async fn record(&self, record: CallRecord);
}

/// No-op usage sink that discards all records.
/// Useful for CLI tools and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record(&self, _record: CallRecord) {}
}

/// Usage sink that writes to stderr as JSON lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct StderrUsageSink;

#[async_trait]
impl UsageSink for StderrUsageSink {
    async fn record(&self, record: CallRecord) {
        match serde_json::to_string(&record) {
            Ok(line) => eprintln!("{line}"),
            Err(err) => tracing::warn!(error = %err, "Failed to serialize usage record"),
        }
    }
}
