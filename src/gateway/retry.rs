//! Failure classification and backoff.
//!
//! Each failed attempt is classified once. The class decides both what happens
//! to the credential (see `CredentialPool::record_failure`) and how long the
//! gateway waits before selecting a credential again.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use super::error::ProviderError;

/// Classified failure of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    InvalidCredential,
    RateLimited,
    ServerError,
    NetworkError,
    Other,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::InvalidCredential => "invalid_credential",
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::ServerError => "server_error",
            ErrorClass::NetworkError => "network_error",
            ErrorClass::Other => "other",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Wait `delay`, then select a credential and try again.
    Retry { delay: Duration },
    /// Attempt budget is spent.
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total tries per `execute` call, including the first.
    pub max_attempts: u32,
    /// First rate-limit backoff; doubles per attempt.
    pub rate_limit_base: Duration,
    /// Upper bound on rate-limit backoff.
    pub rate_limit_cap: Duration,
    /// Linear backoff step for server, network and unclassified failures.
    pub linear_base: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            rate_limit_base: Duration::from_secs(30),
            rate_limit_cap: Duration::from_secs(120),
            linear_base: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// Map a transport failure onto a retry class.
    pub fn classify(error: &ProviderError) -> ErrorClass {
        match error {
            ProviderError::InvalidCredential { .. } => ErrorClass::InvalidCredential,
            ProviderError::RateLimited { .. } => ErrorClass::RateLimited,
            ProviderError::Server { .. } => ErrorClass::ServerError,
            ProviderError::Timeout(_) => ErrorClass::NetworkError,
            ProviderError::Http(e) => match e.status().map(|s| s.as_u16()) {
                Some(401 | 403) => ErrorClass::InvalidCredential,
                Some(429) => ErrorClass::RateLimited,
                Some(s) if s >= 500 => ErrorClass::ServerError,
                Some(_) => ErrorClass::Other,
                None => ErrorClass::NetworkError,
            },
            ProviderError::InvalidRequest { .. }
            | ProviderError::MalformedResponse(_)
            | ProviderError::Config(_) => ErrorClass::Other,
        }
    }

    /// Decide the next step after failed attempt number `attempt` (1-based).
    pub fn next_action(&self, class: ErrorClass, attempt: u32) -> RetryAction {
        if attempt >= self.max_attempts() {
            return RetryAction::GiveUp;
        }
        let delay = match class {
            // Quarantine already excludes the rejected credential.
            ErrorClass::InvalidCredential => Duration::ZERO,
            ErrorClass::RateLimited => {
                let exp = attempt.saturating_sub(1).min(16);
                let delay = self.config.rate_limit_base.saturating_mul(1u32 << exp);
                delay.min(self.config.rate_limit_cap)
            }
            ErrorClass::ServerError | ErrorClass::NetworkError | ErrorClass::Other => {
                self.config.linear_base.saturating_mul(attempt)
            }
        };
        RetryAction::Retry { delay }
    }
}
