#![forbid(unsafe_code)]

//! # llm-gateway
//!
//! A rate-limit-aware front door for chat-completion APIs.
//!
//! Every request goes through [`RequestGateway::execute`], which serves
//! repeated prompts from a TTL cache, merges identical concurrent requests
//! into one network call, spaces dispatches globally and per credential,
//! rotates across a pool of API keys with cooldown and quarantine windows,
//! and retries with class-specific backoff. [`BoundedExecutor`] fans out
//! independent requests under a concurrency ceiling.
//!
//! ```no_run
//! use std::sync::Arc;
//! use llm_gateway::{Attribution, CompletionRequest, Message, NoopUsageSink, RequestGateway};
//!
//! # async fn run() -> Result<(), llm_gateway::GatewayError> {
//! let gateway = RequestGateway::from_env(Arc::new(NoopUsageSink))?;
//! let req = CompletionRequest::new(
//!     "gpt-4o-mini",
//!     vec![Message::user("Say hello")],
//!     Attribution::new("docs"),
//! );
//! let resp = gateway.execute(req).await?;
//! println!("{}", resp.text);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod clock;
pub mod dedup;
pub mod executor;
pub mod gateway;

pub use cache::{CacheStats, Fingerprint, ResponseCache};
pub use clock::{Clock, ManualClock, TokioClock};
pub use executor::{execute_bounded, BatchSummary, BoundedExecutor, TaskFailure, TaskResult};
pub use gateway::{
    Attribution, ChatGateway, CompletionRequest, CompletionResponse, CompletionTransport,
    CredentialPool, CredentialSnapshot, CredentialState, ErrorClass, GatewayBuilder,
    GatewayConfig, GatewayError, Message, NoopUsageSink, OpenAiCompatibleTransport, PoolConfig,
    ProviderError, RequestGateway, RetryConfig, Role, StderrUsageSink, TokenUsage, UsageSink,
};
