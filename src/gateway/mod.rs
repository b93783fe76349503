//! Request gateway for chat completions.
//!
//! [`RequestGateway::execute`] is the single way a completion request reaches
//! the network. Per request it:
//!
//! 1. serves an unexpired cached response if there is one,
//! 2. otherwise joins an identical request already in flight,
//! 3. otherwise runs the attempt loop once on behalf of every waiter:
//!    credential selection with a dispatch slot that honours both global and
//!    per-credential spacing, dispatch, then classify/record/back off on
//!    failure, up to the attempt ceiling.

pub mod credentials;
pub mod error;
pub mod pacing;
pub mod retry;
pub mod transport;
pub mod types;
pub mod usage;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::cache::{Fingerprint, ResponseCache};
use crate::clock::{Clock, TokioClock};
use crate::dedup::{Attach, DedupRegistry};

use credentials::CredentialLease;
use pacing::Pacer;
use usage::CallRecord;

pub use credentials::{
    Credential, CredentialPool, CredentialSnapshot, CredentialState, PoolConfig,
};
pub use error::{ErrorContext, GatewayError, ProviderError};
pub use retry::{ErrorClass, RetryAction, RetryConfig, RetryPolicy};
pub use transport::{CompletionTransport, OpenAiCompatibleTransport, DEFAULT_BASE_URL};
pub use types::*;
pub use usage::{CallStatus, NoopUsageSink, StderrUsageSink, UsageSink};

/// Anything that can answer a completion request.
///
/// Callers that only need "send this, get text back" should depend on this
/// trait rather than on [`RequestGateway`] so they can be tested with a stub.
#[async_trait::async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: CompletionRequest) -> Result<CompletionResponse, GatewayError>;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Base URL of the OpenAI-compatible API.
    pub base_url: String,
    /// Bound on a single network call.
    pub request_timeout: Duration,
    /// Minimum spacing between any two dispatches.
    pub global_spacing: Duration,
    /// How long a successful response is served from cache.
    pub cache_ttl: Duration,
    pub retry: RetryConfig,
    pub pool: PoolConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(120),
            global_spacing: Duration::from_secs(3),
            cache_ttl: Duration::from_secs(24 * 60 * 60),
            retry: RetryConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Defaults overridden by `LLM_GATEWAY_*` environment variables.
    /// Unparseable values are ignored.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let base_url =
            std::env::var("LLM_GATEWAY_BASE_URL").unwrap_or_else(|_| defaults.base_url.clone());

        Self {
            base_url,
            request_timeout: env_secs("LLM_GATEWAY_TIMEOUT_SECONDS")
                .unwrap_or(defaults.request_timeout),
            global_spacing: env_millis("LLM_GATEWAY_GLOBAL_SPACING_MS")
                .unwrap_or(defaults.global_spacing),
            cache_ttl: env_secs("LLM_GATEWAY_CACHE_TTL_SECONDS").unwrap_or(defaults.cache_ttl),
            retry: defaults.retry,
            pool: PoolConfig {
                cooldown: env_secs("LLM_GATEWAY_COOLDOWN_SECONDS")
                    .unwrap_or(defaults.pool.cooldown),
                quarantine: env_secs("LLM_GATEWAY_QUARANTINE_SECONDS")
                    .unwrap_or(defaults.pool.quarantine),
                degraded_probation: env_secs("LLM_GATEWAY_PROBATION_SECONDS")
                    .unwrap_or(defaults.pool.degraded_probation),
                min_spacing: env_millis("LLM_GATEWAY_KEY_SPACING_MS")
                    .unwrap_or(defaults.pool.min_spacing),
                ..defaults.pool
            },
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn env_secs(name: &str) -> Option<Duration> {
    env_u64(name).map(Duration::from_secs)
}

fn env_millis(name: &str) -> Option<Duration> {
    env_u64(name).map(Duration::from_millis)
}

/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct RequestGateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    transport: Arc<dyn CompletionTransport>,
    pool: Arc<CredentialPool>,
    cache: ResponseCache,
    dedup: Arc<DedupRegistry<CompletionResponse>>,
    pacer: Pacer,
    retry: RetryPolicy,
    usage_sink: Arc<dyn UsageSink>,
    clock: Arc<dyn Clock>,
    config: GatewayConfig,
}

/// Wires a gateway from explicit parts.
pub struct GatewayBuilder {
    transport: Arc<dyn CompletionTransport>,
    pool: Arc<CredentialPool>,
    clock: Arc<dyn Clock>,
    usage_sink: Arc<dyn UsageSink>,
    config: GatewayConfig,
}

impl GatewayBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn usage_sink(mut self, sink: Arc<dyn UsageSink>) -> Self {
        self.usage_sink = sink;
        self
    }

    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> RequestGateway {
        let GatewayBuilder {
            transport,
            pool,
            clock,
            usage_sink,
            config,
        } = self;
        let inner = GatewayInner {
            transport,
            pool,
            cache: ResponseCache::new(config.cache_ttl, clock.clone()),
            dedup: Arc::new(DedupRegistry::new()),
            pacer: Pacer::new(config.global_spacing, clock.clone()),
            retry: RetryPolicy::new(config.retry.clone()),
            usage_sink,
            clock,
            config,
        };
        RequestGateway {
            inner: Arc::new(inner),
        }
    }
}

#[async_trait::async_trait]
impl ChatGateway for RequestGateway {
    async fn chat(&self, req: CompletionRequest) -> Result<CompletionResponse, GatewayError> {
        self.execute(req).await
    }
}

impl RequestGateway {
    /// Start wiring a gateway. Defaults: [`TokioClock`], [`NoopUsageSink`],
    /// [`GatewayConfig::default`].
    ///
    /// The pool should share the clock given to the builder.
    pub fn builder(
        transport: Arc<dyn CompletionTransport>,
        pool: Arc<CredentialPool>,
    ) -> GatewayBuilder {
        GatewayBuilder {
            transport,
            pool,
            clock: Arc::new(TokioClock),
            usage_sink: Arc::new(NoopUsageSink),
            config: GatewayConfig::default(),
        }
    }

    /// Build the HTTP transport, credential pool and configuration from the
    /// environment.
    pub fn from_env(usage_sink: Arc<dyn UsageSink>) -> Result<Self, GatewayError> {
        let config = GatewayConfig::from_env();
        let clock: Arc<dyn Clock> = Arc::new(TokioClock);
        let transport = OpenAiCompatibleTransport::new(&config.base_url, config.request_timeout)
            .map_err(|e| GatewayError::config(e.to_string()))?;
        let pool = CredentialPool::from_env(config.pool.clone(), clock.clone())?;

        Ok(Self::builder(Arc::new(transport), Arc::new(pool))
            .clock(clock)
            .usage_sink(usage_sink)
            .config(config)
            .build())
    }

    pub fn pool(&self) -> &CredentialPool {
        &self.inner.pool
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.inner.cache
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    /// Requests currently in flight (after coalescing).
    pub fn in_flight(&self) -> usize {
        self.inner.dedup.len()
    }

    /// Run one logical completion request.
    ///
    /// Concurrent calls with the same fingerprint share one network operation
    /// and all observe its outcome.
    pub async fn execute(
        &self,
        req: CompletionRequest,
    ) -> Result<CompletionResponse, GatewayError> {
        let fingerprint = Fingerprint::of(&req);

        if let Some(hit) = self.inner.cache.get(&fingerprint) {
            debug!(fingerprint = %fingerprint.short(), model = %req.model, "cache hit");
            self.inner.record_cache_hit(&req, &fingerprint).await;
            return Ok(hit);
        }

        let inner = Arc::clone(&self.inner);
        let (pending, attach) = self
            .inner
            .dedup
            .get_or_attach(fingerprint, move || async move {
                inner.run(fingerprint, req).await
            });
        if attach == Attach::Started {
            debug!(fingerprint = %fingerprint.short(), "started new request");
        }
        pending.await
    }
}

impl GatewayInner {
    /// The attempt loop: select and claim a slot, wait for it, dispatch, record.
    async fn run(
        &self,
        fingerprint: Fingerprint,
        req: CompletionRequest,
    ) -> Result<CompletionResponse, GatewayError> {
        // A peer may have settled between the caller's cache check and our
        // registration.
        if let Some(hit) = self.cache.get(&fingerprint) {
            self.record_cache_hit(&req, &fingerprint).await;
            return Ok(hit);
        }

        let max_attempts = self.retry.max_attempts();
        let mut attempt: u32 = 1;
        loop {
            let lease = self.pool.select_paced(&self.pacer).await;
            self.clock.sleep_until(lease.dispatch_at).await;

            debug!(
                fingerprint = %fingerprint.short(),
                credential = %lease.id,
                attempt,
                model = %req.model,
                "dispatching completion request"
            );
            let started = self.clock.now();
            let outcome = self.dispatch(&lease, &req).await;
            let latency_ms = self
                .clock
                .now()
                .saturating_duration_since(started)
                .as_millis() as u64;

            let err = match outcome {
                Ok(resp) => {
                    self.pool.record_success(&lease.id);
                    self.cache.set(fingerprint, resp.clone());
                    let record = self
                        .base_record(&req, &fingerprint, &lease, attempt, latency_ms)
                        .tokens(resp.usage.prompt_tokens, resp.usage.completion_tokens);
                    self.usage_sink.record(record).await;
                    return Ok(resp);
                }
                Err(err) => err,
            };

            let class = RetryPolicy::classify(&err);
            self.pool.record_failure(&lease.id, class);
            let record = self
                .base_record(&req, &fingerprint, &lease, attempt, latency_ms)
                .error(err.code(), class)
                .request_id(err.request_id().map(str::to_string));
            self.usage_sink.record(record).await;

            if err.is_fatal() {
                warn!(error = %err, credential = %lease.id, "completion request failed fatally");
                return Err(GatewayError::Fatal(Arc::new(err)));
            }

            match self.retry.next_action(class, attempt) {
                RetryAction::Retry { delay } => {
                    warn!(
                        error = %err,
                        class = %class,
                        credential = %lease.id,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "completion attempt failed; retrying"
                    );
                    self.clock.sleep(delay).await;
                    attempt += 1;
                }
                RetryAction::GiveUp => {
                    warn!(
                        error = %err,
                        class = %class,
                        attempts = attempt,
                        fingerprint = %fingerprint.short(),
                        "completion request exhausted its attempts"
                    );
                    return Err(GatewayError::exhausted(attempt, class, err));
                }
            }
        }
    }

    async fn dispatch(
        &self,
        lease: &CredentialLease,
        req: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let timeout = self.config.request_timeout;
        match tokio::time::timeout(timeout, self.transport.complete(&lease.secret, req)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(timeout)),
        }
    }

    fn base_record(
        &self,
        req: &CompletionRequest,
        fingerprint: &Fingerprint,
        lease: &CredentialLease,
        attempt: u32,
        latency_ms: u64,
    ) -> CallRecord {
        CallRecord::new(&req.model, fingerprint.short(), req.attribution.caller)
            .credential(&lease.id)
            .attempt(attempt)
            .latency(latency_ms)
            .job(req.attribution.job_id)
    }

    async fn record_cache_hit(&self, req: &CompletionRequest, fingerprint: &Fingerprint) {
        let record = CallRecord::new(&req.model, fingerprint.short(), req.attribution.caller)
            .job(req.attribution.job_id)
            .cache_hit();
        self.usage_sink.record(record).await;
    }
}
