//! Credential pool with per-key health tracking.
//!
//! Selection is least-used among eligible credentials. A credential leaves the
//! eligible set when it is rate limited (cooldown), rejected (quarantine) or
//! keeps failing for unclassified reasons (degraded, with a probation window
//! after which it gets another chance). When nothing is eligible, `select`
//! waits for the earliest window to close instead of failing.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::Clock;

use super::error::GatewayError;
use super::pacing::Pacer;
use super::retry::ErrorClass;

/// Health state of one credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialState {
    Healthy,
    Cooling,
    Quarantined,
    Degraded,
}

/// An API secret plus its bookkeeping.
pub struct Credential {
    id: String,
    secret: String,
    state: CredentialState,
    request_count: u64,
    error_count: u64,
    consecutive_errors: u32,
    last_used_at: Option<Instant>,
    last_success_at: Option<Instant>,
    cooldown_until: Option<Instant>,
    quarantine_until: Option<Instant>,
    probation_until: Option<Instant>,
}

impl Credential {
    pub fn new(id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            secret: secret.into(),
            state: CredentialState::Healthy,
            request_count: 0,
            error_count: 0,
            consecutive_errors: 0,
            last_used_at: None,
            last_success_at: None,
            cooldown_until: None,
            quarantine_until: None,
            probation_until: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Return expired windows to Healthy.
    fn refresh(&mut self, now: Instant) {
        if self.cooldown_until.is_some_and(|t| t <= now) {
            self.cooldown_until = None;
        }
        if self.quarantine_until.is_some_and(|t| t <= now) {
            self.quarantine_until = None;
        }
        if self.probation_until.is_some_and(|t| t <= now) {
            self.probation_until = None;
        }
        self.state = if self.quarantine_until.is_some() {
            CredentialState::Quarantined
        } else if self.cooldown_until.is_some() {
            CredentialState::Cooling
        } else if self.probation_until.is_some() {
            CredentialState::Degraded
        } else {
            CredentialState::Healthy
        };
    }

    fn is_eligible(&self) -> bool {
        self.state == CredentialState::Healthy
    }

    /// Earliest instant at which this credential may become eligible again.
    fn reopens_at(&self) -> Option<Instant> {
        [self.cooldown_until, self.quarantine_until, self.probation_until]
            .into_iter()
            .flatten()
            .max()
    }

    fn snapshot(&self, now: Instant) -> CredentialSnapshot {
        let remaining = |t: Option<Instant>| t.map(|t| t.saturating_duration_since(now).as_millis() as u64);
        CredentialSnapshot {
            id: self.id.clone(),
            state: self.state,
            request_count: self.request_count,
            error_count: self.error_count,
            consecutive_errors: self.consecutive_errors,
            cooldown_remaining_ms: remaining(self.cooldown_until),
            quarantine_remaining_ms: remaining(self.quarantine_until),
            probation_remaining_ms: remaining(self.probation_until),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("secret", &"<redacted>")
            .field("state", &self.state)
            .field("request_count", &self.request_count)
            .field("error_count", &self.error_count)
            .field("consecutive_errors", &self.consecutive_errors)
            .finish()
    }
}

/// Serializable view of one credential, without the secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialSnapshot {
    pub id: String,
    pub state: CredentialState,
    pub request_count: u64,
    pub error_count: u64,
    pub consecutive_errors: u32,
    pub cooldown_remaining_ms: Option<u64>,
    pub quarantine_remaining_ms: Option<u64>,
    pub probation_remaining_ms: Option<u64>,
}

/// A selected credential and the instant it may be dispatched at.
#[derive(Clone)]
pub struct CredentialLease {
    pub id: String,
    pub secret: String,
    /// Reserved per-credential slot; the caller waits until then.
    pub dispatch_at: Instant,
}

impl fmt::Debug for CredentialLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialLease")
            .field("id", &self.id)
            .field("dispatch_at", &self.dispatch_at)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Exclusion window after a rate-limit response.
    pub cooldown: Duration,
    /// Exclusion window after a rejected credential.
    pub quarantine: Duration,
    /// Consecutive unclassified failures before a credential is degraded.
    pub degraded_threshold: u32,
    /// How long a degraded credential sits out before it is tried again.
    pub degraded_probation: Duration,
    /// Minimum spacing between two dispatches on the same credential.
    pub min_spacing: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(180),
            quarantine: Duration::from_secs(300),
            degraded_threshold: 3,
            degraded_probation: Duration::from_secs(600),
            min_spacing: Duration::from_secs(10),
        }
    }
}

pub struct CredentialPool {
    credentials: Mutex<Vec<Credential>>,
    config: PoolConfig,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for CredentialPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPool")
            .field("credentials", &self.lock().len())
            .field("config", &self.config)
            .finish()
    }
}

impl CredentialPool {
    pub fn new(
        credentials: Vec<Credential>,
        config: PoolConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, GatewayError> {
        if credentials.is_empty() {
            return Err(GatewayError::EmptyPool);
        }
        Ok(Self {
            credentials: Mutex::new(credentials),
            config,
            clock,
        })
    }

    /// Build a pool from bare secrets, naming them `key-1`, `key-2`, ...
    pub fn from_secrets<I, S>(
        secrets: I,
        config: PoolConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, GatewayError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let credentials = secrets
            .into_iter()
            .enumerate()
            .map(|(idx, secret)| Credential::new(format!("key-{}", idx + 1), secret))
            .collect();
        Self::new(credentials, config, clock)
    }

    /// Read secrets from `LLM_GATEWAY_API_KEYS` (comma-separated), falling
    /// back to `LLM_GATEWAY_API_KEY`.
    pub fn from_env(config: PoolConfig, clock: Arc<dyn Clock>) -> Result<Self, GatewayError> {
        let raw = std::env::var("LLM_GATEWAY_API_KEYS")
            .or_else(|_| std::env::var("LLM_GATEWAY_API_KEY"))
            .map_err(|_| GatewayError::config("LLM_GATEWAY_API_KEYS not set"))?;
        let secrets = parse_secrets(&raw);
        Self::from_secrets(secrets, config, clock)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Credential>> {
        self.credentials.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pick the least-used eligible credential, waiting if none is eligible.
    ///
    /// Choosing, bumping `request_count` and reserving the per-credential
    /// dispatch slot happen under one lock, so concurrent callers never see
    /// the same pre-selection counts.
    pub async fn select(&self) -> CredentialLease {
        self.select_with(None).await
    }

    /// Like [`select`](Self::select), but `dispatch_at` also honours the
    /// global `pacer`. The global slot is claimed in the same critical section
    /// (pool lock, then pacer lock), starting from the credential's own
    /// earliest instant, and that slot becomes the credential's last use.
    pub async fn select_paced(&self, pacer: &Pacer) -> CredentialLease {
        self.select_with(Some(pacer)).await
    }

    async fn select_with(&self, pacer: Option<&Pacer>) -> CredentialLease {
        loop {
            let wait_until = match self.try_select(pacer) {
                Ok(lease) => return lease,
                Err(wait_until) => wait_until,
            };
            debug!(?wait_until, "no eligible credential; waiting for the earliest to reopen");
            self.clock.sleep_until(wait_until).await;
        }
    }

    /// One non-blocking scan. `Err` carries the instant to wait for.
    fn try_select(&self, pacer: Option<&Pacer>) -> Result<CredentialLease, Instant> {
        let now = self.clock.now();
        let mut creds = self.lock();
        for cred in creds.iter_mut() {
            cred.refresh(now);
        }

        let chosen = creds
            .iter_mut()
            .filter(|c| c.is_eligible())
            .min_by_key(|c| c.request_count);

        if let Some(cred) = chosen {
            let earliest = cred
                .last_used_at
                .map(|t| t + self.config.min_spacing)
                .unwrap_or(now)
                .max(now);
            let dispatch_at = match pacer {
                Some(pacer) => pacer.reserve_from(earliest),
                None => earliest,
            };
            cred.request_count += 1;
            cred.last_used_at = Some(dispatch_at);
            return Ok(CredentialLease {
                id: cred.id.clone(),
                secret: cred.secret.clone(),
                dispatch_at,
            });
        }

        // Every credential has at least one open window here, so there is
        // always a finite instant to wait for.
        let soonest = creds
            .iter()
            .filter_map(Credential::reopens_at)
            .min()
            .unwrap_or(now);
        Err(soonest)
    }

    pub fn record_success(&self, id: &str) {
        let now = self.clock.now();
        let mut creds = self.lock();
        if let Some(cred) = creds.iter_mut().find(|c| c.id == id) {
            if cred.state == CredentialState::Degraded || cred.probation_until.is_some() {
                info!(credential = %cred.id, "degraded credential recovered");
            }
            cred.consecutive_errors = 0;
            cred.probation_until = None;
            cred.last_success_at = Some(now);
            cred.refresh(now);
        }
    }

    pub fn record_failure(&self, id: &str, class: ErrorClass) {
        let now = self.clock.now();
        let mut creds = self.lock();
        let Some(cred) = creds.iter_mut().find(|c| c.id == id) else {
            return;
        };
        cred.error_count += 1;
        cred.consecutive_errors = cred.consecutive_errors.saturating_add(1);

        match class {
            ErrorClass::RateLimited => {
                cred.cooldown_until = Some(now + self.config.cooldown);
                warn!(credential = %cred.id, cooldown = ?self.config.cooldown, "credential rate limited; cooling down");
            }
            ErrorClass::InvalidCredential => {
                cred.quarantine_until = Some(now + self.config.quarantine);
                warn!(credential = %cred.id, quarantine = ?self.config.quarantine, "credential rejected; quarantined");
            }
            ErrorClass::ServerError | ErrorClass::NetworkError | ErrorClass::Other => {
                if cred.consecutive_errors >= self.config.degraded_threshold {
                    cred.probation_until = Some(now + self.config.degraded_probation);
                    warn!(
                        credential = %cred.id,
                        consecutive_errors = cred.consecutive_errors,
                        probation = ?self.config.degraded_probation,
                        "credential degraded"
                    );
                }
            }
        }
        cred.refresh(now);
    }

    pub fn snapshot(&self) -> Vec<CredentialSnapshot> {
        let now = self.clock.now();
        let mut creds = self.lock();
        creds
            .iter_mut()
            .map(|c| {
                c.refresh(now);
                c.snapshot(now)
            })
            .collect()
    }
}

/// Split a comma/newline separated secret list, dropping blanks.
pub fn parse_secrets(raw: &str) -> Vec<String> {
    raw.split([',', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
