//! Injectable time source.
//!
//! Everything in the gateway that reads the current time or waits goes through
//! a [`Clock`]: credential cooldowns, pacing slots, retry backoff and cache
//! expiry. Production code uses [`TokioClock`]; tests use [`ManualClock`] so
//! that a 180s cooldown costs nothing to wait out.

use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;

#[async_trait]
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current instant.
    fn now(&self) -> Instant;

    /// Suspend until `deadline`. Returns immediately if it already passed.
    async fn sleep_until(&self, deadline: Instant);

    async fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        let deadline = self.now() + duration;
        self.sleep_until(deadline).await;
    }
}

/// Wall clock backed by `tokio::time`, so paused test runtimes are honoured.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    async fn sleep_until(&self, deadline: Instant) {
        tokio::time::sleep_until(deadline.into()).await;
    }
}

/// Virtual clock for tests.
///
/// Time only moves when someone sleeps or calls [`ManualClock::advance`].
/// `sleep_until` jumps the clock forward to the deadline (never backwards) and
/// yields once, so concurrent sleepers interleave without real waiting.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Move time forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(PoisonError::into_inner);
        *offset += by;
    }

    /// Time elapsed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The instant this clock started at.
    pub fn origin(&self) -> Instant {
        self.origin
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    async fn sleep_until(&self, deadline: Instant) {
        {
            let mut offset = self.offset.lock().unwrap_or_else(PoisonError::into_inner);
            let target = deadline.saturating_duration_since(self.origin);
            if target > *offset {
                *offset = target;
            }
        }
        tokio::task::yield_now().await;
    }
}
