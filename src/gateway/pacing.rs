//! Global dispatch spacing across all credentials.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::clock::Clock;

/// Keeps successive dispatches at least `spacing` apart.
///
/// A slot is claimed for the instant a request will actually be sent, so the
/// claim has to happen after every other wait (cooldowns, per-credential
/// spacing) is known. [`CredentialPool::select_paced`] does that inside its
/// selection lock.
///
/// [`CredentialPool::select_paced`]: super::CredentialPool::select_paced
#[derive(Debug)]
pub struct Pacer {
    spacing: Duration,
    last_slot: Mutex<Option<Instant>>,
    clock: Arc<dyn Clock>,
}

impl Pacer {
    pub fn new(spacing: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            spacing,
            last_slot: Mutex::new(None),
            clock,
        }
    }

    pub fn spacing(&self) -> Duration {
        self.spacing
    }

    /// Claim the next free slot, starting from now.
    pub fn reserve(&self) -> Instant {
        self.reserve_from(self.clock.now())
    }

    /// Claim the first free slot at or after `earliest`.
    ///
    /// Slots are handed out in claim order, each at least `spacing` after the
    /// previous one.
    pub fn reserve_from(&self, earliest: Instant) -> Instant {
        let earliest = earliest.max(self.clock.now());
        let mut last = self.last_slot.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = match *last {
            Some(prev) => (prev + self.spacing).max(earliest),
            None => earliest,
        };
        *last = Some(slot);
        slot
    }
}
