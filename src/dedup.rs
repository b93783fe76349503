//! Request coalescing: one in-flight operation per fingerprint.
//!
//! The first caller for a fingerprint spawns the operation; everyone arriving
//! before it settles gets a clone of the same shared handle. The operation
//! runs on its own task, so dropping any (or every) waiter does not cancel
//! it. It removes its own registry entry as it settles, win or lose, so the
//! next independent request starts fresh.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::debug;

use crate::cache::Fingerprint;
use crate::gateway::GatewayError;

/// Cloneable handle to a pending result.
pub type SharedResult<T> = Shared<BoxFuture<'static, Result<T, GatewayError>>>;

/// Whether `get_or_attach` started the operation or joined an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attach {
    Started,
    Joined,
}

struct InFlight<T: Clone> {
    generation: u64,
    pending: SharedResult<T>,
}

pub struct DedupRegistry<T: Clone> {
    inflight: Mutex<HashMap<Fingerprint, InFlight<T>>>,
    next_generation: AtomicU64,
}

impl<T: Clone> fmt::Debug for DedupRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DedupRegistry")
            .field("in_flight", &self.len())
            .finish()
    }
}

impl<T: Clone> Default for DedupRegistry<T> {
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
        }
    }
}

impl<T: Clone> DedupRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Fingerprint, InFlight<T>>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of operations currently in flight.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, key: &Fingerprint) -> bool {
        self.lock().contains_key(key)
    }
}

impl<T> DedupRegistry<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Join the pending operation for `key`, or start one with `factory`.
    ///
    /// `factory` is only invoked when nothing is in flight for `key`. Must be
    /// called from within a tokio runtime.
    pub fn get_or_attach<F, Fut>(self: &Arc<Self>, key: Fingerprint, factory: F) -> (SharedResult<T>, Attach)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>> + Send + 'static,
    {
        let mut inflight = self.lock();
        if let Some(existing) = inflight.get(&key) {
            debug!(fingerprint = %key.short(), "joining in-flight request");
            return (existing.pending.clone(), Attach::Joined);
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let operation = factory();
        let registry = Arc::clone(self);
        let handle = tokio::spawn(async move {
            // Dropped on completion and on panic alike.
            let _settled = SettleGuard {
                registry,
                key,
                generation,
            };
            operation.await
        });

        let pending: SharedResult<T> = async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(join_err) => Err(GatewayError::Aborted(join_err.to_string())),
            }
        }
        .boxed()
        .shared();

        inflight.insert(
            key,
            InFlight {
                generation,
                pending: pending.clone(),
            },
        );
        (pending, Attach::Started)
    }

    fn remove(&self, key: &Fingerprint, generation: u64) {
        let mut inflight = self.lock();
        if inflight
            .get(key)
            .is_some_and(|entry| entry.generation == generation)
        {
            inflight.remove(key);
        }
    }
}

/// Removes the registry entry when the operation finishes or unwinds.
struct SettleGuard<T>
where
    T: Clone + Send + Sync + 'static,
{
    registry: Arc<DedupRegistry<T>>,
    key: Fingerprint,
    generation: u64,
}

impl<T> Drop for SettleGuard<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.registry.remove(&self.key, self.generation);
    }
}
