//! Deduplicating, per-key-serialized reconcile queue.
//!
//! Contract:
//! - adding a key that is already queued is a no-op;
//! - a key handed to a worker is never handed to another worker until the
//!   first calls [`ReconcileQueue::done`]; adds that arrive meanwhile mark the
//!   key dirty and it is re-queued on `done`;
//! - failures re-add the key after an exponential delay until the retry
//!   ceiling, and [`ReconcileQueue::forget`] resets that state on success.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::debug;

use crate::model::ObjectKey;

/// Exponential backoff with a cap and a retry ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    #[serde(with = "millis")]
    pub base: Duration,
    /// Upper bound for any single delay.
    #[serde(with = "millis")]
    pub max: Duration,
    /// Retries allowed before a key is dropped until its next event.
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(5),
            max: Duration::from_secs(60),
            max_retries: 10,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-indexed): `base * 2^attempt`, capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base.saturating_mul(factor).min(self.max)
    }
}

pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[derive(Default)]
struct QueueState {
    /// Keys waiting for a worker, in arrival order.
    queue: VecDeque<ObjectKey>,
    /// Keys that need processing: everything in `queue`, plus keys that were
    /// re-added while a worker held them.
    dirty: HashSet<ObjectKey>,
    /// Keys currently held by a worker.
    processing: HashSet<ObjectKey>,
    /// Consecutive failures per key.
    failures: HashMap<ObjectKey, u32>,
    shutting_down: bool,
}

/// The reconcile queue shared by the informer and all workers.
pub struct ReconcileQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    policy: BackoffPolicy,
}

impl ReconcileQueue {
    pub fn new(policy: BackoffPolicy) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            policy,
        })
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Mark `key` as needing reconciliation.
    pub fn add(&self, key: ObjectKey) {
        let mut state = self.state();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            // Picked up again by `done`.
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    /// Add `key` once `delay` has elapsed.
    pub fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Schedule a retry for a failed key.
    ///
    /// Returns the delay used, or `None` when the retry ceiling is reached; the
    /// key's failure count is then cleared and it waits for its next event.
    pub fn add_rate_limited(self: &Arc<Self>, key: ObjectKey) -> Option<Duration> {
        let attempt = {
            let mut state = self.state();
            let failures = state.failures.entry(key.clone()).or_insert(0);
            if *failures >= self.policy.max_retries {
                state.failures.remove(&key);
                return None;
            }
            *failures += 1;
            *failures - 1
        };
        let delay = self.policy.delay(attempt);
        debug!(%key, attempt, delay_ms = delay.as_millis() as u64, "requeue with backoff");
        self.add_after(key, delay);
        Some(delay)
    }

    /// Clear backoff state after a successful reconcile.
    pub fn forget(&self, key: &ObjectKey) {
        self.state().failures.remove(key);
    }

    /// Consecutive failures recorded for `key`.
    pub fn num_requeues(&self, key: &ObjectKey) -> u32 {
        self.state().failures.get(key).copied().unwrap_or(0)
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    ///
    /// The caller owns the key until it calls [`ReconcileQueue::done`].
    pub async fn get(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before looking at the state so a concurrent
            // add or shutdown cannot slip between check and wait.
            notified.as_mut().enable();
            {
                let mut state = self.state();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Release a key taken with [`ReconcileQueue::get`].
    pub fn done(&self, key: &ObjectKey) {
        let mut state = self.state();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Keys waiting for a worker.
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys currently held by workers.
    pub fn in_flight(&self) -> usize {
        self.state().processing.len()
    }

    /// Stop handing out keys and wake every waiting worker.
    pub fn shutdown(&self) {
        self.state().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }
}
