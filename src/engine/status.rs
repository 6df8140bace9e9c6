//! Status write-back with optimistic concurrency.
//!
//! A change is expressed as an intent ([`StatusChange`]) rather than a full
//! status, so it can be re-applied to whatever the store holds after a
//! version conflict. If the intent is already satisfied, nothing is written.

use std::sync::Arc;

use opentelemetry::KeyValue;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::*;
use crate::storage::RequestClient;
use crate::telemetry::metrics;

/// Intended change to a request's status.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusChange {
    /// Point the request at `unit` and set its `Succeeded` condition.
    Adopt { unit: UnitRef, condition: Condition },
    /// Set the `Succeeded` condition only.
    Condition(Condition),
}

impl StatusChange {
    /// The status that results from applying this change to `current`, or
    /// `None` if `current` already reflects it.
    ///
    /// A terminal condition is never replaced by an `Unknown` one.
    pub fn apply_to(&self, current: &RequestStatus, generation: u64) -> Option<RequestStatus> {
        let mut next = current.clone();
        let mut changed = false;

        let condition = match self {
            StatusChange::Adopt { unit, condition } => {
                if next.unit.as_ref() != Some(unit) {
                    next.unit = Some(unit.clone());
                    changed = true;
                }
                condition
            }
            StatusChange::Condition(condition) => condition,
        };

        let downgrade = condition.status == ConditionStatus::Unknown
            && next
                .condition(condition.kind)
                .is_some_and(|c| c.status != ConditionStatus::Unknown);
        if !downgrade {
            changed |= next.set_condition(condition.clone());
        }

        if changed && next.observed_generation != generation {
            next.observed_generation = generation;
        }

        changed.then_some(next)
    }
}

/// Persists [`StatusChange`]s onto work requests.
#[derive(Clone)]
pub struct StatusUpdater {
    requests: Arc<dyn RequestClient>,
    max_attempts: u32,
}

impl StatusUpdater {
    pub fn new(requests: Arc<dyn RequestClient>, max_attempts: u32) -> Self {
        Self {
            requests,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Apply `change` to `request`, retrying on version conflicts.
    ///
    /// Returns the written request, or `None` when no write was needed.
    /// Conflicts that outlast `max_attempts` come back as
    /// [`Error::VersionConflict`] so the whole reconcile is retried.
    pub async fn apply(
        &self,
        request: &WorkRequest,
        change: &StatusChange,
    ) -> Result<Option<WorkRequest>> {
        let mut current = request.clone();
        for attempt in 1..=self.max_attempts {
            let Some(status) = change.apply_to(&current.status, current.generation) else {
                return Ok(None);
            };
            match self
                .requests
                .update_request_status(&current.key, current.version, status)
                .await
            {
                Ok(updated) => return Ok(Some(updated)),
                Err(Error::VersionConflict { .. }) => {
                    metrics::status_conflicts().add(1, &[KeyValue::new("attempt", attempt as i64)]);
                    debug!(key = %current.key, version = %current.version, attempt, "status conflict, re-reading");
                    let fresh = self.requests.get_request(&current.key).await?;
                    if fresh.uid != request.uid {
                        // Same name, different object: ours is gone.
                        return Err(Error::NotFound(format!(
                            "work request {} ({})",
                            request.key, request.uid
                        )));
                    }
                    current = fresh;
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::VersionConflict {
            key: current.key,
            expected: current.version,
        })
    }
}
