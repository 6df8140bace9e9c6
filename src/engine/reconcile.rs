//! The reconcile decision procedure.
//!
//! For one request key: find the request's execution unit, adopt it if it
//! exists, otherwise create exactly one. The store offers only atomic
//! create-by-name, so "create if absent" is built from three steps that are
//! each safe to repeat and to race:
//!
//! 1. list units by owner relation, never trusting the cache for absence;
//! 2. create under a name derived from the request, so racing creators
//!    collide instead of each succeeding;
//! 3. on `AlreadyExists`, list again and adopt whatever won.
//!
//! Every racer ends on the same unit, and no path creates a second one for
//! a request that already has one.

use std::sync::Arc;

use opentelemetry::KeyValue;
use tracing::{debug, info, warn};

use super::status::{StatusChange, StatusUpdater};
use crate::cache::WatchCache;
use crate::error::{Error, Result};
use crate::model::*;
use crate::storage::UnitClient;
use crate::telemetry::metrics;

/// What a reconcile did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The request no longer exists.
    Deleted,
    /// The request already reached a terminal condition.
    Finished,
    /// The request already pointed at its live unit.
    InSync { unit: String },
    /// An existing unit was found and recorded on the request.
    Adopted { unit: String },
    /// This reconcile created the unit.
    Created { unit: String },
    /// The request can never run; a terminal condition was recorded.
    Rejected { reason: String },
}

impl ReconcileOutcome {
    /// Short label for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            ReconcileOutcome::Deleted => "deleted",
            ReconcileOutcome::Finished => "finished",
            ReconcileOutcome::InSync { .. } => "in_sync",
            ReconcileOutcome::Adopted { .. } => "adopted",
            ReconcileOutcome::Created { .. } => "created",
            ReconcileOutcome::Rejected { .. } => "rejected",
        }
    }

    pub fn unit(&self) -> Option<&str> {
        match self {
            ReconcileOutcome::InSync { unit }
            | ReconcileOutcome::Adopted { unit }
            | ReconcileOutcome::Created { unit } => Some(unit),
            _ => None,
        }
    }
}

/// Reconciles one request key at a time. Holds no per-key state; everything
/// that must survive between reconciles lives in the store.
pub struct Reconciler {
    cache: Arc<WatchCache>,
    units: Arc<dyn UnitClient>,
    status: StatusUpdater,
}

impl Reconciler {
    pub fn new(cache: Arc<WatchCache>, units: Arc<dyn UnitClient>, status: StatusUpdater) -> Self {
        Self {
            cache,
            units,
            status,
        }
    }

    pub async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileOutcome> {
        let Some(request) = self.cache.get_request(key)? else {
            debug!(%key, "request not in cache, nothing to do");
            return Ok(ReconcileOutcome::Deleted);
        };
        match self.reconcile_request(&request).await {
            Err(Error::NotFound(what)) => {
                debug!(%key, %what, "request deleted mid-reconcile");
                Ok(ReconcileOutcome::Deleted)
            }
            other => other,
        }
    }

    async fn reconcile_request(&self, request: &WorkRequest) -> Result<ReconcileOutcome> {
        if request.is_done() {
            return Ok(ReconcileOutcome::Finished);
        }
        let owner = OwnerRef::of(request);

        // Fast path: the status already names a unit the cache can see.
        if let Some(unit_ref) = &request.status.unit {
            let unit_key = ObjectKey::new(&request.key.namespace, &unit_ref.name);
            let live = self
                .cache
                .get_unit(&unit_key)?
                .filter(|u| u.uid == unit_ref.uid && u.is_owned_by(&owner));
            if let Some(unit) = live {
                self.record(request, &unit).await?;
                return Ok(ReconcileOutcome::InSync {
                    unit: unit.key.name,
                });
            }
        }

        let owned = self.units.list_owned_units(&owner).await?;
        if owned.is_empty() {
            return self.create(request, &owner).await;
        }
        self.adopt(request, &owned).await
    }

    /// Record the earliest of `owned` on the request.
    async fn adopt(
        &self,
        request: &WorkRequest,
        owned: &[ExecutionUnit],
    ) -> Result<ReconcileOutcome> {
        let Some(unit) = earliest(owned) else {
            return Err(Error::Transient(format!(
                "no unit visible for {} after create conflict",
                request.key
            )));
        };
        if owned.len() > 1 {
            let names: Vec<&str> = owned.iter().map(|u| u.key.name.as_str()).collect();
            warn!(
                key = %request.key,
                count = owned.len(),
                units = ?names,
                adopted = %unit.key.name,
                "integrity fault: request owns more than one unit, adopting the earliest"
            );
            metrics::integrity_faults().add(
                1,
                &[KeyValue::new("namespace", request.key.namespace.clone())],
            );
        }
        let name = unit.key.name.clone();
        if self.record(request, unit).await? {
            info!(key = %request.key, unit = %name, "adopted unit");
            Ok(ReconcileOutcome::Adopted { unit: name })
        } else {
            // The store already points at this unit.
            Ok(ReconcileOutcome::InSync { unit: name })
        }
    }

    async fn create(&self, request: &WorkRequest, owner: &OwnerRef) -> Result<ReconcileOutcome> {
        if let Err(e) = request.spec.validate() {
            return self.reject(request, reason::INVALID_SPEC, &e).await;
        }

        match self.units.create_unit(NewUnit::for_request(request)).await {
            Ok(unit) => {
                metrics::units_created().add(
                    1,
                    &[KeyValue::new("namespace", request.key.namespace.clone())],
                );
                info!(key = %request.key, unit = %unit.key.name, "created unit");
                self.record(request, &unit).await?;
                Ok(ReconcileOutcome::Created {
                    unit: unit.key.name,
                })
            }
            Err(Error::AlreadyExists(name)) => {
                debug!(key = %request.key, unit = %name, "lost create race, adopting winner");
                let owned = self.units.list_owned_units(owner).await?;
                if owned.is_empty() {
                    // The name is taken by something we do not own, or the
                    // winner is not visible yet. Retry later.
                    return Err(Error::NameConflict(name));
                }
                self.adopt(request, &owned).await
            }
            Err(e) if e.is_fatal() => self.reject(request, reason::CREATE_UNIT_FAILED, &e).await,
            Err(e) => Err(e),
        }
    }

    /// Write `unit` and its phase onto the request, if not already there.
    /// Returns whether anything was written.
    async fn record(&self, request: &WorkRequest, unit: &ExecutionUnit) -> Result<bool> {
        let (status, why) = unit.phase.condition();
        let change = StatusChange::Adopt {
            unit: unit.unit_ref(),
            condition: Condition::succeeded(
                status,
                why,
                format!("execution unit {} is {}", unit.key.name, unit.phase),
            ),
        };
        let written = self.status.apply(request, &change).await?.is_some();
        if written {
            debug!(key = %request.key, unit = %unit.key.name, phase = %unit.phase, "status updated");
        }
        Ok(written)
    }

    async fn reject(
        &self,
        request: &WorkRequest,
        why: &str,
        error: &Error,
    ) -> Result<ReconcileOutcome> {
        warn!(key = %request.key, reason = why, %error, "request rejected");
        let change = StatusChange::Condition(Condition::succeeded(
            ConditionStatus::False,
            why,
            error.to_string(),
        ));
        self.status.apply(request, &change).await?;
        Ok(ReconcileOutcome::Rejected {
            reason: why.to_string(),
        })
    }
}
