//! Reconcile span helpers.

use tracing::Span;

use crate::engine::ReconcileOutcome;
use crate::model::ObjectKey;

/// Start a span for one reconcile of `key`.
///
/// `reconcile.outcome` and `reconcile.unit` are declared empty and filled in
/// by [`record_outcome`].
pub fn start_reconcile_span(key: &ObjectKey, worker: usize) -> Span {
    tracing::info_span!(
        "reconcile",
        "reconcile.key" = %key,
        "reconcile.worker" = worker,
        "reconcile.outcome" = tracing::field::Empty,
        "reconcile.unit" = tracing::field::Empty,
    )
}

/// Record how a reconcile ended on its span.
pub fn record_outcome(span: &Span, outcome: &ReconcileOutcome) {
    span.record("reconcile.outcome", outcome.label());
    if let Some(unit) = outcome.unit() {
        span.record("reconcile.unit", unit);
    }
}
