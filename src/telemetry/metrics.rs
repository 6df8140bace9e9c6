//! Metric instrument factories for taskrun-rs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"taskrun-rs"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("taskrun-rs")
}

/// Counter: finished reconciles.
/// Labels: `result` (an outcome label, "retry" or "error").
pub fn reconciles() -> Counter<u64> {
    meter()
        .u64_counter("taskrun.reconcile.total")
        .with_description("Number of reconciles by result")
        .build()
}

/// Histogram: reconcile duration in milliseconds.
pub fn reconcile_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("taskrun.reconcile.duration_ms")
        .with_description("Reconcile duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: execution units created.
/// Labels: `namespace`.
pub fn units_created() -> Counter<u64> {
    meter()
        .u64_counter("taskrun.units.created")
        .with_description("Execution units created by the controller")
        .build()
}

/// Counter: requests found owning more than one unit.
/// Labels: `namespace`.
pub fn integrity_faults() -> Counter<u64> {
    meter()
        .u64_counter("taskrun.integrity_faults")
        .with_description("Requests observed with more than one execution unit")
        .build()
}

/// Counter: status writes rejected for a stale version.
/// Labels: `attempt`.
pub fn status_conflicts() -> Counter<u64> {
    meter()
        .u64_counter("taskrun.status.conflicts")
        .with_description("Status updates that hit a version conflict")
        .build()
}

/// Counter: keys re-added with backoff after a transient failure.
pub fn requeues() -> Counter<u64> {
    meter()
        .u64_counter("taskrun.queue.requeues")
        .with_description("Keys requeued with backoff")
        .build()
}

/// Counter: keys that hit the retry ceiling.
pub fn keys_dropped() -> Counter<u64> {
    meter()
        .u64_counter("taskrun.queue.dropped")
        .with_description("Keys dropped after exhausting retries")
        .build()
}
