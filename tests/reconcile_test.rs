mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use common::{CountingRequests, CountingUnits, new_request, resync, synced_cache};
use taskrun_rs::cache::WatchCache;
use taskrun_rs::engine::{ReconcileOutcome, Reconciler, StatusUpdater};
use taskrun_rs::model::*;
use taskrun_rs::storage::memory::MemoryStore;
use taskrun_rs::storage::{ObjectStore, RequestClient, UnitClient, WatchSource};

struct Harness {
    store: Arc<MemoryStore>,
    units: Arc<CountingUnits>,
    requests: Arc<CountingRequests>,
    cache: Arc<WatchCache>,
    reconciler: Arc<Reconciler>,
}

async fn harness() -> Harness {
    harness_with(|units| units).await
}

async fn harness_with(configure: impl FnOnce(CountingUnits) -> CountingUnits) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let units = Arc::new(configure(CountingUnits::new(store.clone())));
    let requests = Arc::new(CountingRequests::new(store.clone()));
    let cache = synced_cache(&store).await;
    let reconciler = Arc::new(Reconciler::new(
        cache.clone(),
        units.clone(),
        StatusUpdater::new(requests.clone(), 5),
    ));
    Harness {
        store,
        units,
        requests,
        cache,
        reconciler,
    }
}

impl Harness {
    async fn submit(&self, new: NewWorkRequest) -> WorkRequest {
        let request = self.store.create_request(new).await.unwrap();
        self.refresh().await;
        request
    }

    /// Bring the cache up to date, as the informer eventually would.
    async fn refresh(&self) {
        resync(&self.cache, &self.store).await;
    }

    async fn owned(&self, request: &WorkRequest) -> Vec<ExecutionUnit> {
        self.store
            .list_owned_units(&OwnerRef::of(request))
            .await
            .unwrap()
    }

    async fn current(&self, request: &WorkRequest) -> WorkRequest {
        self.store.get_request(&request.key).await.unwrap()
    }
}

#[tokio::test]
async fn first_reconcile_creates_and_records_one_unit() {
    let h = harness().await;
    let request = h.submit(new_request("a")).await;

    let outcome = h.reconciler.reconcile(&request.key).await.unwrap();
    let expected = unit_name(&request);
    assert_eq!(
        outcome,
        ReconcileOutcome::Created {
            unit: expected.clone()
        }
    );

    let owned = h.owned(&request).await;
    assert_eq!(owned.len(), 1);
    assert_eq!(owned[0].key.name, expected);
    assert_eq!(
        owned[0].labels.get(OWNER_LABEL).map(String::as_str),
        Some("a")
    );

    let current = h.current(&request).await;
    assert_eq!(current.status.unit, Some(owned[0].unit_ref()));
    let cond = current.succeeded().unwrap();
    assert_eq!(cond.status, ConditionStatus::Unknown);
    assert_eq!(cond.reason, reason::PENDING);
}

#[tokio::test]
async fn reconciling_a_satisfied_request_changes_nothing() {
    let h = harness().await;
    let request = h.submit(new_request("a")).await;
    h.reconciler.reconcile(&request.key).await.unwrap();
    h.refresh().await;

    let creates = h.units.create_calls.load(Ordering::SeqCst);
    let writes = h.requests.writes();
    for _ in 0..3 {
        let outcome = h.reconciler.reconcile(&request.key).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::InSync { .. }));
    }
    assert_eq!(h.units.create_calls.load(Ordering::SeqCst), creates);
    assert_eq!(h.requests.writes(), writes);
    assert_eq!(h.owned(&request).await.len(), 1);
}

#[tokio::test]
async fn stale_cache_still_never_creates_twice() {
    let h = harness().await;
    let request = h.submit(new_request("a")).await;
    h.reconciler.reconcile(&request.key).await.unwrap();

    // The cache still holds the request without its unit.
    let outcome = h.reconciler.reconcile(&request.key).await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::InSync { .. }));
    assert_eq!(h.units.creates(), 1);
    assert_eq!(h.owned(&request).await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reconciles_converge_on_one_unit() {
    const RACERS: usize = 8;
    let h = harness_with(|units| units.with_barrier(RACERS)).await;
    let request = h.submit(new_request("a")).await;

    let mut racers = Vec::new();
    for _ in 0..RACERS {
        let reconciler = h.reconciler.clone();
        let key = request.key.clone();
        racers.push(tokio::spawn(async move { reconciler.reconcile(&key).await }));
    }
    let mut outcomes = Vec::new();
    for racer in racers {
        outcomes.push(racer.await.unwrap().unwrap());
    }

    let created = outcomes
        .iter()
        .filter(|o| matches!(o, ReconcileOutcome::Created { .. }))
        .count();
    assert_eq!(created, 1);
    assert_eq!(h.units.creates(), 1);
    assert_eq!(h.units.already_exists.load(Ordering::SeqCst), RACERS - 1);

    let names: HashSet<_> = outcomes.iter().filter_map(|o| o.unit()).collect();
    assert_eq!(names.len(), 1, "racers adopted different units: {names:?}");

    let owned = h.owned(&request).await;
    assert_eq!(owned.len(), 1);
    assert_eq!(
        h.current(&request).await.status.unit,
        Some(owned[0].unit_ref())
    );
}

#[tokio::test]
async fn unit_created_before_a_crash_is_adopted() {
    let h = harness().await;
    let request = h.submit(new_request("a")).await;
    // Create went through, the status write never happened.
    let orphan = h
        .store
        .create_unit(NewUnit::for_request(&request))
        .await
        .unwrap();
    h.refresh().await;

    let outcome = h.reconciler.reconcile(&request.key).await.unwrap();
    assert_eq!(
        outcome,
        ReconcileOutcome::Adopted {
            unit: orphan.key.name.clone()
        }
    );
    assert_eq!(h.units.create_calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        h.current(&request).await.status.unit,
        Some(orphan.unit_ref())
    );
}

#[tokio::test]
async fn extra_units_are_reported_and_the_earliest_adopted() {
    let h = harness().await;
    let request = h.submit(new_request("a")).await;
    for name in ["a-first", "a-second"] {
        let mut unit = NewUnit::for_request(&request);
        unit.key.name = name.to_string();
        h.store.create_unit(unit).await.unwrap();
    }
    h.refresh().await;

    let outcome = h.reconciler.reconcile(&request.key).await.unwrap();
    assert_eq!(
        outcome,
        ReconcileOutcome::Adopted {
            unit: "a-first".to_string()
        }
    );
    assert_eq!(h.units.create_calls.load(Ordering::SeqCst), 0);
    // Reported, not remediated.
    assert_eq!(h.owned(&request).await.len(), 2);
}

#[tokio::test]
async fn invalid_spec_is_rejected_once() {
    let h = harness().await;
    let request = h.submit(NewWorkRequest::new("default", "empty")).await;

    let outcome = h.reconciler.reconcile(&request.key).await.unwrap();
    assert_eq!(
        outcome,
        ReconcileOutcome::Rejected {
            reason: reason::INVALID_SPEC.to_string()
        }
    );
    assert_eq!(h.units.create_calls.load(Ordering::SeqCst), 0);
    let cond = h.current(&request).await.succeeded().cloned().unwrap();
    assert_eq!(cond.status, ConditionStatus::False);
    assert_eq!(cond.reason, reason::INVALID_SPEC);

    h.refresh().await;
    let writes = h.requests.writes();
    assert_eq!(
        h.reconciler.reconcile(&request.key).await.unwrap(),
        ReconcileOutcome::Finished
    );
    assert_eq!(h.requests.writes(), writes);
}

#[tokio::test]
async fn fatal_create_failure_is_terminal() {
    let h = harness_with(|units| units.rejecting()).await;
    let request = h.submit(new_request("a")).await;

    let outcome = h.reconciler.reconcile(&request.key).await.unwrap();
    assert_eq!(
        outcome,
        ReconcileOutcome::Rejected {
            reason: reason::CREATE_UNIT_FAILED.to_string()
        }
    );
    let cond = h.current(&request).await.succeeded().cloned().unwrap();
    assert_eq!(cond.status, ConditionStatus::False);
    assert_eq!(cond.reason, reason::CREATE_UNIT_FAILED);
    assert!(h.owned(&request).await.is_empty());

    h.refresh().await;
    let calls = h.units.create_calls.load(Ordering::SeqCst);
    assert_eq!(
        h.reconciler.reconcile(&request.key).await.unwrap(),
        ReconcileOutcome::Finished
    );
    assert_eq!(h.units.create_calls.load(Ordering::SeqCst), calls);
}

#[tokio::test]
async fn transient_create_failure_propagates_without_side_effects() {
    let h = harness_with(|units| units.failing(1)).await;
    let request = h.submit(new_request("a")).await;

    let err = h.reconciler.reconcile(&request.key).await.unwrap_err();
    assert!(err.is_transient());
    assert!(h.owned(&request).await.is_empty());
    assert_eq!(h.requests.writes(), 0);

    let outcome = h.reconciler.reconcile(&request.key).await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Created { .. }));
    assert_eq!(h.owned(&request).await.len(), 1);
}

#[tokio::test]
async fn unit_phase_is_mirrored_onto_the_request() {
    let h = harness().await;
    let request = h.submit(new_request("a")).await;
    h.reconciler.reconcile(&request.key).await.unwrap();
    let unit = h.owned(&request).await.remove(0);

    h.store
        .set_unit_phase(&unit.key, UnitPhase::Running)
        .await
        .unwrap();
    h.store
        .set_unit_phase(&unit.key, UnitPhase::Succeeded)
        .await
        .unwrap();
    h.refresh().await;
    h.reconciler.reconcile(&request.key).await.unwrap();

    let current = h.current(&request).await;
    assert!(current.is_done());
    assert_eq!(current.succeeded().unwrap().status, ConditionStatus::True);

    h.refresh().await;
    assert_eq!(
        h.reconciler.reconcile(&request.key).await.unwrap(),
        ReconcileOutcome::Finished
    );
}

#[tokio::test]
async fn deleted_request_is_a_noop() {
    let h = harness().await;
    let request = h.submit(new_request("a")).await;
    h.store.delete_request(&request.key).await.unwrap();
    h.refresh().await;

    assert_eq!(
        h.reconciler.reconcile(&request.key).await.unwrap(),
        ReconcileOutcome::Deleted
    );
    assert_eq!(h.units.create_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn request_deleted_after_cache_read_is_a_noop() {
    let h = harness().await;
    let request = h.submit(new_request("a")).await;
    // Cache still has it; the store does not.
    h.store.delete_request(&request.key).await.unwrap();

    assert_eq!(
        h.reconciler.reconcile(&request.key).await.unwrap(),
        ReconcileOutcome::Deleted
    );
    assert!(h.store.list_units().await.unwrap().is_empty());
}
