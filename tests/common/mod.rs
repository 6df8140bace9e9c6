//! Shared test helpers: object builders and fault-injecting client wrappers.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use taskrun_rs::cache::WatchCache;
use taskrun_rs::error::{Error, Result};
use taskrun_rs::model::*;
use taskrun_rs::storage::memory::MemoryStore;
use taskrun_rs::storage::{RequestClient, UnitClient, WatchSource};
use tokio::sync::Barrier;
use uuid::Uuid;

pub fn step() -> Step {
    Step::new("main", "busybox").command(["true"])
}

pub fn new_request(name: &str) -> NewWorkRequest {
    NewWorkRequest::new("default", name).step(step())
}

/// A request object built by hand, for feeding the cache directly.
pub fn request_at(name: &str, version: u64) -> WorkRequest {
    WorkRequest {
        key: ObjectKey::new("default", name),
        uid: Uuid::nil(),
        generation: 1,
        version: ResourceVersion(version),
        created_at: Utc::now(),
        spec: RequestSpec { steps: vec![step()] },
        status: RequestStatus::default(),
    }
}

/// A unit object built by hand, owned by `owner`.
pub fn unit_at(owner: &WorkRequest, name: &str, version: u64) -> ExecutionUnit {
    ExecutionUnit {
        key: ObjectKey::new(&owner.key.namespace, name),
        uid: Uuid::new_v4(),
        version: ResourceVersion(version),
        created_at: Utc::now(),
        owner: OwnerRef::of(owner),
        labels: Default::default(),
        spec: UnitSpec::default(),
        phase: UnitPhase::Pending,
    }
}

/// A cache synced with the store's current contents.
pub async fn synced_cache(store: &MemoryStore) -> Arc<WatchCache> {
    let cache = Arc::new(WatchCache::new());
    resync(&cache, store).await;
    cache
}

pub async fn resync(cache: &WatchCache, store: &MemoryStore) {
    let listed_at = store.current_version().await.unwrap();
    let requests = store.list_requests().await.unwrap();
    let units = store.list_units().await.unwrap();
    cache.replace(requests, units, listed_at);
}

/// Unit client that counts calls and can fail or stall creates.
pub struct CountingUnits {
    inner: Arc<MemoryStore>,
    pub create_calls: AtomicUsize,
    pub created: AtomicUsize,
    pub already_exists: AtomicUsize,
    pub list_calls: AtomicUsize,
    /// Creates still to fail with a transient error.
    pub fail_creates: AtomicU32,
    /// Reject every create as invalid.
    pub reject_creates: AtomicBool,
    /// When each create was attempted.
    pub create_times: Mutex<Vec<Instant>>,
    /// Every create waits here first, so racers all pass the list step.
    barrier: Option<Arc<Barrier>>,
}

impl CountingUnits {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            create_calls: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
            already_exists: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
            fail_creates: AtomicU32::new(0),
            reject_creates: AtomicBool::new(false),
            create_times: Mutex::new(Vec::new()),
            barrier: None,
        }
    }

    pub fn with_barrier(mut self, parties: usize) -> Self {
        self.barrier = Some(Arc::new(Barrier::new(parties)));
        self
    }

    pub fn failing(self, creates: u32) -> Self {
        self.fail_creates.store(creates, Ordering::SeqCst);
        self
    }

    pub fn rejecting(self) -> Self {
        self.reject_creates.store(true, Ordering::SeqCst);
        self
    }

    pub fn creates(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UnitClient for CountingUnits {
    async fn create_unit(&self, unit: NewUnit) -> Result<ExecutionUnit> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.create_times.lock().unwrap().push(Instant::now());
        if let Some(barrier) = &self.barrier {
            barrier.wait().await;
        }
        let fail = self
            .fail_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(Error::Transient("injected create failure".to_string()));
        }
        if self.reject_creates.load(Ordering::SeqCst) {
            return Err(Error::Invalid("unit rejected by store".to_string()));
        }
        match self.inner.create_unit(unit).await {
            Ok(unit) => {
                self.created.fetch_add(1, Ordering::SeqCst);
                Ok(unit)
            }
            Err(e @ Error::AlreadyExists(_)) => {
                self.already_exists.fetch_add(1, Ordering::SeqCst);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn list_owned_units(&self, owner: &OwnerRef) -> Result<Vec<ExecutionUnit>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.list_owned_units(owner).await
    }

    async fn delete_unit(&self, key: &ObjectKey) -> Result<()> {
        self.inner.delete_unit(key).await
    }
}

/// Request client that counts status writes and can inject conflicts.
pub struct CountingRequests {
    inner: Arc<MemoryStore>,
    pub status_writes: AtomicUsize,
    pub conflicts: AtomicUsize,
    /// Status writes still to reject with a version conflict.
    pub inject_conflicts: AtomicU32,
}

impl CountingRequests {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            status_writes: AtomicUsize::new(0),
            conflicts: AtomicUsize::new(0),
            inject_conflicts: AtomicU32::new(0),
        }
    }

    pub fn conflicting(self, writes: u32) -> Self {
        self.inject_conflicts.store(writes, Ordering::SeqCst);
        self
    }

    pub fn writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RequestClient for CountingRequests {
    async fn get_request(&self, key: &ObjectKey) -> Result<WorkRequest> {
        self.inner.get_request(key).await
    }

    async fn update_request_status(
        &self,
        key: &ObjectKey,
        expected: ResourceVersion,
        status: RequestStatus,
    ) -> Result<WorkRequest> {
        let inject = self
            .inject_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if inject {
            self.conflicts.fetch_add(1, Ordering::SeqCst);
            return Err(Error::VersionConflict {
                key: key.clone(),
                expected,
            });
        }
        match self.inner.update_request_status(key, expected, status).await {
            Ok(request) => {
                self.status_writes.fetch_add(1, Ordering::SeqCst);
                Ok(request)
            }
            Err(e @ Error::VersionConflict { .. }) => {
                self.conflicts.fetch_add(1, Ordering::SeqCst);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}
