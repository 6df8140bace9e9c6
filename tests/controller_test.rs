mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{CountingUnits, new_request};
use taskrun_rs::agent::{AgentConfig, UnitAgent};
use taskrun_rs::engine::{ControlConfig, Controller};
use taskrun_rs::error::Result;
use taskrun_rs::model::*;
use taskrun_rs::queue::BackoffPolicy;
use taskrun_rs::storage::memory::MemoryStore;
use taskrun_rs::storage::{Clients, ObjectStore, UnitClient, WatchSource};
use taskrun_rs::wait::{wait_for_condition, wait_until_done};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

const TIMEOUT: Duration = Duration::from_secs(10);

fn config(workers: usize) -> ControlConfig {
    ControlConfig {
        workers,
        resync_period: Duration::ZERO,
        backoff: BackoffPolicy {
            base: Duration::from_millis(5),
            max: Duration::from_millis(200),
            max_retries: 10,
        },
        status_update_attempts: 5,
    }
}

struct Running {
    controller: Controller,
    handle: JoinHandle<Result<()>>,
    agent: Option<(watch::Sender<bool>, JoinHandle<Result<()>>)>,
}

impl Running {
    fn start(clients: Clients, config: ControlConfig) -> Self {
        let controller = Controller::new(clients, config);
        let handle = controller.spawn();
        Self {
            controller,
            handle,
            agent: None,
        }
    }

    fn with_agent(mut self, store: Arc<MemoryStore>, config: AgentConfig) -> Self {
        let (stop, shutdown) = watch::channel(false);
        let store: Arc<dyn ObjectStore> = store;
        let handle = tokio::spawn(UnitAgent::new(store, config).run(shutdown));
        self.agent = Some((stop, handle));
        self
    }

    async fn stop(self) {
        self.controller.shutdown();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("controller did not stop")
            .unwrap()
            .unwrap();
        if let Some((stop, handle)) = self.agent {
            stop.send_replace(true);
            handle.await.unwrap().unwrap();
        }
    }
}

fn agent_config() -> AgentConfig {
    AgentConfig {
        run_for: Duration::from_millis(10),
        fail_image: None,
    }
}

async fn has_unit(store: &MemoryStore, key: &ObjectKey) -> WorkRequest {
    wait_for_condition(store, key, TIMEOUT, |r| r.status.unit.is_some())
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_each_succeed_with_one_unit() {
    let store = Arc::new(MemoryStore::new());
    let running = Running::start(Clients::from_store(store.clone()), config(4))
        .with_agent(store.clone(), agent_config());

    let mut submits = JoinSet::new();
    for i in 0..25 {
        let store = store.clone();
        submits.spawn(async move {
            store
                .create_request(new_request(&format!("run-{i}")))
                .await
                .unwrap()
        });
    }
    let mut requests = Vec::new();
    while let Some(joined) = submits.join_next().await {
        requests.push(joined.unwrap());
    }

    for request in &requests {
        let done = wait_until_done(store.as_ref(), &request.key, TIMEOUT)
            .await
            .unwrap();
        let cond = done.succeeded().unwrap();
        assert_eq!(cond.status, ConditionStatus::True, "{}: {cond:?}", request.key);
        let owned = store
            .list_owned_units(&OwnerRef::of(request))
            .await
            .unwrap();
        assert_eq!(owned.len(), 1, "{} owns {} units", request.key, owned.len());
        assert_eq!(done.status.unit, Some(owned[0].unit_ref()));
    }
    assert_eq!(store.list_units().await.unwrap().len(), 25);

    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transient_create_failures_back_off_then_create_once() {
    const FAILURES: u32 = 3;
    let store = Arc::new(MemoryStore::new());
    // Submitted before the controller subscribes, so only the initial list
    // enqueues it and every retry comes from the backoff.
    let request = store.create_request(new_request("flaky")).await.unwrap();

    let units = Arc::new(CountingUnits::new(store.clone()).failing(FAILURES));
    let mut cfg = config(2);
    cfg.backoff.base = Duration::from_millis(20);
    let policy = cfg.backoff.clone();
    let running = Running::start(
        Clients::from_store(store.clone()).with_units(units.clone()),
        cfg,
    );

    has_unit(&store, &request.key).await;
    assert_eq!(units.creates(), 1);
    assert_eq!(
        units.create_calls.load(Ordering::SeqCst),
        FAILURES as usize + 1
    );
    assert_eq!(
        store
            .list_owned_units(&OwnerRef::of(&request))
            .await
            .unwrap()
            .len(),
        1
    );

    let times = units.create_times.lock().unwrap().clone();
    for (i, pair) in times.windows(2).enumerate() {
        let gap = pair[1] - pair[0];
        let want = policy.delay(i as u32);
        assert!(gap >= want, "retry {i} came after {gap:?}, want >= {want:?}");
    }
    assert_eq!(running.controller.queue().num_requeues(&request.key), 0);

    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deleting_a_request_removes_its_unit() {
    let store = Arc::new(MemoryStore::new());
    let running = Running::start(Clients::from_store(store.clone()), config(2));

    let request = store.create_request(new_request("doomed")).await.unwrap();
    has_unit(&store, &request.key).await;
    assert_eq!(store.list_units().await.unwrap().len(), 1);

    store.delete_request(&request.key).await.unwrap();
    assert!(store.list_units().await.unwrap().is_empty());

    tokio::time::timeout(TIMEOUT, async {
        while running.controller.cache().request_count() > 0
            || running.controller.cache().unit_count() > 0
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("cache never saw the delete");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(store.list_units().await.unwrap().is_empty(), "orphan recreated");

    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restarted_controller_adopts_existing_unit() {
    let store = Arc::new(MemoryStore::new());
    let request = store.create_request(new_request("crashed")).await.unwrap();
    let orphan = store
        .create_unit(NewUnit::for_request(&request))
        .await
        .unwrap();

    let units = Arc::new(CountingUnits::new(store.clone()));
    let running = Running::start(
        Clients::from_store(store.clone()).with_units(units.clone()),
        config(2),
    );

    let adopted = has_unit(&store, &request.key).await;
    assert_eq!(adopted.status.unit, Some(orphan.unit_ref()));
    assert_eq!(units.create_calls.load(Ordering::SeqCst), 0);

    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replayed_events_do_not_duplicate_units() {
    let store = Arc::new(MemoryStore::new());
    let running = Running::start(Clients::from_store(store.clone()), config(4))
        .with_agent(store.clone(), agent_config());

    let mut keys = Vec::new();
    for i in 0..5 {
        keys.push(
            store
                .create_request(new_request(&format!("replay-{i}")))
                .await
                .unwrap()
                .key,
        );
        store.replay();
    }
    store.announce_resync();
    store.replay();

    for key in &keys {
        wait_until_done(store.as_ref(), key, TIMEOUT).await.unwrap();
    }
    store.replay();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.list_units().await.unwrap().len(), keys.len());

    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lagging_change_stream_is_recovered_by_relist() {
    let store = Arc::new(MemoryStore::with_event_capacity(2));
    let running = Running::start(Clients::from_store(store.clone()), config(1));

    let mut keys = Vec::new();
    for i in 0..30 {
        keys.push(
            store
                .create_request(new_request(&format!("burst-{i}")))
                .await
                .unwrap()
                .key,
        );
    }
    for key in &keys {
        has_unit(&store, key).await;
    }
    assert_eq!(store.list_units().await.unwrap().len(), keys.len());

    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_unit_fails_the_request() {
    let store = Arc::new(MemoryStore::new());
    let running = Running::start(Clients::from_store(store.clone()), config(2)).with_agent(
        store.clone(),
        AgentConfig {
            fail_image: Some("broken".to_string()),
            ..agent_config()
        },
    );

    let request = store
        .create_request(NewWorkRequest::new("default", "bad").step(Step::new("main", "broken")))
        .await
        .unwrap();
    let done = wait_until_done(store.as_ref(), &request.key, TIMEOUT)
        .await
        .unwrap();
    let cond = done.succeeded().unwrap();
    assert_eq!(cond.status, ConditionStatus::False);
    assert_eq!(cond.reason, reason::FAILED);

    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_request_is_rejected_without_a_unit() {
    let store = Arc::new(MemoryStore::new());
    let running = Running::start(Clients::from_store(store.clone()), config(2));

    let request = store
        .create_request(NewWorkRequest::new("default", "no-steps"))
        .await
        .unwrap();
    let done = wait_until_done(store.as_ref(), &request.key, TIMEOUT)
        .await
        .unwrap();
    assert_eq!(done.succeeded().unwrap().reason, reason::INVALID_SPEC);
    assert!(store.list_units().await.unwrap().is_empty());

    running.stop().await;
}
