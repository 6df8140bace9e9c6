//! Controller: an informer feeding a fixed pool of reconcile workers.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{Instrument, error, info, warn};

use super::informer::Informer;
use super::reconcile::Reconciler;
use super::status::StatusUpdater;
use crate::cache::WatchCache;
use crate::error::{Error, Result};
use crate::model::ObjectKey;
use crate::queue::{BackoffPolicy, ReconcileQueue, millis};
use crate::storage::Clients;
use crate::telemetry::metrics;
use crate::telemetry::reconcile::{record_outcome, start_reconcile_span};

/// Configuration for the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Number of reconcile workers.
    pub workers: usize,
    /// How often every cached request is re-enqueued. Zero disables it.
    #[serde(with = "millis")]
    pub resync_period: Duration,
    /// Requeue backoff for failed reconciles.
    pub backoff: BackoffPolicy,
    /// Status writes attempted per reconcile before giving up on conflicts.
    pub status_update_attempts: u32,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            resync_period: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
            status_update_attempts: 5,
        }
    }
}

impl ControlConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| Error::Config(format!("invalid controller config: {e}")))
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }
}

/// The controller loop: keep the cache synced, drain the queue with workers.
#[derive(Clone)]
pub struct Controller {
    clients: Clients,
    cache: Arc<WatchCache>,
    queue: Arc<ReconcileQueue>,
    reconciler: Arc<Reconciler>,
    config: ControlConfig,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Controller {
    pub fn new(clients: Clients, config: ControlConfig) -> Self {
        let cache = Arc::new(WatchCache::new());
        let queue = ReconcileQueue::new(config.backoff.clone());
        let status = StatusUpdater::new(clients.requests.clone(), config.status_update_attempts);
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&cache),
            clients.units.clone(),
            status,
        ));
        let (shutdown, _) = watch::channel(false);
        Self {
            clients,
            cache,
            queue,
            reconciler,
            config,
            shutdown: Arc::new(shutdown),
        }
    }

    pub fn cache(&self) -> &Arc<WatchCache> {
        &self.cache
    }

    pub fn queue(&self) -> &Arc<ReconcileQueue> {
        &self.queue
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    /// Signal the controller to shut down. Workers finish their current key.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        self.queue.shutdown();
    }

    /// Run the controller on a background task.
    pub fn spawn(&self) -> JoinHandle<Result<()>> {
        let this = self.clone();
        tokio::spawn(async move { this.run().await })
    }

    /// Run the informer and workers until shutdown.
    pub async fn run(&self) -> Result<()> {
        let workers = self.config.workers.max(1);
        info!(workers, "controller started");

        let mut tasks = JoinSet::new();
        let informer = Informer::new(
            self.clients.watch.clone(),
            Arc::clone(&self.cache),
            Arc::clone(&self.queue),
            self.config.resync_period,
        );
        let shutdown = self.shutdown.subscribe();
        tasks.spawn(async move {
            if let Err(e) = informer.run(shutdown).await {
                error!(error = %e, "informer failed");
            }
        });
        for id in 0..workers {
            let queue = Arc::clone(&self.queue);
            let reconciler = Arc::clone(&self.reconciler);
            tasks.spawn(worker(id, queue, reconciler));
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "controller task panicked");
            }
        }
        info!("controller stopped");
        Ok(())
    }
}

async fn worker(id: usize, queue: Arc<ReconcileQueue>, reconciler: Arc<Reconciler>) {
    while let Some(key) = queue.get().await {
        process(id, &key, &queue, &reconciler).await;
        queue.done(&key);
    }
}

async fn process(id: usize, key: &ObjectKey, queue: &Arc<ReconcileQueue>, reconciler: &Reconciler) {
    let span = start_reconcile_span(key, id);
    let started = Instant::now();
    let result = reconciler.reconcile(key).instrument(span.clone()).await;
    metrics::reconcile_duration_ms().record(started.elapsed().as_secs_f64() * 1000.0, &[]);

    let _entered = span.enter();
    match result {
        Ok(outcome) => {
            record_outcome(&span, &outcome);
            metrics::reconciles().add(1, &[KeyValue::new("result", outcome.label())]);
            queue.forget(key);
        }
        Err(e) if e.is_transient() => {
            metrics::reconciles().add(1, &[KeyValue::new("result", "retry")]);
            match queue.add_rate_limited(key.clone()) {
                Some(delay) => {
                    metrics::requeues().add(1, &[]);
                    warn!(%key, error = %e, delay_ms = delay.as_millis() as u64, "reconcile failed, requeued");
                }
                None => {
                    metrics::keys_dropped().add(1, &[]);
                    error!(%key, error = %e, "reconcile failed, retries exhausted until next event");
                }
            }
        }
        Err(e) => {
            metrics::reconciles().add(1, &[KeyValue::new("result", "error")]);
            error!(%key, error = %e, "reconcile failed permanently");
            queue.forget(key);
        }
    }
}
