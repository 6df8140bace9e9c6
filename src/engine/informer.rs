//! Keeps the watch cache fed and the queue primed.
//!
//! Subscribes to the change stream, lists everything once, then folds events
//! into the cache and enqueues the request each event concerns. A lagged or
//! resync-marked stream triggers a fresh list; a timer re-enqueues every
//! cached request so nothing waits forever on a lost event.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cache::{Applied, WatchCache};
use crate::error::Result;
use crate::queue::{BackoffPolicy, ReconcileQueue};
use crate::storage::WatchSource;

pub struct Informer {
    watch: Arc<dyn WatchSource>,
    cache: Arc<WatchCache>,
    queue: Arc<ReconcileQueue>,
    resync_period: Duration,
    relist_backoff: BackoffPolicy,
}

impl Informer {
    pub fn new(
        watch: Arc<dyn WatchSource>,
        cache: Arc<WatchCache>,
        queue: Arc<ReconcileQueue>,
        resync_period: Duration,
    ) -> Self {
        Self {
            watch,
            cache,
            queue,
            resync_period,
            relist_backoff: BackoffPolicy {
                base: Duration::from_millis(50),
                max: Duration::from_secs(10),
                max_retries: u32::MAX,
            },
        }
    }

    /// Run until `shutdown` flips to true or the change stream closes.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut events = self.watch.subscribe();
        if !self.relist(&mut shutdown).await {
            return Ok(());
        }
        info!(
            requests = self.cache.request_count(),
            units = self.cache.unit_count(),
            "watch cache synced"
        );

        let mut resync = self.resync_timer();
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("informer stopping");
                        return Ok(());
                    }
                }
                _ = tick(resync.as_mut()) => {
                    let keys = self.cache.request_keys();
                    debug!(count = keys.len(), "periodic resync");
                    for key in keys {
                        self.queue.add(key);
                    }
                }
                event = events.recv() => match event {
                    Ok(event) => match self.cache.apply(&event) {
                        Some(Applied::Resync) => {
                            info!("change stream asked for resync, relisting");
                            if !self.relist(&mut shutdown).await {
                                return Ok(());
                            }
                        }
                        Some(applied) => {
                            if let Some(key) = applied.key() {
                                self.queue.add(key.clone());
                            }
                        }
                        None => {}
                    },
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "change stream lagged, relisting");
                        if !self.relist(&mut shutdown).await {
                            return Ok(());
                        }
                    }
                    Err(RecvError::Closed) => {
                        info!("change stream closed, informer stopping");
                        return Ok(());
                    }
                },
            }
        }
    }

    fn resync_timer(&self) -> Option<Interval> {
        if self.resync_period.is_zero() {
            return None;
        }
        let mut timer =
            tokio::time::interval_at(Instant::now() + self.resync_period, self.resync_period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Some(timer)
    }

    /// List both kinds, replace the cache and enqueue every request.
    ///
    /// Retries with backoff until it succeeds. Returns false if shutdown was
    /// requested first.
    async fn relist(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let mut attempt = 0;
        loop {
            if *shutdown.borrow() {
                return false;
            }
            match self.list().await {
                Ok(()) => return true,
                Err(e) => {
                    let delay = self.relist_backoff.delay(attempt);
                    warn!(error = %e, attempt, delay_ms = delay.as_millis() as u64, "relist failed");
                    attempt = attempt.saturating_add(1);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                return false;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn list(&self) -> Result<()> {
        let listed_at = self.watch.current_version().await?;
        let requests = self.watch.list_requests().await?;
        let units = self.watch.list_units().await?;
        self.cache.replace(requests, units, listed_at);
        for key in self.cache.request_keys() {
            self.queue.add(key);
        }
        Ok(())
    }
}

async fn tick(timer: Option<&mut Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}
