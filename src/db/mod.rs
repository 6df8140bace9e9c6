//! Postgres-backed object store.
//!
//! Requests and units live in two tables sharing one version sequence.
//! Every write sends its change event with `pg_notify` inside the same
//! transaction, so listeners only ever see committed changes. A listener
//! task turns those notifications into the [`WatchEvent`] stream.

pub mod requests;
pub mod units;

use async_trait::async_trait;
use sqlx::postgres::{PgListener, PgPoolOptions};
use sqlx::{PgConnection, PgPool};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::event::WatchEvent;
use crate::model::*;
use crate::storage::{ObjectStore, WatchSource};

/// Notification channel carrying change events.
pub const WATCH_CHANNEL: &str = "taskrun_watch";

/// Postgres rejects NOTIFY payloads of 8000 bytes or more.
const MAX_NOTIFY_PAYLOAD: usize = 7900;

const EVENT_CAPACITY: usize = 4096;

/// Database handle. Owns the connection pool and the local change stream.
pub struct Db {
    pool: PgPool,
    events: broadcast::Sender<WatchEvent>,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self { pool, events })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Start forwarding notifications to subscribers.
    ///
    /// Returns once `LISTEN` is active, so a subscriber that then lists the
    /// tables misses nothing. Dropped connections are reported downstream as
    /// [`WatchEvent::Resync`], since notifications sent meanwhile are lost.
    pub async fn start_watch(&self) -> Result<JoinHandle<()>> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(WATCH_CHANNEL).await?;
        info!(channel = WATCH_CHANNEL, "listening for changes");

        let events = self.events.clone();
        Ok(tokio::spawn(async move {
            loop {
                match listener.try_recv().await {
                    Ok(Some(notification)) => {
                        match serde_json::from_str::<WatchEvent>(notification.payload()) {
                            Ok(event) => {
                                let _ = events.send(event);
                            }
                            Err(e) => {
                                warn!(error = %e, "undecodable change event, forcing resync");
                                let _ = events.send(WatchEvent::Resync);
                            }
                        }
                    }
                    Ok(None) => {
                        warn!("listener connection lost, forcing resync");
                        let _ = events.send(WatchEvent::Resync);
                    }
                    Err(e) => {
                        warn!(error = %e, "listener error, retrying");
                        let _ = events.send(WatchEvent::Resync);
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            }
        }))
    }
}

/// Draw the next version from the shared sequence.
async fn next_version(conn: &mut PgConnection) -> Result<ResourceVersion> {
    let (v,): (i64,) = sqlx::query_as("SELECT nextval('object_version')")
        .fetch_one(conn)
        .await?;
    Ok(ResourceVersion(v as u64))
}

/// Queue `event` for delivery when the surrounding transaction commits.
async fn notify(conn: &mut PgConnection, event: &WatchEvent) -> Result<()> {
    let mut payload = serde_json::to_string(event)?;
    if payload.len() > MAX_NOTIFY_PAYLOAD {
        debug!(bytes = payload.len(), "change event too large, sending resync");
        payload = serde_json::to_string(&WatchEvent::Resync)?;
    }
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(WATCH_CHANNEL)
        .bind(payload)
        .execute(conn)
        .await?;
    Ok(())
}

#[async_trait]
impl WatchSource for Db {
    async fn current_version(&self) -> Result<ResourceVersion> {
        let (v,): (i64,) = sqlx::query_as(
            "SELECT CASE WHEN is_called THEN last_value ELSE 0 END FROM object_version",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(ResourceVersion(v as u64))
    }

    async fn list_requests(&self) -> Result<Vec<WorkRequest>> {
        self.fetch_requests().await
    }

    async fn list_units(&self) -> Result<Vec<ExecutionUnit>> {
        self.fetch_units().await
    }

    fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}

#[async_trait]
impl ObjectStore for Db {
    async fn create_request(&self, new: NewWorkRequest) -> Result<WorkRequest> {
        self.insert_request(new).await
    }

    async fn delete_request(&self, key: &ObjectKey) -> Result<()> {
        self.remove_request(key).await
    }

    async fn get_unit(&self, key: &ObjectKey) -> Result<ExecutionUnit> {
        self.fetch_unit(key).await
    }

    async fn set_unit_phase(&self, key: &ObjectKey, phase: UnitPhase) -> Result<ExecutionUnit> {
        self.update_unit_phase(key, phase).await
    }
}
