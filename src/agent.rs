//! Stand-in for the node agent that executes units.
//!
//! Watches for non-terminal units and walks each one through
//! `Pending -> Running -> Succeeded` (or `Failed`) after a fixed delay. Nothing
//! is actually executed; the agent exists so requests can finish in the demo
//! and in end-to-end tests.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::event::WatchEvent;
use crate::model::*;
use crate::storage::ObjectStore;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// How long a unit stays `Running`.
    pub run_for: Duration,
    /// Units with a step using this image end `Failed`.
    pub fail_image: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            run_for: Duration::from_millis(50),
            fail_image: None,
        }
    }
}

pub struct UnitAgent {
    store: Arc<dyn ObjectStore>,
    config: AgentConfig,
    in_flight: Arc<Mutex<HashSet<ObjectKey>>>,
}

impl UnitAgent {
    pub fn new(store: Arc<dyn ObjectStore>, config: AgentConfig) -> Self {
        Self {
            store,
            config,
            in_flight: Arc::default(),
        }
    }

    /// Run until `shutdown` flips to true or the change stream closes.
    /// Units still running at that point are abandoned mid-phase.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut events = self.store.subscribe();
        let mut tasks = JoinSet::new();
        self.pick_up_all(&mut tasks).await?;
        info!("unit agent started");

        loop {
            while tasks.try_join_next().is_some() {}
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = events.recv() => match event {
                    Ok(WatchEvent::Applied { object: Object::Unit(unit) }) => {
                        self.pick_up(unit, &mut tasks);
                    }
                    Ok(WatchEvent::Resync) => self.pick_up_all(&mut tasks).await?,
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "unit agent lagged, relisting units");
                        self.pick_up_all(&mut tasks).await?;
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        tasks.shutdown().await;
        info!("unit agent stopped");
        Ok(())
    }

    async fn pick_up_all(&self, tasks: &mut JoinSet<()>) -> Result<()> {
        for unit in self.store.list_units().await? {
            self.pick_up(unit, tasks);
        }
        Ok(())
    }

    fn pick_up(&self, unit: ExecutionUnit, tasks: &mut JoinSet<()>) {
        if unit.phase.is_terminal() {
            return;
        }
        let fresh = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(unit.key.clone());
        if !fresh {
            return;
        }
        let store = Arc::clone(&self.store);
        let config = self.config.clone();
        let in_flight = Arc::clone(&self.in_flight);
        tasks.spawn(async move {
            let key = unit.key.clone();
            match execute(store.as_ref(), &key, &config).await {
                Ok(()) => {}
                Err(Error::NotFound(_)) => debug!(unit = %key, "unit deleted while running"),
                Err(e) => warn!(unit = %key, error = %e, "unit agent failed to report phase"),
            }
            in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&key);
        });
    }
}

async fn execute(store: &dyn ObjectStore, key: &ObjectKey, config: &AgentConfig) -> Result<()> {
    // Events can be stale; the store has the real phase.
    let unit = store.get_unit(key).await?;
    if unit.phase.is_terminal() {
        return Ok(());
    }
    if unit.phase == UnitPhase::Pending {
        store.set_unit_phase(key, UnitPhase::Running).await?;
        debug!(unit = %key, "unit running");
    }
    tokio::time::sleep(config.run_for).await;

    let fails = config
        .fail_image
        .as_deref()
        .is_some_and(|image| unit.spec.steps.iter().any(|s| s.image == image));
    let phase = if fails {
        UnitPhase::Failed
    } else {
        UnitPhase::Succeeded
    };
    store.set_unit_phase(key, phase).await?;
    info!(unit = %key, %phase, "unit finished");
    Ok(())
}
