//! In-memory store.
//!
//! Behaves like the real control plane for everything the reconciler relies
//! on: a single global version counter, atomic create-by-name, version-checked
//! status writes, cascade delete through the owner index, and a broadcast
//! change stream. Events are sent while the state lock is held, so per-object
//! event order matches write order.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{ObjectStore, RequestClient, UnitClient, WatchSource};
use crate::error::{Error, Result};
use crate::event::WatchEvent;
use crate::model::*;

const DEFAULT_EVENT_CAPACITY: usize = 4096;

pub struct MemoryStore {
    state: Mutex<State>,
    events: broadcast::Sender<WatchEvent>,
}

#[derive(Default)]
struct State {
    requests: HashMap<ObjectKey, WorkRequest>,
    units: HashMap<ObjectKey, ExecutionUnit>,
    /// Owner request key -> keys of units that name it as owner.
    owned: HashMap<ObjectKey, BTreeSet<ObjectKey>>,
    last_version: u64,
}

impl State {
    fn next_version(&mut self) -> ResourceVersion {
        self.last_version += 1;
        ResourceVersion(self.last_version)
    }

    fn remove_unit(&mut self, key: &ObjectKey) -> Option<ExecutionUnit> {
        let unit = self.units.remove(key)?;
        if let Some(set) = self.owned.get_mut(&unit.owner.key) {
            set.remove(key);
            if set.is_empty() {
                self.owned.remove(&unit.owner.key);
            }
        }
        Some(unit)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_event_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// A store whose change stream buffers at most `capacity` events per
    /// subscriber before the subscriber lags.
    pub fn with_event_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            state: Mutex::new(State::default()),
            events,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: WatchEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Re-send the current state of every object, as a watch replay would.
    ///
    /// Consumers must tolerate this; it exists to exercise at-least-once delivery.
    pub fn replay(&self) {
        let state = self.state();
        for request in state.requests.values() {
            self.emit(WatchEvent::applied(Object::Request(request.clone())));
        }
        for unit in state.units.values() {
            self.emit(WatchEvent::applied(Object::Unit(unit.clone())));
        }
    }

    /// Tell every subscriber the stream is unreliable and it must relist.
    pub fn announce_resync(&self) {
        self.emit(WatchEvent::Resync);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RequestClient for MemoryStore {
    async fn get_request(&self, key: &ObjectKey) -> Result<WorkRequest> {
        self.state()
            .requests
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("work request {key}")))
    }

    async fn update_request_status(
        &self,
        key: &ObjectKey,
        expected: ResourceVersion,
        status: RequestStatus,
    ) -> Result<WorkRequest> {
        let mut state = self.state();
        let version = state.next_version();
        let request = state
            .requests
            .get_mut(key)
            .ok_or_else(|| Error::NotFound(format!("work request {key}")))?;
        if request.version != expected {
            return Err(Error::VersionConflict {
                key: key.clone(),
                expected,
            });
        }
        request.status = status;
        request.version = version;
        let updated = request.clone();
        self.emit(WatchEvent::applied(Object::Request(updated.clone())));
        Ok(updated)
    }
}

#[async_trait]
impl UnitClient for MemoryStore {
    async fn create_unit(&self, new: NewUnit) -> Result<ExecutionUnit> {
        if new.key.namespace != new.owner.key.namespace {
            return Err(Error::Invalid(format!(
                "unit {} must live in its owner's namespace {}",
                new.key, new.owner.key.namespace
            )));
        }
        let mut state = self.state();
        if state.units.contains_key(&new.key) {
            return Err(Error::AlreadyExists(new.key));
        }
        match state.requests.get(&new.owner.key) {
            Some(owner) if owner.uid == new.owner.uid => {}
            _ => {
                return Err(Error::NotFound(format!(
                    "owner {} ({})",
                    new.owner.key, new.owner.uid
                )));
            }
        }
        let version = state.next_version();
        let unit = ExecutionUnit {
            key: new.key.clone(),
            uid: Uuid::new_v4(),
            version,
            created_at: Utc::now(),
            owner: new.owner,
            labels: new.labels,
            spec: new.spec,
            phase: UnitPhase::Pending,
        };
        state
            .owned
            .entry(unit.owner.key.clone())
            .or_default()
            .insert(new.key.clone());
        state.units.insert(new.key, unit.clone());
        self.emit(WatchEvent::applied(Object::Unit(unit.clone())));
        Ok(unit)
    }

    async fn list_owned_units(&self, owner: &OwnerRef) -> Result<Vec<ExecutionUnit>> {
        let state = self.state();
        let Some(keys) = state.owned.get(&owner.key) else {
            return Ok(Vec::new());
        };
        Ok(keys
            .iter()
            .filter_map(|k| state.units.get(k))
            .filter(|u| u.is_owned_by(owner))
            .cloned()
            .collect())
    }

    async fn delete_unit(&self, key: &ObjectKey) -> Result<()> {
        let mut state = self.state();
        let mut unit = state
            .remove_unit(key)
            .ok_or_else(|| Error::NotFound(format!("execution unit {key}")))?;
        unit.version = state.next_version();
        self.emit(WatchEvent::deleted(Object::Unit(unit)));
        Ok(())
    }
}

#[async_trait]
impl WatchSource for MemoryStore {
    async fn current_version(&self) -> Result<ResourceVersion> {
        Ok(ResourceVersion(self.state().last_version))
    }

    async fn list_requests(&self) -> Result<Vec<WorkRequest>> {
        let mut requests: Vec<_> = self.state().requests.values().cloned().collect();
        requests.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(requests)
    }

    async fn list_units(&self) -> Result<Vec<ExecutionUnit>> {
        let mut units: Vec<_> = self.state().units.values().cloned().collect();
        units.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(units)
    }

    fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn create_request(&self, new: NewWorkRequest) -> Result<WorkRequest> {
        if new.key.namespace.is_empty() || new.key.name.is_empty() {
            return Err(Error::Invalid(format!(
                "work request needs a namespace and a name, got '{}'",
                new.key
            )));
        }
        let mut state = self.state();
        if state.requests.contains_key(&new.key) {
            return Err(Error::AlreadyExists(new.key));
        }
        let version = state.next_version();
        let request = WorkRequest {
            key: new.key.clone(),
            uid: Uuid::new_v4(),
            generation: 1,
            version,
            created_at: Utc::now(),
            spec: new.spec,
            status: RequestStatus::default(),
        };
        state.requests.insert(new.key, request.clone());
        self.emit(WatchEvent::applied(Object::Request(request.clone())));
        Ok(request)
    }

    async fn delete_request(&self, key: &ObjectKey) -> Result<()> {
        let mut state = self.state();
        let mut request = state
            .requests
            .remove(key)
            .ok_or_else(|| Error::NotFound(format!("work request {key}")))?;
        let owner = OwnerRef::of(&request);
        let owned: Vec<ObjectKey> = state
            .owned
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        for unit_key in owned {
            let is_ours = state
                .units
                .get(&unit_key)
                .is_some_and(|u| u.is_owned_by(&owner));
            if !is_ours {
                continue;
            }
            if let Some(mut unit) = state.remove_unit(&unit_key) {
                unit.version = state.next_version();
                self.emit(WatchEvent::deleted(Object::Unit(unit)));
            }
        }
        request.version = state.next_version();
        self.emit(WatchEvent::deleted(Object::Request(request)));
        Ok(())
    }

    async fn get_unit(&self, key: &ObjectKey) -> Result<ExecutionUnit> {
        self.state()
            .units
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("execution unit {key}")))
    }

    async fn set_unit_phase(&self, key: &ObjectKey, phase: UnitPhase) -> Result<ExecutionUnit> {
        let mut state = self.state();
        let version = state.next_version();
        let unit = state
            .units
            .get_mut(key)
            .ok_or_else(|| Error::NotFound(format!("execution unit {key}")))?;
        if unit.phase == phase {
            return Ok(unit.clone());
        }
        if !unit.phase.can_transition_to(phase) {
            return Err(Error::Invalid(format!(
                "unit {key} cannot move from {} to {phase}",
                unit.phase
            )));
        }
        unit.phase = phase;
        unit.version = version;
        let updated = unit.clone();
        self.emit(WatchEvent::applied(Object::Unit(updated.clone())));
        Ok(updated)
    }
}
