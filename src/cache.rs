//! Local, eventually-consistent mirror of store objects.
//!
//! Fed by [`WatchEvent`]s that may arrive more than once and out of order
//! across objects. Each object's cached copy only moves forward in version,
//! so a redelivered or stale event is dropped. Deletes leave a tombstone
//! version behind so a late `Applied` for a deleted object cannot resurrect it.

use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::trace;

use crate::error::{Error, Result};
use crate::event::WatchEvent;
use crate::model::*;

#[derive(Default)]
struct Snapshot {
    requests: HashMap<ObjectKey, WorkRequest>,
    units: HashMap<ObjectKey, ExecutionUnit>,
    /// Owner request key -> unit keys naming it.
    owned: HashMap<ObjectKey, BTreeSet<ObjectKey>>,
    /// Version at which a key was last seen deleted. Pruned on relist.
    request_tombstones: HashMap<ObjectKey, ResourceVersion>,
    unit_tombstones: HashMap<ObjectKey, ResourceVersion>,
    synced: bool,
}

impl Snapshot {
    fn insert_unit(&mut self, unit: ExecutionUnit) {
        self.owned
            .entry(unit.owner.key.clone())
            .or_default()
            .insert(unit.key.clone());
        self.units.insert(unit.key.clone(), unit);
    }

    fn remove_unit(&mut self, key: &ObjectKey) {
        let Some(unit) = self.units.remove(key) else {
            return;
        };
        if let Some(set) = self.owned.get_mut(&unit.owner.key) {
            set.remove(key);
            if set.is_empty() {
                self.owned.remove(&unit.owner.key);
            }
        }
    }
}

/// Which request keys an applied event makes stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// The event changed the cache; reconcile this request.
    Changed(ObjectKey),
    /// Already reflected in the cache; still reconcile, the core absorbs it.
    Redundant(ObjectKey),
    /// The stream asked for a relist.
    Resync,
}

impl Applied {
    pub fn key(&self) -> Option<&ObjectKey> {
        match self {
            Applied::Changed(k) | Applied::Redundant(k) => Some(k),
            Applied::Resync => None,
        }
    }
}

#[derive(Default)]
pub struct WatchCache {
    inner: RwLock<Snapshot>,
}

impl WatchCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Snapshot> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Snapshot> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Has the initial list completed?
    pub fn is_synced(&self) -> bool {
        self.read().synced
    }

    /// Replace the whole snapshot with a fresh list and mark the cache synced.
    ///
    /// `listed_at` is the store version read before listing. Objects already
    /// cached at a newer version than the list are kept, since events received
    /// after subscribing can be newer than the list itself. Tombstones at or
    /// below `listed_at` are dropped: the list already reflects those deletes.
    pub fn replace(
        &self,
        requests: Vec<WorkRequest>,
        units: Vec<ExecutionUnit>,
        listed_at: ResourceVersion,
    ) {
        let mut snap = self.write();
        let mut next = Snapshot::default();
        for request in requests {
            let newer = snap
                .requests
                .get(&request.key)
                .filter(|cached| cached.version > request.version)
                .cloned();
            let tombstoned = snap
                .request_tombstones
                .get(&request.key)
                .is_some_and(|v| *v > request.version);
            if tombstoned {
                continue;
            }
            let request = newer.unwrap_or(request);
            next.requests.insert(request.key.clone(), request);
        }
        for unit in units {
            let newer = snap
                .units
                .get(&unit.key)
                .filter(|cached| cached.version > unit.version)
                .cloned();
            let tombstoned = snap
                .unit_tombstones
                .get(&unit.key)
                .is_some_and(|v| *v > unit.version);
            if tombstoned {
                continue;
            }
            next.insert_unit(newer.unwrap_or(unit));
        }
        next.request_tombstones = std::mem::take(&mut snap.request_tombstones);
        next.request_tombstones.retain(|_, v| *v > listed_at);
        next.unit_tombstones = std::mem::take(&mut snap.unit_tombstones);
        next.unit_tombstones.retain(|_, v| *v > listed_at);
        next.synced = true;
        *snap = next;
    }

    /// Fold one change event into the snapshot.
    ///
    /// Returns the request key to reconcile, if the event concerns one.
    pub fn apply(&self, event: &WatchEvent) -> Option<Applied> {
        let mut snap = self.write();
        match event {
            WatchEvent::Resync => Some(Applied::Resync),
            WatchEvent::Applied { object } => match object {
                Object::Request(request) => {
                    let key = request.key.clone();
                    let stale = snap
                        .requests
                        .get(&key)
                        .is_some_and(|c| c.version >= request.version)
                        || snap
                            .request_tombstones
                            .get(&key)
                            .is_some_and(|v| *v >= request.version);
                    if stale {
                        trace!(%key, version = %request.version, "dropping stale request event");
                        return Some(Applied::Redundant(key));
                    }
                    snap.requests.insert(key.clone(), request.clone());
                    Some(Applied::Changed(key))
                }
                Object::Unit(unit) => {
                    let owner = unit.owner.key.clone();
                    let stale = snap
                        .units
                        .get(&unit.key)
                        .is_some_and(|c| c.version >= unit.version)
                        || snap
                            .unit_tombstones
                            .get(&unit.key)
                            .is_some_and(|v| *v >= unit.version);
                    if stale {
                        trace!(unit = %unit.key, version = %unit.version, "dropping stale unit event");
                        return Some(Applied::Redundant(owner));
                    }
                    snap.insert_unit(unit.clone());
                    Some(Applied::Changed(owner))
                }
            },
            WatchEvent::Deleted { object } => match object {
                Object::Request(request) => {
                    let key = request.key.clone();
                    if snap
                        .request_tombstones
                        .get(&key)
                        .is_some_and(|v| *v >= request.version)
                    {
                        return Some(Applied::Redundant(key));
                    }
                    let cached_newer = snap
                        .requests
                        .get(&key)
                        .is_some_and(|c| c.version > request.version);
                    snap.request_tombstones.insert(key.clone(), request.version);
                    if !cached_newer {
                        snap.requests.remove(&key);
                    }
                    Some(Applied::Changed(key))
                }
                Object::Unit(unit) => {
                    let owner = unit.owner.key.clone();
                    if snap
                        .unit_tombstones
                        .get(&unit.key)
                        .is_some_and(|v| *v >= unit.version)
                    {
                        return Some(Applied::Redundant(owner));
                    }
                    let cached_newer = snap
                        .units
                        .get(&unit.key)
                        .is_some_and(|c| c.version > unit.version);
                    snap.unit_tombstones.insert(unit.key.clone(), unit.version);
                    if !cached_newer {
                        snap.remove_unit(&unit.key);
                    }
                    Some(Applied::Changed(owner))
                }
            },
        }
    }

    /// Look up a request. `Ok(None)` means it does not exist (or was deleted).
    pub fn get_request(&self, key: &ObjectKey) -> Result<Option<WorkRequest>> {
        let snap = self.read();
        if !snap.synced {
            return Err(Error::CacheNotSynced);
        }
        Ok(snap.requests.get(key).cloned())
    }

    pub fn get_unit(&self, key: &ObjectKey) -> Result<Option<ExecutionUnit>> {
        let snap = self.read();
        if !snap.synced {
            return Err(Error::CacheNotSynced);
        }
        Ok(snap.units.get(key).cloned())
    }

    /// Cached units whose owner relation matches `owner`.
    pub fn units_owned_by(&self, owner: &OwnerRef) -> Result<Vec<ExecutionUnit>> {
        let snap = self.read();
        if !snap.synced {
            return Err(Error::CacheNotSynced);
        }
        let Some(keys) = snap.owned.get(&owner.key) else {
            return Ok(Vec::new());
        };
        Ok(keys
            .iter()
            .filter_map(|k| snap.units.get(k))
            .filter(|u| u.is_owned_by(owner))
            .cloned()
            .collect())
    }

    /// Keys of every cached request, for periodic resync.
    pub fn request_keys(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<_> = self.read().requests.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn request_count(&self) -> usize {
        self.read().requests.len()
    }

    pub fn unit_count(&self) -> usize {
        self.read().units.len()
    }

    /// Deletes remembered for stale-event filtering, requests and units.
    pub fn tombstone_count(&self) -> usize {
        let snap = self.read();
        snap.request_tombstones.len() + snap.unit_tombstones.len()
    }
}
