//! Store contract.
//!
//! The control-plane store is the only shared mutable state in the system.
//! It offers atomic create-by-name, version-checked status writes, cascading
//! delete, and a change stream. Everything the reconciler needs from it is
//! split into small traits so each seam can be replaced in tests:
//!
//! - [`RequestClient`]: read and status-write work requests
//! - [`UnitClient`]: create, list-by-owner and delete execution units
//! - [`WatchSource`]: full lists plus the change stream feeding the cache
//!
//! [`ObjectStore`] adds the user-facing operations on top.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::event::WatchEvent;
use crate::model::*;

/// Reads and status writes for work requests.
#[async_trait]
pub trait RequestClient: Send + Sync {
    /// Current state of a request straight from the store.
    async fn get_request(&self, key: &ObjectKey) -> Result<WorkRequest>;

    /// Replace the status block if the stored version still equals `expected`.
    ///
    /// Fails with `VersionConflict` when someone else wrote first and with
    /// `NotFound` when the request is gone.
    async fn update_request_status(
        &self,
        key: &ObjectKey,
        expected: ResourceVersion,
        status: RequestStatus,
    ) -> Result<WorkRequest>;
}

/// The child resource client.
#[async_trait]
pub trait UnitClient: Send + Sync {
    /// Atomically create a unit by name. A taken name yields `AlreadyExists`.
    async fn create_unit(&self, unit: NewUnit) -> Result<ExecutionUnit>;

    /// Units whose owner relation points at `owner` (key and uid).
    async fn list_owned_units(&self, owner: &OwnerRef) -> Result<Vec<ExecutionUnit>>;

    async fn delete_unit(&self, key: &ObjectKey) -> Result<()>;
}

/// Source of full snapshots and incremental change events.
#[async_trait]
pub trait WatchSource: Send + Sync {
    /// Latest version the store has handed out. Read it before listing: the
    /// lists that follow reflect every write up to it.
    async fn current_version(&self) -> Result<ResourceVersion>;

    async fn list_requests(&self) -> Result<Vec<WorkRequest>>;

    async fn list_units(&self) -> Result<Vec<ExecutionUnit>>;

    /// Subscribe to changes. Subscribe before listing so nothing falls between.
    fn subscribe(&self) -> broadcast::Receiver<WatchEvent>;
}

/// A complete store: the reconciler seams plus user-facing operations.
#[async_trait]
pub trait ObjectStore: RequestClient + UnitClient + WatchSource {
    async fn create_request(&self, new: NewWorkRequest) -> Result<WorkRequest>;

    /// Delete a request and, by owner relation, every unit it owns.
    async fn delete_request(&self, key: &ObjectKey) -> Result<()>;

    async fn get_unit(&self, key: &ObjectKey) -> Result<ExecutionUnit>;

    /// Report a unit's progress. Setting the current phase again is a no-op.
    async fn set_unit_phase(&self, key: &ObjectKey, phase: UnitPhase) -> Result<ExecutionUnit>;
}

/// The client handles injected into the controller.
#[derive(Clone)]
pub struct Clients {
    pub requests: Arc<dyn RequestClient>,
    pub units: Arc<dyn UnitClient>,
    pub watch: Arc<dyn WatchSource>,
}

impl Clients {
    /// Use one store for every seam.
    pub fn from_store<S: ObjectStore + 'static>(store: Arc<S>) -> Self {
        Self {
            requests: store.clone(),
            units: store.clone(),
            watch: store,
        }
    }

    pub fn with_units(mut self, units: Arc<dyn UnitClient>) -> Self {
        self.units = units;
        self
    }

    pub fn with_requests(mut self, requests: Arc<dyn RequestClient>) -> Self {
        self.requests = requests;
        self
    }
}
