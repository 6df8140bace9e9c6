//! Core data model.
//!
//! Two object kinds live in the store: a [`WorkRequest`] describing a run the
//! user wants, and the [`ExecutionUnit`] created to carry it out. The unit
//! points back at its request through an [`OwnerRef`].

pub mod request;
pub mod unit;

pub use request::*;
pub use unit::*;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Label carrying the owning request's name on every execution unit.
///
/// Informational only; lookups go through the typed owner index.
pub const OWNER_LABEL: &str = "taskrun.dev/work-request";

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Namespaced identity of a stored object. Also the reconcile key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl std::str::FromStr for ObjectKey {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() => Ok(Self::new(ns, name)),
            _ => Err(crate::error::Error::Other(format!(
                "expected namespace/name, got '{s}'"
            ))),
        }
    }
}

/// Version token assigned by the store on every write.
///
/// Tokens are totally ordered across all objects of one store, so a cache
/// can discard an event older than what it already holds.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ResourceVersion(pub u64);

impl std::fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Typed owner relation from a unit to the request that created it.
///
/// The uid distinguishes a request from an earlier one that had the same name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerRef {
    pub key: ObjectKey,
    pub uid: Uuid,
}

impl OwnerRef {
    pub fn of(request: &WorkRequest) -> Self {
        Self {
            key: request.key.clone(),
            uid: request.uid,
        }
    }
}

// ---------------------------------------------------------------------------
// Stored objects
// ---------------------------------------------------------------------------

/// Either kind of stored object, as carried on the change stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Object {
    Request(WorkRequest),
    Unit(ExecutionUnit),
}

impl Object {
    pub fn key(&self) -> &ObjectKey {
        match self {
            Object::Request(r) => &r.key,
            Object::Unit(u) => &u.key,
        }
    }

    pub fn version(&self) -> ResourceVersion {
        match self {
            Object::Request(r) => r.version,
            Object::Unit(u) => u.version,
        }
    }
}
