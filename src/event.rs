//! Change notifications emitted by a store.
//!
//! Delivery is at-least-once with no ordering across distinct objects.
//! Consumers compare [`ResourceVersion`]s to drop stale or repeated events.

use serde::{Deserialize, Serialize};

use crate::model::{Object, ObjectKey, ResourceVersion};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WatchEvent {
    /// The object was created or updated; carries the new state.
    Applied { object: Object },
    /// The object was removed; carries its last known state.
    Deleted { object: Object },
    /// The stream may have dropped events. Consumers must relist.
    Resync,
}

impl WatchEvent {
    pub fn applied(object: Object) -> Self {
        WatchEvent::Applied { object }
    }

    pub fn deleted(object: Object) -> Self {
        WatchEvent::Deleted { object }
    }

    pub fn object(&self) -> Option<&Object> {
        match self {
            WatchEvent::Applied { object } | WatchEvent::Deleted { object } => Some(object),
            WatchEvent::Resync => None,
        }
    }

    pub fn key(&self) -> Option<&ObjectKey> {
        self.object().map(Object::key)
    }

    pub fn version(&self) -> Option<ResourceVersion> {
        self.object().map(Object::version)
    }
}
