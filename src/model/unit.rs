//! Execution unit types: the concrete child created for a work request.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ObjectKey, OwnerRef, ResourceVersion, Step, UnitRef, WorkRequest, OWNER_LABEL};
use super::{ConditionStatus, reason};

/// The running counterpart of a work request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionUnit {
    pub key: ObjectKey,
    pub uid: Uuid,
    pub version: ResourceVersion,
    pub created_at: DateTime<Utc>,
    pub owner: OwnerRef,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub spec: UnitSpec,
    pub phase: UnitPhase,
}

impl ExecutionUnit {
    pub fn unit_ref(&self) -> UnitRef {
        UnitRef {
            name: self.key.name.clone(),
            uid: self.uid,
        }
    }

    pub fn is_owned_by(&self, owner: &OwnerRef) -> bool {
        &self.owner == owner
    }
}

/// Deterministic ordering used when more than one unit claims the same owner.
///
/// Earliest creation wins; ties break on name so every reconciler picks the
/// same unit.
pub fn earliest(units: &[ExecutionUnit]) -> Option<&ExecutionUnit> {
    units
        .iter()
        .min_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.key.name.cmp(&b.key.name)))
}

/// What the unit runs. Copied from the request at creation time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitSpec {
    pub steps: Vec<Step>,
}

/// Lifecycle phase of a unit, reported by whatever executes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl UnitPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, UnitPhase::Succeeded | UnitPhase::Failed)
    }

    /// Can a unit move from self to `to`?
    pub fn can_transition_to(self, to: UnitPhase) -> bool {
        use UnitPhase::*;
        matches!(
            (self, to),
            (Pending, Running) | (Pending, Failed) | (Running, Succeeded) | (Running, Failed)
        )
    }

    /// Status and reason the owning request should carry for this phase.
    pub fn condition(self) -> (ConditionStatus, &'static str) {
        match self {
            UnitPhase::Pending => (ConditionStatus::Unknown, reason::PENDING),
            UnitPhase::Running => (ConditionStatus::Unknown, reason::RUNNING),
            UnitPhase::Succeeded => (ConditionStatus::True, reason::SUCCEEDED),
            UnitPhase::Failed => (ConditionStatus::False, reason::FAILED),
        }
    }
}

impl std::fmt::Display for UnitPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UnitPhase::Pending => "pending",
            UnitPhase::Running => "running",
            UnitPhase::Succeeded => "succeeded",
            UnitPhase::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for UnitPhase {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(UnitPhase::Pending),
            "running" => Ok(UnitPhase::Running),
            "succeeded" => Ok(UnitPhase::Succeeded),
            "failed" => Ok(UnitPhase::Failed),
            other => Err(crate::error::Error::Other(format!(
                "unknown unit phase: {other}"
            ))),
        }
    }
}

/// A unit to be created. The store assigns uid, version and timestamp.
#[derive(Debug, Clone)]
pub struct NewUnit {
    pub key: ObjectKey,
    pub owner: OwnerRef,
    pub labels: BTreeMap<String, String>,
    pub spec: UnitSpec,
}

impl NewUnit {
    /// Build the single unit a request should have.
    ///
    /// The name is a pure function of the request's name and uid, so racing
    /// reconcilers collide on the store's create-by-name instead of each
    /// creating their own unit.
    pub fn for_request(request: &WorkRequest) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(OWNER_LABEL.to_string(), request.key.name.clone());
        Self {
            key: ObjectKey::new(&request.key.namespace, unit_name(request)),
            owner: OwnerRef::of(request),
            labels,
            spec: UnitSpec {
                steps: request.spec.steps.clone(),
            },
        }
    }
}

/// `<request-name>-unit-<first 8 hex of uid>`.
pub fn unit_name(request: &WorkRequest) -> String {
    let uid = request.uid.simple().to_string();
    format!("{}-unit-{}", request.key.name, &uid[..8])
}
