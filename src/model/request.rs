//! Work request types: the declarative "run" object and its status block.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ObjectKey, ResourceVersion};
use crate::error::{Error, Result};

/// A declarative request for one run of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkRequest {
    pub key: ObjectKey,

    /// Fresh for every creation, even when a name is reused.
    pub uid: Uuid,

    /// Bumped by the store whenever the spec changes.
    pub generation: u64,

    pub version: ResourceVersion,

    pub created_at: DateTime<Utc>,

    /// Desired work. Opaque to the reconciler apart from validation.
    pub spec: RequestSpec,

    pub status: RequestStatus,
}

impl WorkRequest {
    /// The `Succeeded` condition, if one has been recorded.
    pub fn succeeded(&self) -> Option<&Condition> {
        self.status.condition(ConditionType::Succeeded)
    }

    /// Has this request reached a terminal condition?
    pub fn is_done(&self) -> bool {
        self.succeeded()
            .is_some_and(|c| c.status != ConditionStatus::Unknown)
    }
}

// ---------------------------------------------------------------------------
// Spec
// ---------------------------------------------------------------------------

/// What the request wants run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestSpec {
    pub steps: Vec<Step>,
}

/// One container-like step of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Step {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            command: Vec::new(),
            args: Vec::new(),
        }
    }

    pub fn command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl RequestSpec {
    /// Reject specs that can never produce a runnable unit.
    ///
    /// Failures here are terminal: retrying the same spec gives the same answer.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(Error::FatalSpec("request has no steps".to_string()));
        }
        let mut seen = std::collections::HashSet::new();
        for (i, step) in self.steps.iter().enumerate() {
            if step.name.is_empty() {
                return Err(Error::FatalSpec(format!("step {i} has no name")));
            }
            if step.image.trim().is_empty() {
                return Err(Error::FatalSpec(format!(
                    "step '{}' has no image",
                    step.name
                )));
            }
            if !seen.insert(step.name.as_str()) {
                return Err(Error::FatalSpec(format!(
                    "duplicate step name '{}'",
                    step.name
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Status block written only by the reconciler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestStatus {
    /// The adopted execution unit. Set once per unit.
    pub unit: Option<UnitRef>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub observed_generation: u64,
}

impl RequestStatus {
    pub fn condition(&self, kind: ConditionType) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.kind == kind)
    }

    /// Insert or replace the condition of the same type.
    ///
    /// Returns false when an equivalent condition is already present, so
    /// callers can skip a write. `last_transition` is kept when only the
    /// message changes.
    pub fn set_condition(&mut self, mut cond: Condition) -> bool {
        match self.conditions.iter_mut().find(|c| c.kind == cond.kind) {
            Some(existing) if existing.same_as(&cond) => false,
            Some(existing) => {
                if existing.status == cond.status {
                    cond.last_transition = existing.last_transition;
                }
                *existing = cond;
                true
            }
            None => {
                self.conditions.push(cond);
                true
            }
        }
    }
}

/// Reference from a request to its adopted unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitRef {
    pub name: String,
    pub uid: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    Succeeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        };
        write!(f, "{s}")
    }
}

/// A lifecycle condition on a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: ConditionType,
    pub status: ConditionStatus,
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition: DateTime<Utc>,
}

impl Condition {
    pub fn succeeded(
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind: ConditionType::Succeeded,
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition: Utc::now(),
        }
    }

    /// Equal ignoring the transition timestamp.
    pub fn same_as(&self, other: &Condition) -> bool {
        self.kind == other.kind
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

/// Reasons recorded on the `Succeeded` condition.
pub mod reason {
    pub const PENDING: &str = "Pending";
    pub const RUNNING: &str = "Running";
    pub const SUCCEEDED: &str = "Succeeded";
    pub const FAILED: &str = "Failed";
    pub const INVALID_SPEC: &str = "InvalidSpec";
    pub const CREATE_UNIT_FAILED: &str = "CreateUnitFailed";
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for submitting a new work request to a store.
#[derive(Debug, Clone)]
pub struct NewWorkRequest {
    pub key: ObjectKey,
    pub spec: RequestSpec,
}

impl NewWorkRequest {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            key: ObjectKey::new(namespace, name),
            spec: RequestSpec::default(),
        }
    }

    pub fn step(mut self, step: Step) -> Self {
        self.spec.steps.push(step);
        self
    }

    pub fn spec(mut self, spec: RequestSpec) -> Self {
        self.spec = spec;
        self
    }
}
