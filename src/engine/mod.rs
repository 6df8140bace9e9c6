//! Controller engine: informer, worker pool, reconcile core, status write-back.

pub mod control;
pub mod informer;
pub mod reconcile;
pub mod status;

pub use control::{ControlConfig, Controller};
pub use informer::Informer;
pub use reconcile::{ReconcileOutcome, Reconciler};
pub use status::{StatusChange, StatusUpdater};
