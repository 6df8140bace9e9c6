//! Error types for taskrun-rs.

use thiserror::Error;

use crate::model::{ObjectKey, ResourceVersion};

#[derive(Debug, Error)]
pub enum Error {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("object already exists: {0}")]
    AlreadyExists(ObjectKey),

    #[error("version conflict on {key}: expected {expected}")]
    VersionConflict {
        key: ObjectKey,
        expected: ResourceVersion,
    },

    /// Store unavailable or a request timed out. Safe to retry.
    #[error("transient store error: {0}")]
    Transient(String),

    /// The watch cache has not completed its initial list yet.
    #[error("watch cache not synced")]
    CacheNotSynced,

    /// The unit name is held by an object this request does not own.
    #[error("unit name {0} is held by another owner")]
    NameConflict(ObjectKey),

    /// The request spec can never produce a unit.
    #[error("invalid request spec: {0}")]
    FatalSpec(String),

    /// The store rejected an object as malformed.
    #[error("invalid object: {0}")]
    Invalid(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the reconcile queue should retry the key after backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Transient(_)
                | Error::VersionConflict { .. }
                | Error::CacheNotSynced
                | Error::NameConflict(_)
                | Error::Database(_)
                | Error::Io(_)
        )
    }

    /// Errors that end a request for good and belong on its status.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::FatalSpec(_) | Error::Invalid(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
