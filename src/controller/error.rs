//! Error types for the controller.
//!
//! Three top-level kinds drive the caller's behavior: `WaitRequeue` (benign
//! not-ready-yet), `ObjSync` (Kubernetes object manipulation failed) and
//! everything else (unclassified — flips the instance to Error and triggers
//! the replica set recovery scan).

use std::time::Duration;

use thiserror::Error;

use crate::client::MongoError;

/// Error type for controller operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Benign wait: expected pods not up yet, election in progress, ...
    /// The caller refreshes the replica set status and requeues soon.
    #[error("wait requeue: {0}")]
    WaitRequeue(String),

    /// Failure creating/updating/deleting an orchestrator object.
    #[error("sync k8s object error: {0}")]
    ObjSync(String),

    /// Kubernetes API error outside the object-sync paths.
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Wire-protocol failure against the database.
    #[error("mongo error: {0}")]
    Mongo(#[from] MongoError),

    /// The host directory ConfigMap could not be fetched; always retried.
    #[error("host directory unavailable: {0}")]
    DirectoryUnavailable(String),

    /// `rs.initiate` did not produce a recognized success marker.
    #[error("replica set init failed: {0}")]
    RsInitFailed(String),

    /// `rs.status()` did not report ok after initiation.
    #[error("replica set status not ok")]
    RsStatusNotOk,

    /// A credential Secret the bootstrap depends on is missing.
    #[error("secret missing: {0}")]
    MissingSecret(String),

    /// A live member reports a role/state mismatch.
    #[error("member role error: {0}")]
    MemberRole(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invariant violation (e.g. an unrecognized persisted restart state).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap a failure from an orchestrator object operation.
    pub fn obj_sync(err: impl std::fmt::Display) -> Self {
        Error::ObjSync(err.to_string())
    }

    pub fn wait(msg: impl Into<String>) -> Self {
        Error::WaitRequeue(msg.into())
    }

    pub fn is_wait_requeue(&self) -> bool {
        matches!(self, Error::WaitRequeue(_))
    }

    pub fn is_obj_sync(&self) -> bool {
        matches!(self, Error::ObjSync(_))
    }

    /// Check if this error indicates a not-found condition.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 404)
    }

    /// Requeue delay: short on soft conditions and sync errors, also short
    /// on unclassified errors (recovery already ran by the time the caller
    /// sees this).
    pub fn requeue_after(&self) -> Duration {
        Duration::from_secs(5)
    }
}

/// Result type alias for controller operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_helpers() {
        assert!(Error::wait("pods").is_wait_requeue());
        assert!(!Error::wait("pods").is_obj_sync());
        assert!(Error::obj_sync("boom").is_obj_sync());
        assert!(!Error::RsStatusNotOk.is_wait_requeue());
        assert!(!Error::RsStatusNotOk.is_obj_sync());
    }

    #[test]
    fn test_mongo_errors_are_unclassified() {
        let err = Error::Mongo(MongoError::CommandNotOk("replSetReconfig".to_string()));
        assert!(!err.is_wait_requeue());
        assert!(!err.is_obj_sync());
    }
}
