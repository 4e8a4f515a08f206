//! Error taxonomy shared by the rollback components.
//!
//! Health monitoring and the cache/migration coordinators return typed
//! results instead of these errors, so the decision engine decides on data.
//! These types cover what is left: store races, collaborator failures and the
//! rollback outcomes that must reach an operator.

use thiserror::Error;

use crate::db::DeploymentKey;

/// Errors from the deployment state store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("No deployment record for {0}")]
    NotFound(DeploymentKey),

    #[error("Deployment record for {key} changed concurrently (expected token {expected})")]
    Conflict { key: DeploymentKey, expected: i64 },

    #[error("Deployment record for {0} already exists")]
    AlreadyExists(DeploymentKey),

    #[error("Corrupt deployment record: {0}")]
    Corrupt(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Errors from external collaborators (cloud CLIs, caches, migration tools)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Timeouts and throttling, safe to retry
    #[error("Transient failure: {0}")]
    Transient(String),

    /// The request can never succeed as issued (missing version, missing snapshot)
    #[error("Validation failure: {0}")]
    Validation(String),

    #[error("Backend failure: {0}")]
    Failed(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Errors surfaced by the decision engine and rollback executors
#[derive(Error, Debug)]
pub enum RollbackError {
    /// Missing version, unknown service or environment. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Timeout or throttling that outlived the retry budget
    #[error("Transient error after retries: {0}")]
    Transient(String),

    /// Concurrent state mutation; re-read before retrying
    #[error("Concurrent modification of {0}")]
    Conflict(DeploymentKey),

    /// A multi-step rollback stopped part way; manual follow-up required
    #[error("Rollback partially completed: {0}")]
    PartialFailure(String),

    /// Infrastructure rollbacks are never executed automatically
    #[error("Manual review required for {0}")]
    ManualReviewRequired(DeploymentKey),

    #[error("Rollback failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for RollbackError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { key, .. } => Self::Conflict(key),
            StoreError::NotFound(key) => {
                Self::Validation(format!("no deployment record for {}", key))
            }
            other => Self::Store(other),
        }
    }
}

impl From<BackendError> for RollbackError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Transient(msg) => Self::Transient(msg),
            BackendError::Validation(msg) => Self::Validation(msg),
            BackendError::Failed(msg) => Self::Failed(msg),
        }
    }
}
