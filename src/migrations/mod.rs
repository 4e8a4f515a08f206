//! Database migration rollback coordinator.
//!
//! Plans the downgrade path between two schema revisions and applies it one
//! step at a time. When a backup is requested it is taken, and its id
//! recorded, before the first downgrade statement runs.

mod command;

pub use command::CommandMigrations;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::db::DeploymentKey;
use crate::error::{BackendError, RollbackError};
use crate::store::StateStore;

/// Revert `from` so the schema is at `to`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DowngradeStep {
    pub from: String,
    pub to: String,
}

#[async_trait]
pub trait MigrationBackend: Send + Sync {
    /// Known revisions, oldest first
    async fn history(&self) -> Result<Vec<String>, BackendError>;

    async fn current(&self) -> Result<String, BackendError>;

    async fn apply_downgrade(&self, step: &DowngradeStep) -> Result<(), BackendError>;

    /// Returns the backup id
    async fn create_backup(&self) -> Result<String, BackendError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationRollbackPlan {
    pub current_migration: String,
    pub target_migration: String,
    pub backup_id: Option<String>,
    pub dry_run: bool,
    pub steps: Vec<DowngradeStep>,
}

#[derive(Debug, Clone, Copy)]
pub struct MigrationExecuteOptions {
    pub dry_run: bool,
    pub backup_before_rollback: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AppliedStep {
    pub step: DowngradeStep,
    pub applied_at: DateTime<Utc>,
}

/// Typed outcome of an execution; failures are data, not errors
#[derive(Debug, Clone, Serialize)]
pub struct MigrationRollbackResult {
    pub plan: MigrationRollbackPlan,
    pub succeeded: bool,
    pub backup_created_at: Option<DateTime<Utc>>,
    pub applied: Vec<AppliedStep>,
    pub failed_step: Option<DowngradeStep>,
    pub error: Option<String>,
    /// A backup exists that an operator can restore from
    pub backup_available: bool,
}

/// Downgrade path from `current` to the older `target`
fn downgrade_path(
    history: &[String],
    current: &str,
    target: &str,
) -> Result<Vec<DowngradeStep>, RollbackError> {
    let position = |revision: &str| {
        history.iter().position(|r| r == revision).ok_or_else(|| {
            RollbackError::Validation(format!("unknown migration revision '{}'", revision))
        })
    };
    let current_idx = position(current)?;
    let target_idx = position(target)?;

    if target_idx > current_idx {
        return Err(RollbackError::Validation(format!(
            "target revision '{}' is newer than current revision '{}'",
            target, current
        )));
    }

    Ok((target_idx + 1..=current_idx)
        .rev()
        .map(|i| DowngradeStep {
            from: history[i].clone(),
            to: history[i - 1].clone(),
        })
        .collect())
}

pub struct MigrationRollbackCoordinator {
    backend: Arc<dyn MigrationBackend>,
    store: Arc<dyn StateStore>,
    statement_timeout: Duration,
}

impl MigrationRollbackCoordinator {
    pub fn new(
        backend: Arc<dyn MigrationBackend>,
        store: Arc<dyn StateStore>,
        statement_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            store,
            statement_timeout,
        }
    }

    async fn bounded<T>(
        &self,
        what: &str,
        call: impl std::future::Future<Output = Result<T, BackendError>>,
    ) -> Result<T, BackendError> {
        tokio::time::timeout(self.statement_timeout, call)
            .await
            .map_err(|_| {
                BackendError::Transient(format!(
                    "{} timed out after {}s",
                    what,
                    self.statement_timeout.as_secs()
                ))
            })?
    }

    /// Build a plan. Omitted revisions are resolved from the migration tool
    /// (current) and from the revision recorded for `release` (target).
    pub async fn plan(
        &self,
        key: &DeploymentKey,
        current: Option<&str>,
        target: Option<&str>,
        release: Option<&str>,
    ) -> Result<MigrationRollbackPlan, RollbackError> {
        let current_migration = match current {
            Some(revision) => revision.to_string(),
            None => self.bounded("current revision lookup", self.backend.current()).await?,
        };

        let target_migration = match (target, release) {
            (Some(revision), _) => revision.to_string(),
            (None, Some(release)) => self
                .store
                .migration_for(key, release)
                .await?
                .ok_or_else(|| {
                    RollbackError::Validation(format!(
                        "no migration recorded for {} release {}",
                        key, release
                    ))
                })?,
            (None, None) => {
                return Err(RollbackError::Validation(
                    "a target migration or release version is required".to_string(),
                ))
            }
        };

        let history = self.bounded("migration history", self.backend.history()).await?;
        let steps = downgrade_path(&history, &current_migration, &target_migration)?;

        Ok(MigrationRollbackPlan {
            current_migration,
            target_migration,
            backup_id: None,
            dry_run: false,
            steps,
        })
    }

    pub async fn execute(
        &self,
        plan: MigrationRollbackPlan,
        options: MigrationExecuteOptions,
    ) -> MigrationRollbackResult {
        let mut plan = plan;
        plan.dry_run = plan.dry_run || options.dry_run;

        let mut result = MigrationRollbackResult {
            plan: plan.clone(),
            succeeded: false,
            backup_created_at: None,
            applied: Vec::new(),
            failed_step: None,
            error: None,
            backup_available: false,
        };

        if plan.dry_run {
            info!(
                current = %plan.current_migration,
                target = %plan.target_migration,
                steps = plan.steps.len(),
                "Migration rollback dry run"
            );
            result.succeeded = true;
            return result;
        }

        if plan.steps.is_empty() {
            info!(revision = %plan.current_migration, "Schema already at target revision");
            result.succeeded = true;
            return result;
        }

        if options.backup_before_rollback {
            match self.bounded("backup", self.backend.create_backup()).await {
                Ok(backup_id) => {
                    info!(backup_id = %backup_id, "Database backup created before downgrade");
                    plan.backup_id = Some(backup_id);
                    result.backup_created_at = Some(Utc::now());
                    result.backup_available = true;
                }
                Err(e) => {
                    error!(error = %e, "Backup failed, downgrade not started");
                    result.error = Some(format!("backup failed: {}", e));
                    result.plan = plan;
                    return result;
                }
            }
        }

        for step in &plan.steps {
            match self
                .bounded("downgrade step", self.backend.apply_downgrade(step))
                .await
            {
                Ok(()) => {
                    info!(from = %step.from, to = %step.to, "Applied downgrade step");
                    result.applied.push(AppliedStep {
                        step: step.clone(),
                        applied_at: Utc::now(),
                    });
                }
                Err(e) => {
                    warn!(
                        from = %step.from,
                        to = %step.to,
                        error = %e,
                        backup_available = result.backup_available,
                        "Downgrade step failed, halting"
                    );
                    result.failed_step = Some(step.clone());
                    result.error = Some(e.to_string());
                    result.plan = plan;
                    return result;
                }
            }
        }

        result.succeeded = true;
        result.plan = plan;
        result
    }
}
