//! Rollback decision engine.
//!
//! Owns the deployment state machine. Health verdicts, deployment
//! notifications and rollback triggers all become conditional writes against
//! the state store; entering `RollingBack` is the CAS that guarantees at most
//! one rollback per (service, environment).

mod worker;

pub use worker::{JobHandle, RollbackQueue, RollbackWorker};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::{Config, RollbackConfig, ServiceTarget};
use crate::db::{
    DeploymentKey, DeploymentRecord, DeploymentStatus, NotificationEventType, RollbackEvent,
    RollbackResult, ServiceType, TriggeredBy,
};
use crate::error::{RollbackError, StoreError};
use crate::executors::{ExecutionRequest, RollbackOptions, RollbackOutcome, ServiceExecutors};
use crate::health::{self, HealthCheckResult, HealthStatus, ProbeTarget};
use crate::notifications::{NotificationEvent, NotificationService};
use crate::store::StateStore;

/// Which stored version a rollback returns to when no override is given
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackTarget {
    /// The version deployed immediately before the current one
    #[default]
    Previous,
    /// The last version that reached `Stable` or was rolled back to
    LastHealthy,
}

#[derive(Debug, Clone)]
pub struct RollbackRequest {
    pub key: DeploymentKey,
    pub target: RollbackTarget,
    /// Operator-supplied version, overriding `target`
    pub target_version: Option<String>,
    pub reason: String,
    pub triggered_by: TriggeredBy,
    pub options: RollbackOptions,
}

impl RollbackRequest {
    pub fn manual(key: DeploymentKey, reason: impl Into<String>) -> Self {
        Self {
            key,
            target: RollbackTarget::Previous,
            target_version: None,
            reason: reason.into(),
            triggered_by: TriggeredBy::Manual,
            options: RollbackOptions::default(),
        }
    }

    fn automatic(key: DeploymentKey, reason: String) -> Self {
        Self {
            triggered_by: TriggeredBy::Automatic,
            ..Self::manual(key, reason)
        }
    }
}

#[derive(Debug, Clone)]
pub enum RollbackReport {
    /// The executor ran; the event holds its outcome
    Completed {
        record: DeploymentRecord,
        event: RollbackEvent,
    },
    /// Another rollback for the key is already running
    AlreadyInProgress(DeploymentKey),
    /// Infrastructure rollback parked for manual review
    Blocked(DeploymentRecord),
    /// An armed rollback had no usable target; the record was failed
    Aborted(DeploymentRecord),
}

impl RollbackReport {
    pub fn succeeded(&self) -> bool {
        matches!(self, Self::Completed { event, .. } if event.outcome == RollbackResult::Succeeded)
    }
}

/// What a single health verdict did to the record
#[derive(Debug, Clone)]
pub enum HealthDecision {
    /// Record was not being monitored, or the verdict was unknown
    Ignored,
    Recorded { consecutive_failures: u32 },
    Stabilized,
    /// Threshold reached while health-triggered rollbacks are disabled
    Suppressed { consecutive_failures: u32 },
    RolledBack(Box<RollbackReport>),
}

pub struct RollbackEngine {
    config: Arc<Config>,
    store: Arc<dyn StateStore>,
    executors: Arc<ServiceExecutors>,
    notifications: Arc<NotificationService>,
}

impl RollbackEngine {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn StateStore>,
        executors: Arc<ServiceExecutors>,
        notifications: Arc<NotificationService>,
    ) -> Self {
        Self {
            config,
            store,
            executors,
            notifications,
        }
    }

    fn settings(&self) -> &RollbackConfig {
        &self.config.rollback
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn record(&self, key: &DeploymentKey) -> Result<DeploymentRecord, RollbackError> {
        Ok(self.store.get(key).await?)
    }

    pub async fn records(&self) -> Result<Vec<DeploymentRecord>, RollbackError> {
        Ok(self.store.list().await?)
    }

    async fn notify(
        &self,
        event_type: NotificationEventType,
        key: &DeploymentKey,
        version: Option<&str>,
        reason: impl Into<String>,
    ) {
        let event = NotificationEvent::new(event_type, key, version, reason);
        self.notifications.send(&event).await;
    }

    /// Read-modify-write with re-read on conflict. `apply` returns false when
    /// the record needs no write.
    async fn modify<F>(&self, key: &DeploymentKey, mut apply: F) -> Result<DeploymentRecord, RollbackError>
    where
        F: FnMut(&mut DeploymentRecord) -> Result<bool, RollbackError>,
    {
        let mut conflicts = 0;
        loop {
            let mut record = self.store.get(key).await?;
            let token = record.version;
            if !apply(&mut record)? {
                return Ok(record);
            }
            record.updated_at = Utc::now();

            match self.store.update(&record, token).await {
                Ok(stored) => return Ok(stored),
                Err(StoreError::Conflict { .. }) if conflicts < self.settings().conflict_retries => {
                    conflicts += 1;
                    debug!(key = %key, attempt = conflicts, "Record changed concurrently, re-reading");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// A new version is being rolled out. Creates the record on first
    /// deployment, otherwise rotates current into previous.
    pub async fn begin_deployment(
        &self,
        key: &DeploymentKey,
        version: &str,
        skip_health_checks: bool,
        migration: Option<&str>,
    ) -> Result<DeploymentRecord, RollbackError> {
        self.config.resolve_target(key)?;

        if let Some(migration) = migration {
            self.store.record_migration(key, version, migration).await?;
        }

        let record = match self.store.get(key).await {
            Err(StoreError::NotFound(_)) => {
                let mut record =
                    DeploymentRecord::first_deployment(key, version, DeploymentStatus::Deploying);
                record.skip_health_checks = skip_health_checks;
                match self.store.create(&record).await {
                    Ok(stored) => Some(stored),
                    Err(StoreError::AlreadyExists(_)) => None,
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(_) => None,
            Err(e) => return Err(e.into()),
        };

        let record = match record {
            Some(record) => record,
            None => {
                self.modify(key, |record| {
                    if !record.status.can_transition_to(DeploymentStatus::Deploying) {
                        return Err(RollbackError::Validation(format!(
                            "{} is {}; deployment refused",
                            key, record.status
                        )));
                    }
                    record.rotate(version);
                    record.status = DeploymentStatus::Deploying;
                    record.skip_health_checks = skip_health_checks;
                    record.last_health_check_at = None;
                    Ok(true)
                })
                .await?
            }
        };

        info!(
            key = %key,
            version = %version,
            previous = record.previous_version.as_deref().unwrap_or("-"),
            skip_health_checks,
            "Deployment started"
        );
        self.notify(NotificationEventType::Start, key, Some(version), "deployment started")
            .await;
        Ok(record)
    }

    /// The deployment pipeline reports the new version live
    pub async fn mark_live(&self, key: &DeploymentKey) -> Result<DeploymentRecord, RollbackError> {
        let record = self
            .modify(key, |record| {
                if record.status != DeploymentStatus::Deploying {
                    return Err(RollbackError::Validation(format!(
                        "{} is {}, not deploying",
                        key, record.status
                    )));
                }
                if record.skip_health_checks {
                    record.status = DeploymentStatus::Stable;
                    record.last_healthy_version = Some(record.current_version.clone());
                } else {
                    record.status = DeploymentStatus::Monitoring;
                }
                Ok(true)
            })
            .await?;

        if record.status == DeploymentStatus::Stable {
            warn!(key = %key, version = %record.current_version, "Health checks skipped, marked stable");
            self.notify(
                NotificationEventType::Success,
                key,
                Some(&record.current_version),
                "deployed with health checks skipped",
            )
            .await;
        } else {
            info!(key = %key, version = %record.current_version, "Deployment live, monitoring");
        }
        Ok(record)
    }

    /// Fold one health verdict into the record and act on the result
    pub async fn record_health(
        &self,
        key: &DeploymentKey,
        result: &HealthCheckResult,
    ) -> Result<HealthDecision, RollbackError> {
        if result.status == HealthStatus::Unknown {
            return Ok(HealthDecision::Ignored);
        }

        let threshold = self.settings().failure_threshold;
        let to_stable = self.settings().healthy_checks_to_stable.max(1);
        let mut monitored = false;

        let record = self
            .modify(key, |record| {
                monitored = record.status == DeploymentStatus::Monitoring;
                if !monitored {
                    return Ok(false);
                }
                record.last_health_check_at = Some(result.checked_at);

                if result.is_healthy() {
                    record.consecutive_failures = 0;
                    record.consecutive_successes += 1;
                    if record.consecutive_successes >= to_stable {
                        record.status = DeploymentStatus::Stable;
                        record.last_healthy_version = Some(record.current_version.clone());
                    }
                } else {
                    record.consecutive_successes = 0;
                    record.consecutive_failures += 1;
                    if record.consecutive_failures >= threshold && !record.skip_health_checks {
                        record.status = DeploymentStatus::RollbackTriggered;
                    }
                }
                Ok(true)
            })
            .await?;

        if !monitored {
            debug!(key = %key, status = %record.status, "Health verdict ignored outside monitoring");
            return Ok(HealthDecision::Ignored);
        }

        match record.status {
            DeploymentStatus::Stable => {
                info!(key = %key, version = %record.current_version, "Deployment stable");
                self.notify(
                    NotificationEventType::Success,
                    key,
                    Some(&record.current_version),
                    "deployment passed health checks",
                )
                .await;
                Ok(HealthDecision::Stabilized)
            }
            DeploymentStatus::RollbackTriggered => {
                let reason = format!(
                    "{} consecutive failed health checks: {}",
                    record.consecutive_failures,
                    result.last_error.as_deref().unwrap_or("unhealthy")
                );
                warn!(key = %key, version = %record.current_version, reason = %reason, "Automatic rollback triggered");
                let report = self
                    .trigger_rollback(RollbackRequest::automatic(key.clone(), reason))
                    .await?;
                Ok(HealthDecision::RolledBack(Box::new(report)))
            }
            _ if record.consecutive_failures >= threshold => {
                warn!(
                    key = %key,
                    failures = record.consecutive_failures,
                    "Failure threshold reached but health-triggered rollback is disabled"
                );
                self.notify(
                    NotificationEventType::Failure,
                    key,
                    Some(&record.current_version),
                    format!(
                        "{} consecutive failed health checks; automatic rollback skipped",
                        record.consecutive_failures
                    ),
                )
                .await;
                Ok(HealthDecision::Suppressed {
                    consecutive_failures: record.consecutive_failures,
                })
            }
            _ => Ok(HealthDecision::Recorded {
                consecutive_failures: record.consecutive_failures,
            }),
        }
    }

    /// Probe a monitored target once and record the verdict
    pub async fn poll(&self, target: &ServiceTarget) -> Result<HealthDecision, RollbackError> {
        let record = self.store.get(&target.key).await?;
        if record.status != DeploymentStatus::Monitoring {
            return Ok(HealthDecision::Ignored);
        }
        let Some(probe) = ProbeTarget::for_service(target) else {
            return Ok(HealthDecision::Ignored);
        };

        let config = self.executors.health_config_for(target);
        let result = self
            .executors
            .health_monitor()
            .check_health(target.service_type, &probe, &config)
            .await;
        health::log_result(&target.key.service, &target.key.environment, &result);
        self.record_health(&target.key, &result).await
    }

    fn resolve_version(record: &DeploymentRecord, request: &RollbackRequest) -> Result<String, RollbackError> {
        let version = match (&request.target_version, request.target) {
            (Some(version), _) => Some(version.clone()),
            (None, RollbackTarget::Previous) => record.previous_version.clone(),
            (None, RollbackTarget::LastHealthy) => record.last_healthy_version.clone(),
        };
        let version = version.ok_or_else(|| {
            RollbackError::Validation(format!(
                "{} has no {} version to roll back to",
                record.key(),
                match request.target {
                    RollbackTarget::Previous => "previous",
                    RollbackTarget::LastHealthy => "last healthy",
                }
            ))
        })?;
        if version == record.current_version {
            return Err(RollbackError::Validation(format!(
                "{} is already at version {}",
                record.key(),
                version
            )));
        }
        Ok(version)
    }

    /// Roll a service back. Duplicate triggers while a rollback is running
    /// are no-ops reported as `AlreadyInProgress`.
    pub async fn trigger_rollback(&self, request: RollbackRequest) -> Result<RollbackReport, RollbackError> {
        let key = &request.key;
        let target = self.config.resolve_target(key)?;

        if target.service_type == ServiceType::Infrastructure {
            return self.block(&request).await;
        }

        let mut conflicts = 0;
        let (record, target_version) = loop {
            let mut record = self.store.get(key).await?;
            if record.status == DeploymentStatus::RollingBack {
                info!(key = %key, "Rollback already in progress");
                return Ok(RollbackReport::AlreadyInProgress(key.clone()));
            }
            if request.triggered_by == TriggeredBy::Automatic
                && record.status != DeploymentStatus::RollbackTriggered
            {
                return Err(RollbackError::Validation(format!(
                    "{} is {}, automatic rollback not armed",
                    key, record.status
                )));
            }
            if !record.status.can_transition_to(DeploymentStatus::RollingBack) {
                return Err(RollbackError::Validation(format!(
                    "{} is {}; rollback not allowed",
                    key, record.status
                )));
            }
            let target_version = match Self::resolve_version(&record, &request) {
                Ok(version) => version,
                Err(RollbackError::Validation(reason))
                    if record.status == DeploymentStatus::RollbackTriggered =>
                {
                    return self.abort(key, reason).await;
                }
                Err(e) => return Err(e),
            };

            let token = record.version;
            record.status = DeploymentStatus::RollingBack;
            record.updated_at = Utc::now();
            match self.store.update(&record, token).await {
                Ok(stored) => break (stored, target_version),
                Err(StoreError::Conflict { .. }) if conflicts < self.settings().conflict_retries => {
                    conflicts += 1;
                    debug!(key = %key, attempt = conflicts, "Lost race entering rollback, re-reading");
                }
                Err(e) => return Err(e.into()),
            }
        };

        let from_version = record.current_version.clone();
        info!(
            key = %key,
            from = %from_version,
            to = %target_version,
            triggered_by = %request.triggered_by,
            reason = %request.reason,
            "Rolling back"
        );
        self.notify(
            NotificationEventType::Rollback,
            key,
            Some(&target_version),
            format!("rolling back from {}: {}", from_version, request.reason),
        )
        .await;

        let started_at = Utc::now();
        let execution = ExecutionRequest {
            target,
            from_version: from_version.clone(),
            target_version: target_version.clone(),
            previous_version: record.previous_version.clone(),
            options: request.options,
        };
        let outcome = match self.executors.execute(&execution).await {
            Ok(outcome) => outcome,
            Err(RollbackError::PartialFailure(detail)) => {
                RollbackOutcome::failed(RollbackResult::Partial, detail)
            }
            Err(e) => RollbackOutcome::failed(RollbackResult::Failed, e.to_string()),
        };

        let event = RollbackEvent {
            id: uuid::Uuid::new_v4().to_string(),
            triggered_by: request.triggered_by,
            reason: request.reason.clone(),
            from_version: from_version.clone(),
            to_version: target_version.clone(),
            started_at,
            finished_at: Utc::now(),
            outcome: outcome.result,
            service_availability: outcome.availability,
        };

        // History first: a record must never read as finished without its event
        self.store.append_rollback_event(key, &event).await?;
        let record = self.finish(key, &event, &outcome).await?;

        match outcome.result {
            RollbackResult::Succeeded => {
                info!(
                    key = %key,
                    version = %target_version,
                    detail = outcome.detail.as_deref().unwrap_or("-"),
                    "Rollback succeeded"
                );
                self.notify(
                    NotificationEventType::Success,
                    key,
                    Some(&target_version),
                    format!("rolled back from {}", from_version),
                )
                .await;
            }
            result => {
                let detail = outcome.detail.as_deref().unwrap_or("no detail");
                error!(
                    key = %key,
                    outcome = %result,
                    availability = %outcome.availability,
                    detail = %detail,
                    "Rollback did not complete, manual follow-up required"
                );
                self.notify(
                    NotificationEventType::Failure,
                    key,
                    Some(&target_version),
                    format!("rollback {}: {}", result, detail),
                )
                .await;
            }
        }

        Ok(RollbackReport::Completed { record, event })
    }

    /// Record the terminal state of an execution
    async fn finish(
        &self,
        key: &DeploymentKey,
        event: &RollbackEvent,
        outcome: &RollbackOutcome,
    ) -> Result<DeploymentRecord, RollbackError> {
        self.modify(key, |record| {
            if outcome.traffic_shifted {
                record.previous_version = Some(event.from_version.clone());
                record.current_version = event.to_version.clone();
            }
            record.consecutive_failures = 0;
            record.consecutive_successes = 0;

            if outcome.result == RollbackResult::Succeeded {
                record.status = DeploymentStatus::RolledBack;
                record.last_healthy_version = Some(event.to_version.clone());
            } else {
                record.status = DeploymentStatus::RollbackFailed;
                record.unacknowledged_failure = Some(format!(
                    "rollback {} to {} {}: {}",
                    event.id,
                    event.to_version,
                    outcome.result,
                    outcome.detail.as_deref().unwrap_or("no detail")
                ));
            }
            Ok(true)
        })
        .await
    }

    /// Fail an armed record that has nothing to roll back to
    async fn abort(&self, key: &DeploymentKey, reason: String) -> Result<RollbackReport, RollbackError> {
        let record = self
            .modify(key, |record| {
                if record.status != DeploymentStatus::RollbackTriggered {
                    return Err(RollbackError::Validation(reason.clone()));
                }
                record.status = DeploymentStatus::RollbackFailed;
                record.consecutive_failures = 0;
                record.consecutive_successes = 0;
                record.unacknowledged_failure = Some(format!("rollback aborted: {}", reason));
                Ok(true)
            })
            .await?;

        error!(
            key = %key,
            version = %record.current_version,
            reason = %reason,
            "Rollback aborted, manual follow-up required"
        );
        self.notify(
            NotificationEventType::Failure,
            key,
            Some(&record.current_version),
            format!("rollback aborted: {}", reason),
        )
        .await;
        Ok(RollbackReport::Aborted(record))
    }

    /// Fail a rollback whose process died while `RollingBack`. Only for use
    /// when no executor is still running for the key.
    pub async fn recover(&self, key: &DeploymentKey) -> Result<DeploymentRecord, RollbackError> {
        let record = self
            .modify(key, |record| {
                if record.status != DeploymentStatus::RollingBack {
                    return Err(RollbackError::Validation(format!(
                        "{} is {}, not rolling back",
                        key, record.status
                    )));
                }
                record.status = DeploymentStatus::RollbackFailed;
                record.unacknowledged_failure = Some(format!(
                    "rollback from {} interrupted; external state unverified",
                    record.current_version
                ));
                Ok(true)
            })
            .await?;

        warn!(key = %key, version = %record.current_version, "Interrupted rollback marked failed");
        self.notify(
            NotificationEventType::Failure,
            key,
            Some(&record.current_version),
            "rollback interrupted before completion; verify live versions",
        )
        .await;
        Ok(record)
    }

    /// Infrastructure is never rolled back automatically
    async fn block(&self, request: &RollbackRequest) -> Result<RollbackReport, RollbackError> {
        let key = &request.key;
        let record = self
            .modify(key, |record| {
                if record.status == DeploymentStatus::RollbackBlocked {
                    return Ok(false);
                }
                if !record.status.can_transition_to(DeploymentStatus::RollbackBlocked) {
                    return Err(RollbackError::Validation(format!(
                        "{} is {}; rollback not allowed",
                        key, record.status
                    )));
                }
                record.status = DeploymentStatus::RollbackBlocked;
                Ok(true)
            })
            .await?;

        warn!(key = %key, reason = %request.reason, "Infrastructure rollback requires manual review");
        self.notify(
            NotificationEventType::ApprovalRequired,
            key,
            record.previous_version.as_deref(),
            format!("manual review required: {}", request.reason),
        )
        .await;
        Ok(RollbackReport::Blocked(record))
    }

    /// Clear the failure marker left by a failed or partial rollback
    pub async fn acknowledge(&self, key: &DeploymentKey) -> Result<DeploymentRecord, RollbackError> {
        let mut cleared = None;
        let record = self
            .modify(key, |record| {
                cleared = record.unacknowledged_failure.take();
                Ok(cleared.is_some())
            })
            .await?;

        match cleared {
            Some(failure) => info!(key = %key, failure = %failure, "Rollback failure acknowledged"),
            None => debug!(key = %key, "Nothing to acknowledge"),
        }
        Ok(record)
    }
}
