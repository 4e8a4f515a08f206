//! Service rollback executors.
//!
//! One strategy per [`ServiceType`], selected by a closed match. Executors
//! mutate external systems, so once a step has been applied it stands; the
//! outcome reports `partial` when traffic already moved but a later step
//! failed.

mod api;
mod lambda;
mod web;

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::backends::{FunctionBackend, SnapshotStorage};
use crate::cache::{CacheInvalidationCoordinator, CacheType, InvalidationReport};
use crate::config::{Config, ServiceTarget};
use crate::db::{RollbackResult, ServiceAvailability, ServiceType};
use crate::error::{BackendError, RollbackError};
use crate::health::{HealthCheckConfig, HealthCheckResult, HealthMonitor, ProbeTarget};
use crate::migrations::MigrationRollbackCoordinator;
use crate::store::StateStore;

/// Steps a caller may skip. Already-applied changes are never undone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollbackOptions {
    pub skip_health_checks: bool,
    pub skip_cache_invalidation: bool,
}

/// One rollback to execute
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub target: ServiceTarget,
    pub from_version: String,
    pub target_version: String,
    /// Release recorded before `from_version`, if any
    pub previous_version: Option<String>,
    pub options: RollbackOptions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackOutcome {
    pub result: RollbackResult,
    pub availability: ServiceAvailability,
    /// Traffic now reaches the target version
    pub traffic_shifted: bool,
    pub detail: Option<String>,
}

impl RollbackOutcome {
    pub fn succeeded() -> Self {
        Self {
            result: RollbackResult::Succeeded,
            availability: ServiceAvailability::Maintained,
            traffic_shifted: true,
            detail: None,
        }
    }

    /// Traffic moved, but a later step did not complete
    pub fn partial(detail: impl Into<String>) -> Self {
        Self {
            result: RollbackResult::Partial,
            availability: ServiceAvailability::Maintained,
            traffic_shifted: true,
            detail: Some(detail.into()),
        }
    }

    /// Nothing reached the target version
    pub fn failed(result: RollbackResult, detail: impl Into<String>) -> Self {
        Self {
            result,
            availability: ServiceAvailability::Maintained,
            traffic_shifted: false,
            detail: Some(detail.into()),
        }
    }

    /// The rolled-back version failed its post-rollback health check
    pub fn unhealthy(check: &HealthCheckResult) -> Self {
        Self {
            result: RollbackResult::Failed,
            availability: ServiceAvailability::Interrupted,
            traffic_shifted: true,
            detail: Some(format!(
                "post-rollback health check failed for {}: {}",
                check.target,
                check.last_error.as_deref().unwrap_or("unhealthy")
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub transient_retries: u32,
    pub retry_backoff: Duration,
    pub backup_before_migration_rollback: bool,
    pub api_required_caches: HashSet<CacheType>,
    pub health: HealthCheckConfig,
}

impl ExecutorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            transient_retries: config.rollback.transient_retries,
            retry_backoff: Duration::from_millis(config.rollback.retry_backoff_ms),
            backup_before_migration_rollback: config.rollback.backup_before_migration_rollback,
            api_required_caches: config.rollback.api_required_caches.iter().copied().collect(),
            health: HealthCheckConfig::from_health_config(&config.health),
        }
    }
}

/// Collaborators shared by every strategy
pub struct ServiceExecutors {
    pub(crate) functions: Arc<dyn FunctionBackend>,
    pub(crate) storage: Arc<dyn SnapshotStorage>,
    pub(crate) caches: Arc<CacheInvalidationCoordinator>,
    pub(crate) migrations: Option<Arc<MigrationRollbackCoordinator>>,
    pub(crate) health: Arc<HealthMonitor>,
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) settings: ExecutorSettings,
}

impl ServiceExecutors {
    pub fn new(
        functions: Arc<dyn FunctionBackend>,
        storage: Arc<dyn SnapshotStorage>,
        caches: Arc<CacheInvalidationCoordinator>,
        migrations: Option<Arc<MigrationRollbackCoordinator>>,
        health: Arc<HealthMonitor>,
        store: Arc<dyn StateStore>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            functions,
            storage,
            caches,
            migrations,
            health,
            store,
            settings,
        }
    }

    pub fn health_monitor(&self) -> Arc<HealthMonitor> {
        self.health.clone()
    }

    pub fn health_config_for(&self, target: &ServiceTarget) -> HealthCheckConfig {
        self.settings
            .health
            .clone()
            .with_custom_validation(target.custom_validation.clone())
    }

    /// Dispatch to the strategy for the target's service type
    pub async fn execute(&self, request: &ExecutionRequest) -> Result<RollbackOutcome, RollbackError> {
        info!(
            service = %request.target.key.service,
            environment = %request.target.key.environment,
            service_type = %request.target.service_type,
            from = %request.from_version,
            to = %request.target_version,
            "Executing rollback"
        );

        match request.target.service_type {
            ServiceType::Api => api::execute(self, request).await,
            ServiceType::Web => web::execute(self, request).await,
            ServiceType::Lambda => lambda::execute(self, request).await,
            ServiceType::Infrastructure => {
                Err(RollbackError::ManualReviewRequired(request.target.key.clone()))
            }
        }
    }

    /// Retry an external call on transient errors only
    pub(crate) async fn retrying<T, F, Fut>(&self, what: &str, mut call: F) -> Result<T, BackendError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.settings.transient_retries => {
                    attempt += 1;
                    warn!(
                        operation = %what,
                        attempt,
                        max_retries = self.settings.transient_retries,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(self.settings.retry_backoff * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub(crate) async fn invalidate(
        &self,
        request: &ExecutionRequest,
        cache_types: &[CacheType],
        required: &HashSet<CacheType>,
        wait_for_completion: bool,
    ) -> InvalidationReport {
        let types: HashSet<CacheType> = cache_types.iter().copied().collect();
        self.caches
            .invalidate(
                &request.target.key.environment,
                &types,
                required,
                wait_for_completion,
            )
            .await
    }

    /// Post-rollback probe; `None` when skipped or nothing is probeable
    pub(crate) async fn verify(
        &self,
        request: &ExecutionRequest,
        probe: Option<ProbeTarget>,
    ) -> Option<HealthCheckResult> {
        if request.options.skip_health_checks {
            info!(key = %request.target.key, "Post-rollback health check skipped");
            return None;
        }
        let Some(probe) = probe else {
            warn!(key = %request.target.key, "No probe target configured, skipping post-rollback check");
            return None;
        };
        let config = self.health_config_for(&request.target);
        Some(
            self.health
                .check_health(request.target.service_type, &probe, &config)
                .await,
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cache::CacheTimeouts;
    use crate::config::EnvironmentConfig;
    use crate::db::DeploymentKey;
    use crate::store::MemoryStateStore;
    use crate::testing::{FakeCache, FakeFunctions, FakeMigrations, FakeStorage, ScriptedProbe};

    /// Collaborators wired to fakes, kept around for assertions
    pub(crate) struct Harness {
        pub functions: Arc<FakeFunctions>,
        pub storage: Arc<FakeStorage>,
        pub cdn: Arc<FakeCache>,
        pub gateway: Arc<FakeCache>,
        pub application: Arc<FakeCache>,
        pub migrations: Arc<FakeMigrations>,
        pub probe: Arc<ScriptedProbe>,
        pub store: Arc<MemoryStateStore>,
    }

    impl Harness {
        pub fn new() -> Self {
            Self {
                functions: Arc::new(FakeFunctions::new()),
                storage: Arc::new(FakeStorage::default()),
                cdn: Arc::new(FakeCache::pending_then_complete(1)),
                gateway: Arc::new(FakeCache::completed()),
                application: Arc::new(FakeCache::completed()),
                migrations: Arc::new(FakeMigrations::new(
                    vec!["0001_init".into(), "0002_pages".into(), "0003_ocr".into()],
                    "0003_ocr",
                )),
                probe: Arc::new(ScriptedProbe::always(200)),
                store: Arc::new(MemoryStateStore::new()),
            }
        }

        pub fn executors(&self) -> ServiceExecutors {
            let caches = CacheInvalidationCoordinator::new(CacheTimeouts {
                cdn_wait: Duration::from_millis(200),
                cdn_poll_interval: Duration::from_millis(5),
                sync: Duration::from_millis(200),
                application: Duration::from_millis(200),
            })
            .with_backend(CacheType::Cdn, self.cdn.clone())
            .with_backend(CacheType::ApiGateway, self.gateway.clone())
            .with_backend(CacheType::Application, self.application.clone());

            let migrations = MigrationRollbackCoordinator::new(
                self.migrations.clone(),
                self.store.clone(),
                Duration::from_secs(1),
            );

            ServiceExecutors::new(
                self.functions.clone(),
                self.storage.clone(),
                Arc::new(caches),
                Some(Arc::new(migrations)),
                Arc::new(HealthMonitor::new(self.probe.clone())),
                self.store.clone(),
                ExecutorSettings {
                    transient_retries: 2,
                    retry_backoff: Duration::from_millis(1),
                    backup_before_migration_rollback: true,
                    api_required_caches: [CacheType::ApiGateway, CacheType::Application]
                        .into_iter()
                        .collect(),
                    health: HealthCheckConfig {
                        expected_status: 200,
                        timeout: Duration::from_millis(100),
                        max_retries: 2,
                        retry_delay: Duration::from_millis(1),
                        custom_validation: None,
                    },
                },
            )
        }
    }

    pub(crate) fn target(service: &str, env: &str, service_type: ServiceType) -> ServiceTarget {
        ServiceTarget {
            key: DeploymentKey::new(service, env),
            service_type,
            alias: "live".to_string(),
            functions: vec![format!("{}-fn", service)],
            custom_validation: None,
            environment: EnvironmentConfig {
                health_url: Some(format!("https://{}.example.com/health", service)),
                snapshot_bucket: Some("snapshots".to_string()),
                serving_bucket: Some("serving".to_string()),
            },
        }
    }

    pub(crate) fn request(target: ServiceTarget, from: &str, to: &str) -> ExecutionRequest {
        ExecutionRequest {
            target,
            from_version: from.to_string(),
            target_version: to.to_string(),
            previous_version: None,
            options: RollbackOptions::default(),
        }
    }

    #[tokio::test]
    async fn test_retrying_gives_up_after_budget() {
        let harness = Harness::new();
        let executors = harness.executors();
        let calls = std::sync::atomic::AtomicU32::new(0);

        let result: Result<(), BackendError> = executors
            .retrying("flaky", || {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async { Err(BackendError::Transient("throttled".into())) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_validation_errors_are_not_retried() {
        let harness = Harness::new();
        let executors = harness.executors();
        let calls = std::sync::atomic::AtomicU32::new(0);

        let result: Result<(), BackendError> = executors
            .retrying("missing", || {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async { Err(BackendError::Validation("no such version".into())) }
            })
            .await;

        assert!(matches!(result, Err(BackendError::Validation(_))));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_infrastructure_requires_manual_review() {
        let harness = Harness::new();
        let executors = harness.executors();
        let req = request(target("network", "prod", ServiceType::Infrastructure), "v2", "v1");

        let err = executors.execute(&req).await.unwrap_err();
        assert!(matches!(err, RollbackError::ManualReviewRequired(_)));
    }
}
