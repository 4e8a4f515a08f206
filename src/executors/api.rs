//! API services: a function behind a gateway, addressed through an alias.

use tracing::{info, warn};

use super::{ExecutionRequest, RollbackOutcome, ServiceExecutors};
use crate::cache::CacheType;
use crate::error::RollbackError;
use crate::health::ProbeTarget;
use crate::migrations::MigrationExecuteOptions;

pub(super) async fn execute(
    executors: &ServiceExecutors,
    request: &ExecutionRequest,
) -> Result<RollbackOutcome, RollbackError> {
    let target = &request.target;
    let function = target.functions.first().ok_or_else(|| {
        RollbackError::Validation(format!("no function configured for {}", target.key))
    })?;

    let live = executors
        .retrying("get alias", || {
            executors.functions.alias_version(function, &target.alias)
        })
        .await?;

    let versions = executors
        .retrying("list versions", || executors.functions.published_versions(function))
        .await?;
    let published = versions
        .iter()
        .rev()
        .find(|v| v.description == request.target_version)
        .ok_or_else(|| {
            RollbackError::Validation(format!(
                "no published version of {} for release {}",
                function, request.target_version
            ))
        })?;

    if published.version == live {
        info!(function = %function, version = %live, "Alias already points at target version");
    }

    let schema = rollback_schema(executors, request).await?;

    let repointed = executors
        .retrying("update alias", || {
            executors
                .functions
                .update_alias(function, &target.alias, &published.version)
        })
        .await;
    if let Err(e) = repointed {
        // The downgrade already ran; the old schema now serves the new code
        return Err(match schema {
            Some(schema) => RollbackError::PartialFailure(format!(
                "{}, but alias update failed: {}",
                schema, e
            )),
            None => e.into(),
        });
    }
    info!(
        function = %function,
        alias = %target.alias,
        from = %live,
        to = %published.version,
        "Alias repointed"
    );

    if !request.options.skip_cache_invalidation {
        let report = executors
            .invalidate(
                request,
                &[CacheType::ApiGateway, CacheType::Application],
                &executors.settings.api_required_caches,
                false,
            )
            .await;
        if !report.succeeded {
            let failed: Vec<String> = report.unsuccessful().iter().map(|t| t.to_string()).collect();
            let mut detail = format!("cache invalidation incomplete: {}", failed.join(", "));
            if let Some(schema) = &schema {
                detail = format!("{}; {}", schema, detail);
            }
            return Ok(RollbackOutcome::partial(detail));
        }
    }

    if let Some(check) = executors
        .verify(request, ProbeTarget::for_service(target))
        .await
    {
        if !check.is_healthy() {
            return Ok(RollbackOutcome::unhealthy(&check));
        }
    }

    Ok(RollbackOutcome::succeeded())
}

/// Downgrade the schema when the two releases recorded different revisions.
/// Returns a summary of what was applied, if anything.
async fn rollback_schema(
    executors: &ServiceExecutors,
    request: &ExecutionRequest,
) -> Result<Option<String>, RollbackError> {
    let Some(migrations) = &executors.migrations else {
        return Ok(None);
    };
    let key = &request.target.key;

    let from = executors
        .store
        .migration_for(key, &request.from_version)
        .await?;
    let to = executors
        .store
        .migration_for(key, &request.target_version)
        .await?;

    let (Some(from), Some(to)) = (from, to) else {
        return Ok(None);
    };
    if from == to {
        return Ok(None);
    }

    // The live revision comes from the database, not from what was recorded
    let plan = migrations.plan(key, None, Some(&to), None).await?;
    let result = migrations
        .execute(
            plan,
            MigrationExecuteOptions {
                dry_run: false,
                backup_before_rollback: executors.settings.backup_before_migration_rollback,
            },
        )
        .await;

    let backup = result.plan.backup_id.as_deref().unwrap_or("none");
    if result.succeeded {
        if result.applied.is_empty() {
            return Ok(None);
        }
        return Ok(Some(format!(
            "schema downgraded {} -> {} (backup {})",
            result.plan.current_migration, result.plan.target_migration, backup
        )));
    }

    let error = result.error.unwrap_or_else(|| "unknown error".to_string());
    if result.applied.is_empty() {
        Err(RollbackError::Failed(format!(
            "migration rollback failed before any step: {}",
            error
        )))
    } else {
        warn!(
            key = %key,
            applied = result.applied.len(),
            backup_available = result.backup_available,
            "Schema left between revisions"
        );
        Err(RollbackError::PartialFailure(format!(
            "migration rollback halted after {} step(s) (backup {}): {}",
            result.applied.len(),
            backup,
            error
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{request, target, Harness};
    use crate::db::{DeploymentKey, RollbackResult, ServiceAvailability, ServiceType};
    use crate::error::RollbackError;
    use crate::store::StateStore;
    use crate::testing::{FakeCache, FakeMigrations, ScriptedProbe};
    use std::sync::Arc;

    fn api_harness() -> Harness {
        let harness = Harness::new();
        harness.functions.publish("api-fn", &[("1", "v4"), ("2", "v5"), ("3", "v6")]);
        harness.functions.set_alias("api-fn", "live", "3");
        harness
    }

    #[tokio::test]
    async fn test_repoints_alias_and_flushes_caches() {
        let harness = api_harness();
        let executors = harness.executors();

        let outcome = executors
            .execute(&request(target("api", "prod", ServiceType::Api), "v6", "v5"))
            .await
            .unwrap();

        assert_eq!(outcome.result, RollbackResult::Succeeded);
        assert_eq!(outcome.availability, ServiceAvailability::Maintained);
        assert_eq!(harness.functions.alias("api-fn", "live").as_deref(), Some("2"));
        assert_eq!(harness.gateway.calls(), 1);
        assert_eq!(harness.application.calls(), 1);
        assert_eq!(harness.cdn.calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_release_is_validation_error() {
        let harness = api_harness();
        let executors = harness.executors();

        let err = executors
            .execute(&request(target("api", "prod", ServiceType::Api), "v6", "v2"))
            .await
            .unwrap_err();

        assert!(matches!(err, RollbackError::Validation(_)));
        assert_eq!(harness.functions.alias_updates(), 0);
    }

    #[tokio::test]
    async fn test_required_cache_failure_is_partial() {
        let mut harness = api_harness();
        harness.application = Arc::new(FakeCache::failing());
        let executors = harness.executors();

        let outcome = executors
            .execute(&request(target("api", "prod", ServiceType::Api), "v6", "v5"))
            .await
            .unwrap();

        assert_eq!(outcome.result, RollbackResult::Partial);
        assert_eq!(harness.functions.alias("api-fn", "live").as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_unhealthy_after_rollback_interrupts_service() {
        let mut harness = api_harness();
        harness.probe = Arc::new(ScriptedProbe::always(503));
        let executors = harness.executors();

        let outcome = executors
            .execute(&request(target("api", "prod", ServiceType::Api), "v6", "v5"))
            .await
            .unwrap();

        assert_eq!(outcome.result, RollbackResult::Failed);
        assert_eq!(outcome.availability, ServiceAvailability::Interrupted);
    }

    #[tokio::test]
    async fn test_schema_downgraded_with_backup_before_alias_moves() {
        let harness = api_harness();
        let key = DeploymentKey::new("api", "prod");
        harness.store.record_migration(&key, "v5", "0002_pages").await.unwrap();
        harness.store.record_migration(&key, "v6", "0003_ocr").await.unwrap();
        let executors = harness.executors();

        let outcome = executors
            .execute(&request(target("api", "prod", ServiceType::Api), "v6", "v5"))
            .await
            .unwrap();

        assert_eq!(outcome.result, RollbackResult::Succeeded);
        assert_eq!(harness.migrations.current_revision(), "0002_pages");
        assert_eq!(
            harness.migrations.operations().first().map(String::as_str),
            Some("backup")
        );
    }

    #[tokio::test]
    async fn test_failed_migration_stops_before_alias_update() {
        let mut harness = api_harness();
        harness.migrations = Arc::new(
            FakeMigrations::new(
                vec!["0001_init".into(), "0002_pages".into(), "0003_ocr".into()],
                "0003_ocr",
            )
            .failing_on("0002_pages"),
        );
        let key = DeploymentKey::new("api", "prod");
        harness.store.record_migration(&key, "v5", "0001_init").await.unwrap();
        harness.store.record_migration(&key, "v6", "0003_ocr").await.unwrap();
        let executors = harness.executors();

        let err = executors
            .execute(&request(target("api", "prod", ServiceType::Api), "v6", "v5"))
            .await
            .unwrap_err();

        assert!(matches!(err, RollbackError::PartialFailure(_)));
        assert_eq!(harness.functions.alias_updates(), 0);
        assert_eq!(harness.migrations.current_revision(), "0002_pages");
    }

    #[tokio::test]
    async fn test_alias_failure_after_downgrade_is_partial() {
        let harness = api_harness();
        let key = DeploymentKey::new("api", "prod");
        harness.store.record_migration(&key, "v5", "0002_pages").await.unwrap();
        harness.store.record_migration(&key, "v6", "0003_ocr").await.unwrap();
        harness.functions.fail_next_updates(10);
        let executors = harness.executors();

        let err = executors
            .execute(&request(target("api", "prod", ServiceType::Api), "v6", "v5"))
            .await
            .unwrap_err();

        let RollbackError::PartialFailure(detail) = err else {
            panic!("expected a partial failure, got {:?}", err);
        };
        assert!(detail.contains("backup-1"), "{}", detail);
        assert_eq!(harness.migrations.current_revision(), "0002_pages");
        assert_eq!(harness.functions.alias("api-fn", "live").as_deref(), Some("3"));
        assert_eq!(harness.functions.alias_updates(), 3);
    }

    #[tokio::test]
    async fn test_alias_failure_without_schema_change_is_plain_error() {
        let harness = api_harness();
        harness.functions.fail_next_updates(10);
        let executors = harness.executors();

        let err = executors
            .execute(&request(target("api", "prod", ServiceType::Api), "v6", "v5"))
            .await
            .unwrap_err();

        assert!(matches!(err, RollbackError::Transient(_)));
        assert_eq!(harness.migrations.operations(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn test_downgrade_starts_from_live_schema_revision() {
        let mut harness = api_harness();
        // Database drifted back to 0002 although v6 recorded 0003
        harness.migrations = Arc::new(FakeMigrations::new(
            vec!["0001_init".into(), "0002_pages".into(), "0003_ocr".into()],
            "0002_pages",
        ));
        let key = DeploymentKey::new("api", "prod");
        harness.store.record_migration(&key, "v5", "0001_init").await.unwrap();
        harness.store.record_migration(&key, "v6", "0003_ocr").await.unwrap();
        let executors = harness.executors();

        let outcome = executors
            .execute(&request(target("api", "prod", ServiceType::Api), "v6", "v5"))
            .await
            .unwrap();

        assert_eq!(outcome.result, RollbackResult::Succeeded);
        assert_eq!(
            harness.migrations.operations(),
            vec!["backup".to_string(), "downgrade 0002_pages->0001_init".to_string()]
        );
    }

    #[tokio::test]
    async fn test_skipping_caches_and_checks() {
        let mut harness = api_harness();
        harness.probe = Arc::new(ScriptedProbe::always(503));
        let executors = harness.executors();

        let mut req = request(target("api", "prod", ServiceType::Api), "v6", "v5");
        req.options.skip_cache_invalidation = true;
        req.options.skip_health_checks = true;
        let outcome = executors.execute(&req).await.unwrap();

        assert_eq!(outcome.result, RollbackResult::Succeeded);
        assert_eq!(harness.gateway.calls(), 0);
        assert_eq!(harness.probe.calls(), 0);
    }
}
