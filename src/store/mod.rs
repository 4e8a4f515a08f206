//! Deployment state store.
//!
//! The store is the only place cross-component state lives. Records are
//! partitioned by (service, environment) and every mutation is conditional on
//! the record's concurrency token, so the store doubles as the per-key mutex
//! that keeps at most one rollback in flight.

mod memory;
mod sqlite;

pub use memory::MemoryStateStore;
pub use sqlite::SqliteStateStore;

use async_trait::async_trait;

use crate::db::{DeploymentKey, DeploymentRecord, RollbackEvent};
use crate::error::StoreError;

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Fetch the record for a key, including its rollback history
    async fn get(&self, key: &DeploymentKey) -> Result<DeploymentRecord, StoreError>;

    /// Insert the first record for a key. Fails with `AlreadyExists` if a
    /// concurrent caller created it first.
    async fn create(&self, record: &DeploymentRecord) -> Result<DeploymentRecord, StoreError>;

    /// Replace the mutable fields of a record if its stored token still
    /// equals `expected_token`. Returns the stored record with its new token.
    async fn update(
        &self,
        record: &DeploymentRecord,
        expected_token: i64,
    ) -> Result<DeploymentRecord, StoreError>;

    /// Atomically promote `new_version` to current and mark the record stable.
    /// Creates the record if the key has never been deployed.
    async fn reset(
        &self,
        key: &DeploymentKey,
        new_version: &str,
    ) -> Result<DeploymentRecord, StoreError>;

    /// Append to a record's rollback history. History is append-only and does
    /// not bump the record's token.
    async fn append_rollback_event(
        &self,
        key: &DeploymentKey,
        event: &RollbackEvent,
    ) -> Result<(), StoreError>;

    async fn list(&self) -> Result<Vec<DeploymentRecord>, StoreError>;

    /// Remember which schema revision a release was deployed with
    async fn record_migration(
        &self,
        key: &DeploymentKey,
        release: &str,
        migration: &str,
    ) -> Result<(), StoreError>;

    async fn migration_for(
        &self,
        key: &DeploymentKey,
        release: &str,
    ) -> Result<Option<String>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{
        DeploymentStatus, RollbackResult, ServiceAvailability, TriggeredBy,
    };
    use chrono::Utc;

    async fn stores() -> Vec<Box<dyn StateStore>> {
        let pool = crate::db::init_in_memory().await.unwrap();
        vec![
            Box::new(MemoryStateStore::new()),
            Box::new(SqliteStateStore::new(pool)),
        ]
    }

    fn event(from: &str, to: &str) -> RollbackEvent {
        RollbackEvent {
            id: uuid::Uuid::new_v4().to_string(),
            triggered_by: TriggeredBy::Automatic,
            reason: "health checks failing".to_string(),
            from_version: from.to_string(),
            to_version: to.to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            outcome: RollbackResult::Succeeded,
            service_availability: ServiceAvailability::Maintained,
        }
    }

    #[tokio::test]
    async fn test_reset_twice_rotates_versions() {
        for store in stores().await {
            let key = DeploymentKey::new("api", "prod");
            store.reset(&key, "v1").await.unwrap();
            let record = store.reset(&key, "v2").await.unwrap();

            assert_eq!(record.current_version, "v2");
            assert_eq!(record.previous_version.as_deref(), Some("v1"));
            assert_eq!(record.status, DeploymentStatus::Stable);
            assert_eq!(record.consecutive_failures, 0);
            assert_eq!(store.list().await.unwrap().len(), 1);
        }
    }

    #[tokio::test]
    async fn test_get_missing_record_is_not_found() {
        for store in stores().await {
            let err = store.get(&DeploymentKey::new("web", "dev")).await.unwrap_err();
            assert!(matches!(err, StoreError::NotFound(_)));
        }
    }

    #[tokio::test]
    async fn test_update_with_stale_token_conflicts() {
        for store in stores().await {
            let key = DeploymentKey::new("api", "staging");
            let record = store.reset(&key, "v1").await.unwrap();

            let mut first = record.clone();
            first.status = DeploymentStatus::RollingBack;
            let stored = store.update(&first, record.version).await.unwrap();
            assert_eq!(stored.version, record.version + 1);

            let mut second = record.clone();
            second.status = DeploymentStatus::RollingBack;
            let err = store.update(&second, record.version).await.unwrap_err();
            assert!(matches!(err, StoreError::Conflict { .. }));
        }
    }

    #[tokio::test]
    async fn test_create_refuses_duplicate_key() {
        for store in stores().await {
            let key = DeploymentKey::new("lambda", "prod");
            let record = DeploymentRecord::first_deployment(&key, "v1", DeploymentStatus::Deploying);
            store.create(&record).await.unwrap();
            let err = store.create(&record).await.unwrap_err();
            assert!(matches!(err, StoreError::AlreadyExists(_)));
        }
    }

    #[tokio::test]
    async fn test_rollback_history_is_ordered_and_survives_updates() {
        for store in stores().await {
            let key = DeploymentKey::new("api", "prod");
            let record = store.reset(&key, "v5").await.unwrap();
            store.append_rollback_event(&key, &event("v6", "v5")).await.unwrap();
            store.append_rollback_event(&key, &event("v7", "v5")).await.unwrap();

            let mut changed = store.get(&key).await.unwrap();
            changed.consecutive_failures = 1;
            store.update(&changed, record.version).await.unwrap();

            let history = store.get(&key).await.unwrap().rollback_history;
            assert_eq!(history.len(), 2);
            assert_eq!(history[0].from_version, "v6");
            assert_eq!(history[1].from_version, "v7");
        }
    }

    #[tokio::test]
    async fn test_release_migration_lookup() {
        for store in stores().await {
            let key = DeploymentKey::new("api", "prod");
            store.reset(&key, "v5").await.unwrap();
            store.record_migration(&key, "v5", "0042_add_pages").await.unwrap();

            assert_eq!(
                store.migration_for(&key, "v5").await.unwrap().as_deref(),
                Some("0042_add_pages")
            );
            assert!(store.migration_for(&key, "v4").await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_sqlite_concurrent_updates_have_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::init(dir.path()).await.unwrap();
        let store = std::sync::Arc::new(SqliteStateStore::new(pool));
        let key = DeploymentKey::new("api", "prod");
        let record = store.reset(&key, "v1").await.unwrap();
        let token = record.version;

        let writers = (0..8).map(|i| {
            let store = store.clone();
            let mut attempt = record.clone();
            attempt.status = DeploymentStatus::RollingBack;
            attempt.unacknowledged_failure = Some(format!("writer {}", i));
            tokio::spawn(async move { store.update(&attempt, token).await })
        });
        let results: Vec<_> = futures::future::join_all(writers)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(StoreError::Conflict { .. })))
            .count();
        assert_eq!(winners.len(), 1);
        assert_eq!(conflicts, 7);

        let stored = store.get(&key).await.unwrap();
        assert_eq!(stored.version, token + 1);
        assert_eq!(stored.unacknowledged_failure, winners[0].unacknowledged_failure);
    }
}
