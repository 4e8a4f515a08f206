use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::StateStore;
use crate::db::{DeploymentKey, DeploymentRecord, DeploymentStatus, RollbackEvent};
use crate::error::StoreError;

/// In-process store; each key's shard lock makes the token check and the
/// write a single atomic step.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    records: DashMap<DeploymentKey, DeploymentRecord>,
    migrations: DashMap<(DeploymentKey, String), String>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &DeploymentKey) -> Result<DeploymentRecord, StoreError> {
        self.records
            .get(key)
            .map(|r| r.clone())
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    async fn create(&self, record: &DeploymentRecord) -> Result<DeploymentRecord, StoreError> {
        match self.records.entry(record.key()) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists(record.key())),
            Entry::Vacant(slot) => {
                let mut stored = record.clone();
                stored.version = 0;
                stored.rollback_history.clear();
                slot.insert(stored.clone());
                Ok(stored)
            }
        }
    }

    async fn update(
        &self,
        record: &DeploymentRecord,
        expected_token: i64,
    ) -> Result<DeploymentRecord, StoreError> {
        let key = record.key();
        let mut entry = self
            .records
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;

        if entry.version != expected_token {
            return Err(StoreError::Conflict {
                key,
                expected: expected_token,
            });
        }

        let mut stored = record.clone();
        stored.version = expected_token + 1;
        stored.updated_at = Utc::now();
        stored.created_at = entry.created_at;
        stored.rollback_history = std::mem::take(&mut entry.rollback_history);
        *entry = stored.clone();
        Ok(stored)
    }

    async fn reset(
        &self,
        key: &DeploymentKey,
        new_version: &str,
    ) -> Result<DeploymentRecord, StoreError> {
        let stored = match self.records.entry(key.clone()) {
            Entry::Occupied(mut slot) => {
                let record = slot.get_mut();
                record.rotate(new_version);
                record.status = DeploymentStatus::Stable;
                record.last_healthy_version = Some(new_version.to_string());
                record.skip_health_checks = false;
                record.version += 1;
                record.updated_at = Utc::now();
                record.clone()
            }
            Entry::Vacant(slot) => {
                let mut record =
                    DeploymentRecord::first_deployment(key, new_version, DeploymentStatus::Stable);
                record.last_healthy_version = Some(new_version.to_string());
                slot.insert(record.clone());
                record
            }
        };
        Ok(stored)
    }

    async fn append_rollback_event(
        &self,
        key: &DeploymentKey,
        event: &RollbackEvent,
    ) -> Result<(), StoreError> {
        let mut entry = self
            .records
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        entry.rollback_history.push(event.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<DeploymentRecord>, StoreError> {
        let mut records: Vec<_> = self.records.iter().map(|r| r.clone()).collect();
        records.sort_by(|a, b| (&a.service, &a.environment).cmp(&(&b.service, &b.environment)));
        Ok(records)
    }

    async fn record_migration(
        &self,
        key: &DeploymentKey,
        release: &str,
        migration: &str,
    ) -> Result<(), StoreError> {
        self.migrations
            .insert((key.clone(), release.to_string()), migration.to_string());
        Ok(())
    }

    async fn migration_for(
        &self,
        key: &DeploymentKey,
        release: &str,
    ) -> Result<Option<String>, StoreError> {
        Ok(self
            .migrations
            .get(&(key.clone(), release.to_string()))
            .map(|m| m.clone()))
    }
}
