use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::FromRow;

use super::StateStore;
use crate::db::{DeploymentKey, DeploymentRecord, RollbackEvent};
use crate::error::StoreError;
use crate::DbPool;

#[derive(Debug, FromRow)]
struct RecordRow {
    service: String,
    environment: String,
    current_version: String,
    previous_version: Option<String>,
    last_healthy_version: Option<String>,
    status: String,
    consecutive_failures: i64,
    consecutive_successes: i64,
    skip_health_checks: i32,
    last_health_check_at: Option<String>,
    unacknowledged_failure: Option<String>,
    version: i64,
    created_at: String,
    updated_at: String,
}

#[derive(Debug, FromRow)]
struct EventRow {
    id: String,
    triggered_by: String,
    reason: String,
    from_version: String,
    to_version: String,
    started_at: String,
    finished_at: String,
    outcome: String,
    service_availability: String,
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("invalid timestamp '{}': {}", value, e)))
}

impl EventRow {
    fn into_event(self) -> Result<RollbackEvent, StoreError> {
        Ok(RollbackEvent {
            triggered_by: self.triggered_by.parse().map_err(StoreError::Corrupt)?,
            outcome: self.outcome.parse().map_err(StoreError::Corrupt)?,
            service_availability: self
                .service_availability
                .parse()
                .map_err(StoreError::Corrupt)?,
            started_at: parse_time(&self.started_at)?,
            finished_at: parse_time(&self.finished_at)?,
            id: self.id,
            reason: self.reason,
            from_version: self.from_version,
            to_version: self.to_version,
        })
    }
}

impl RecordRow {
    fn into_record(self, history: Vec<RollbackEvent>) -> Result<DeploymentRecord, StoreError> {
        Ok(DeploymentRecord {
            status: self.status.parse().map_err(StoreError::Corrupt)?,
            last_health_check_at: self
                .last_health_check_at
                .as_deref()
                .map(parse_time)
                .transpose()?,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
            consecutive_failures: self.consecutive_failures.max(0) as u32,
            consecutive_successes: self.consecutive_successes.max(0) as u32,
            skip_health_checks: self.skip_health_checks != 0,
            service: self.service,
            environment: self.environment,
            current_version: self.current_version,
            previous_version: self.previous_version,
            last_healthy_version: self.last_healthy_version,
            unacknowledged_failure: self.unacknowledged_failure,
            rollback_history: history,
            version: self.version,
        })
    }
}

/// Store backed by the `deployment_records` table; the token check is part of
/// each statement's WHERE clause.
#[derive(Debug, Clone)]
pub struct SqliteStateStore {
    db: DbPool,
}

impl SqliteStateStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    async fn history(&self, key: &DeploymentKey) -> Result<Vec<RollbackEvent>, StoreError> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
            SELECT id, triggered_by, reason, from_version, to_version,
                   started_at, finished_at, outcome, service_availability
            FROM rollback_events
            WHERE service = ? AND environment = ?
            ORDER BY rowid
            "#,
        )
        .bind(&key.service)
        .bind(&key.environment)
        .fetch_all(&self.db)
        .await?;

        rows.into_iter().map(EventRow::into_event).collect()
    }

    async fn exists(&self, key: &DeploymentKey) -> Result<bool, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT version FROM deployment_records WHERE service = ? AND environment = ?",
        )
        .bind(&key.service)
        .bind(&key.environment)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn get(&self, key: &DeploymentKey) -> Result<DeploymentRecord, StoreError> {
        let row: Option<RecordRow> = sqlx::query_as(
            "SELECT * FROM deployment_records WHERE service = ? AND environment = ?",
        )
        .bind(&key.service)
        .bind(&key.environment)
        .fetch_optional(&self.db)
        .await?;

        let row = row.ok_or_else(|| StoreError::NotFound(key.clone()))?;
        let history = self.history(key).await?;
        row.into_record(history)
    }

    async fn create(&self, record: &DeploymentRecord) -> Result<DeploymentRecord, StoreError> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            INSERT INTO deployment_records (
                service, environment, current_version, previous_version,
                last_healthy_version, status, consecutive_failures,
                consecutive_successes, skip_health_checks, last_health_check_at,
                unacknowledged_failure, version, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
            ON CONFLICT(service, environment) DO NOTHING
            "#,
        )
        .bind(&record.service)
        .bind(&record.environment)
        .bind(&record.current_version)
        .bind(&record.previous_version)
        .bind(&record.last_healthy_version)
        .bind(record.status.to_string())
        .bind(record.consecutive_failures as i64)
        .bind(record.consecutive_successes as i64)
        .bind(record.skip_health_checks as i32)
        .bind(record.last_health_check_at.map(|t| t.to_rfc3339()))
        .bind(&record.unacknowledged_failure)
        .bind(&now)
        .bind(&now)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(record.key()));
        }
        self.get(&record.key()).await
    }

    async fn update(
        &self,
        record: &DeploymentRecord,
        expected_token: i64,
    ) -> Result<DeploymentRecord, StoreError> {
        let key = record.key();
        let result = sqlx::query(
            r#"
            UPDATE deployment_records
            SET current_version = ?, previous_version = ?, last_healthy_version = ?,
                status = ?, consecutive_failures = ?, consecutive_successes = ?,
                skip_health_checks = ?, last_health_check_at = ?,
                unacknowledged_failure = ?, version = version + 1, updated_at = ?
            WHERE service = ? AND environment = ? AND version = ?
            "#,
        )
        .bind(&record.current_version)
        .bind(&record.previous_version)
        .bind(&record.last_healthy_version)
        .bind(record.status.to_string())
        .bind(record.consecutive_failures as i64)
        .bind(record.consecutive_successes as i64)
        .bind(record.skip_health_checks as i32)
        .bind(record.last_health_check_at.map(|t| t.to_rfc3339()))
        .bind(&record.unacknowledged_failure)
        .bind(Utc::now().to_rfc3339())
        .bind(&key.service)
        .bind(&key.environment)
        .bind(expected_token)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return if self.exists(&key).await? {
                Err(StoreError::Conflict {
                    key,
                    expected: expected_token,
                })
            } else {
                Err(StoreError::NotFound(key))
            };
        }
        self.get(&key).await
    }

    async fn reset(
        &self,
        key: &DeploymentKey,
        new_version: &str,
    ) -> Result<DeploymentRecord, StoreError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO deployment_records (
                service, environment, current_version, previous_version,
                last_healthy_version, status, consecutive_failures,
                consecutive_successes, skip_health_checks, version, created_at, updated_at
            )
            VALUES (?, ?, ?, NULL, ?, 'stable', 0, 0, 0, 0, ?, ?)
            ON CONFLICT(service, environment) DO UPDATE SET
                previous_version = deployment_records.current_version,
                current_version = excluded.current_version,
                last_healthy_version = excluded.current_version,
                status = 'stable',
                consecutive_failures = 0,
                consecutive_successes = 0,
                skip_health_checks = 0,
                version = deployment_records.version + 1,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&key.service)
        .bind(&key.environment)
        .bind(new_version)
        .bind(new_version)
        .bind(&now)
        .bind(&now)
        .execute(&self.db)
        .await?;

        self.get(key).await
    }

    async fn append_rollback_event(
        &self,
        key: &DeploymentKey,
        event: &RollbackEvent,
    ) -> Result<(), StoreError> {
        if !self.exists(key).await? {
            return Err(StoreError::NotFound(key.clone()));
        }

        sqlx::query(
            r#"
            INSERT INTO rollback_events (
                id, service, environment, triggered_by, reason, from_version,
                to_version, started_at, finished_at, outcome, service_availability
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.id)
        .bind(&key.service)
        .bind(&key.environment)
        .bind(event.triggered_by.to_string())
        .bind(&event.reason)
        .bind(&event.from_version)
        .bind(&event.to_version)
        .bind(event.started_at.to_rfc3339())
        .bind(event.finished_at.to_rfc3339())
        .bind(event.outcome.to_string())
        .bind(event.service_availability.to_string())
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn list(&self) -> Result<Vec<DeploymentRecord>, StoreError> {
        let rows: Vec<RecordRow> =
            sqlx::query_as("SELECT * FROM deployment_records ORDER BY service, environment")
                .fetch_all(&self.db)
                .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let key = DeploymentKey::new(&row.service, &row.environment);
            let history = self.history(&key).await?;
            records.push(row.into_record(history)?);
        }
        Ok(records)
    }

    async fn record_migration(
        &self,
        key: &DeploymentKey,
        release: &str,
        migration: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO release_migrations (service, environment, release_version, migration, recorded_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(service, environment, release_version)
            DO UPDATE SET migration = excluded.migration, recorded_at = excluded.recorded_at
            "#,
        )
        .bind(&key.service)
        .bind(&key.environment)
        .bind(release)
        .bind(migration)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn migration_for(
        &self,
        key: &DeploymentKey,
        release: &str,
    ) -> Result<Option<String>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT migration FROM release_migrations
            WHERE service = ? AND environment = ? AND release_version = ?
            "#,
        )
        .bind(&key.service)
        .bind(&key.environment)
        .bind(release)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(|(m,)| m))
    }
}
