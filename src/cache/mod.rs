//! Cache invalidation coordinator.
//!
//! Fans one invalidation request out to independent cache layers at once and
//! folds the per-layer outcomes into a single report. CDN invalidations are
//! asynchronous and may be awaited up to a bound; the other layers flush
//! synchronously.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::error::BackendError;

/// Pattern that invalidates everything a layer holds
pub const INVALIDATE_ALL: &str = "/*";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CacheType {
    Cdn,
    ApiGateway,
    Redis,
    Application,
}

impl std::fmt::Display for CacheType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cdn => write!(f, "cdn"),
            Self::ApiGateway => write!(f, "api_gateway"),
            Self::Redis => write!(f, "redis"),
            Self::Application => write!(f, "application"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationStatus {
    Succeeded,
    Failed,
    /// CDN propagation did not finish in time; eventually consistent
    TimedOut,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheInvalidationResult {
    pub cache_type: CacheType,
    pub status: InvalidationStatus,
    pub completed_at: DateTime<Utc>,
    pub detail: Option<String>,
}

/// What a cache layer returned when asked to invalidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationTicket {
    Completed,
    /// Asynchronous invalidation; poll with the job id
    Pending(String),
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn invalidate(
        &self,
        environment: &str,
        patterns: &[String],
    ) -> Result<InvalidationTicket, BackendError>;

    /// Whether an asynchronous invalidation has finished
    async fn job_completed(&self, _environment: &str, _job_id: &str) -> Result<bool, BackendError> {
        Ok(true)
    }
}

/// Aggregate outcome of one fan-out
#[derive(Debug, Clone)]
pub struct InvalidationReport {
    pub results: HashMap<CacheType, CacheInvalidationResult>,
    /// False only when a required layer failed or timed out
    pub succeeded: bool,
}

impl InvalidationReport {
    pub fn status_of(&self, cache_type: CacheType) -> Option<InvalidationStatus> {
        self.results.get(&cache_type).map(|r| r.status)
    }

    /// Layers that did not succeed, required or not
    pub fn unsuccessful(&self) -> Vec<CacheType> {
        let mut types: Vec<_> = self
            .results
            .values()
            .filter(|r| r.status != InvalidationStatus::Succeeded)
            .map(|r| r.cache_type)
            .collect();
        types.sort_by_key(|t| t.to_string());
        types
    }
}

#[derive(Debug, Clone)]
pub struct CacheTimeouts {
    pub cdn_wait: Duration,
    pub cdn_poll_interval: Duration,
    pub sync: Duration,
    pub application: Duration,
}

impl CacheTimeouts {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            cdn_wait: Duration::from_secs(config.cdn_wait_timeout_secs),
            cdn_poll_interval: Duration::from_secs(config.cdn_poll_interval_secs),
            sync: Duration::from_secs(config.sync_timeout_secs),
            application: Duration::from_secs(config.application_timeout_secs),
        }
    }
}

pub struct CacheInvalidationCoordinator {
    backends: HashMap<CacheType, Arc<dyn CacheBackend>>,
    timeouts: CacheTimeouts,
}

impl CacheInvalidationCoordinator {
    pub fn new(timeouts: CacheTimeouts) -> Self {
        Self {
            backends: HashMap::new(),
            timeouts,
        }
    }

    pub fn with_backend(mut self, cache_type: CacheType, backend: Arc<dyn CacheBackend>) -> Self {
        self.backends.insert(cache_type, backend);
        self
    }

    /// Invalidate every requested layer concurrently.
    pub async fn invalidate(
        &self,
        environment: &str,
        cache_types: &HashSet<CacheType>,
        required: &HashSet<CacheType>,
        wait_for_completion: bool,
    ) -> InvalidationReport {
        let patterns = vec![INVALIDATE_ALL.to_string()];

        let jobs: Vec<_> = cache_types
            .iter()
            .map(|cache_type| self.invalidate_one(*cache_type, environment, &patterns, wait_for_completion))
            .collect();
        let results = futures::future::join_all(jobs).await;

        let mut succeeded = true;
        let mut by_type = HashMap::new();
        for result in results {
            if result.status != InvalidationStatus::Succeeded {
                if required.contains(&result.cache_type) {
                    warn!(
                        environment = %environment,
                        cache = %result.cache_type,
                        status = ?result.status,
                        "Required cache invalidation did not succeed"
                    );
                    succeeded = false;
                } else {
                    debug!(
                        environment = %environment,
                        cache = %result.cache_type,
                        status = ?result.status,
                        "Optional cache invalidation did not succeed"
                    );
                }
            }
            by_type.insert(result.cache_type, result);
        }

        info!(
            environment = %environment,
            layers = by_type.len(),
            succeeded,
            "Cache invalidation finished"
        );

        InvalidationReport {
            results: by_type,
            succeeded,
        }
    }

    async fn invalidate_one(
        &self,
        cache_type: CacheType,
        environment: &str,
        patterns: &[String],
        wait_for_completion: bool,
    ) -> CacheInvalidationResult {
        let finish = |status, detail: Option<String>| CacheInvalidationResult {
            cache_type,
            status,
            completed_at: Utc::now(),
            detail,
        };

        let Some(backend) = self.backends.get(&cache_type) else {
            return finish(
                InvalidationStatus::Failed,
                Some(format!("no {} cache backend configured", cache_type)),
            );
        };

        let call_timeout = match cache_type {
            CacheType::Application => self.timeouts.application,
            _ => self.timeouts.sync,
        };

        let ticket = match tokio::time::timeout(call_timeout, backend.invalidate(environment, patterns)).await {
            Ok(Ok(ticket)) => ticket,
            Ok(Err(e)) => return finish(InvalidationStatus::Failed, Some(e.to_string())),
            Err(_) => {
                return finish(
                    InvalidationStatus::TimedOut,
                    Some(format!("no response within {}s", call_timeout.as_secs())),
                )
            }
        };

        match ticket {
            InvalidationTicket::Completed => finish(InvalidationStatus::Succeeded, None),
            InvalidationTicket::Pending(job_id) if !wait_for_completion => {
                finish(InvalidationStatus::Succeeded, Some(format!("submitted as {}", job_id)))
            }
            InvalidationTicket::Pending(job_id) => {
                let (status, detail) = self.await_job(backend.as_ref(), environment, &job_id).await;
                finish(status, detail)
            }
        }
    }

    /// Poll an asynchronous invalidation until it completes or the wait bound passes
    async fn await_job(
        &self,
        backend: &dyn CacheBackend,
        environment: &str,
        job_id: &str,
    ) -> (InvalidationStatus, Option<String>) {
        let deadline = Instant::now() + self.timeouts.cdn_wait;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(
                    environment = %environment,
                    job_id = %job_id,
                    "Invalidation still propagating after wait bound"
                );
                return (
                    InvalidationStatus::TimedOut,
                    Some(format!("job {} still in progress", job_id)),
                );
            }

            match tokio::time::timeout(remaining, backend.job_completed(environment, job_id)).await {
                Ok(Ok(true)) => return (InvalidationStatus::Succeeded, None),
                Ok(Ok(false)) => {}
                Ok(Err(e)) if e.is_transient() => {
                    debug!(job_id = %job_id, error = %e, "Invalidation status check failed, will retry");
                }
                Ok(Err(e)) => return (InvalidationStatus::Failed, Some(e.to_string())),
                Err(_) => continue,
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(self.timeouts.cdn_poll_interval.min(remaining)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCache;

    fn timeouts() -> CacheTimeouts {
        CacheTimeouts {
            cdn_wait: Duration::from_millis(100),
            cdn_poll_interval: Duration::from_millis(10),
            sync: Duration::from_millis(200),
            application: Duration::from_millis(50),
        }
    }

    fn set(types: &[CacheType]) -> HashSet<CacheType> {
        types.iter().copied().collect()
    }

    #[tokio::test]
    async fn test_cdn_timeout_is_a_warning_when_not_required() {
        let cdn = Arc::new(FakeCache::pending_forever());
        let redis = Arc::new(FakeCache::completed());
        let coordinator = CacheInvalidationCoordinator::new(timeouts())
            .with_backend(CacheType::Cdn, cdn.clone())
            .with_backend(CacheType::Redis, redis.clone());

        let report = coordinator
            .invalidate(
                "prod",
                &set(&[CacheType::Cdn, CacheType::Redis]),
                &set(&[CacheType::Redis]),
                true,
            )
            .await;

        assert!(report.succeeded);
        assert_eq!(report.status_of(CacheType::Cdn), Some(InvalidationStatus::TimedOut));
        assert_eq!(report.status_of(CacheType::Redis), Some(InvalidationStatus::Succeeded));
        assert_eq!(redis.calls(), 1);
    }

    #[tokio::test]
    async fn test_required_timeout_fails_the_aggregate() {
        let coordinator = CacheInvalidationCoordinator::new(timeouts())
            .with_backend(CacheType::Cdn, Arc::new(FakeCache::pending_forever()));

        let report = coordinator
            .invalidate("prod", &set(&[CacheType::Cdn]), &set(&[CacheType::Cdn]), true)
            .await;

        assert!(!report.succeeded);
        assert_eq!(report.unsuccessful(), vec![CacheType::Cdn]);
    }

    #[tokio::test]
    async fn test_cdn_completes_after_polling() {
        let cdn = Arc::new(FakeCache::pending_then_complete(2));
        let coordinator =
            CacheInvalidationCoordinator::new(timeouts()).with_backend(CacheType::Cdn, cdn);

        let report = coordinator
            .invalidate("prod", &set(&[CacheType::Cdn]), &set(&[CacheType::Cdn]), true)
            .await;

        assert!(report.succeeded);
        assert_eq!(report.status_of(CacheType::Cdn), Some(InvalidationStatus::Succeeded));
    }

    #[tokio::test]
    async fn test_slow_application_cache_times_out() {
        let coordinator = CacheInvalidationCoordinator::new(timeouts())
            .with_backend(
                CacheType::Application,
                Arc::new(FakeCache::slow(Duration::from_millis(500))),
            )
            .with_backend(CacheType::ApiGateway, Arc::new(FakeCache::completed()));

        let report = coordinator
            .invalidate(
                "prod",
                &set(&[CacheType::Application, CacheType::ApiGateway]),
                &set(&[CacheType::Application, CacheType::ApiGateway]),
                false,
            )
            .await;

        assert!(!report.succeeded);
        assert_eq!(
            report.status_of(CacheType::Application),
            Some(InvalidationStatus::TimedOut)
        );
        assert_eq!(
            report.status_of(CacheType::ApiGateway),
            Some(InvalidationStatus::Succeeded)
        );
    }

    #[tokio::test]
    async fn test_missing_backend_fails_that_layer() {
        let coordinator = CacheInvalidationCoordinator::new(timeouts());
        let report = coordinator
            .invalidate("dev", &set(&[CacheType::Redis]), &HashSet::new(), false)
            .await;

        assert!(report.succeeded);
        assert_eq!(report.status_of(CacheType::Redis), Some(InvalidationStatus::Failed));
    }
}
