//! Static web frontends served from object storage behind a CDN.

use std::collections::HashSet;
use tracing::{info, warn};

use super::{ExecutionRequest, RollbackOutcome, ServiceExecutors};
use crate::cache::{CacheType, InvalidationStatus};
use crate::error::RollbackError;
use crate::health::ProbeTarget;

pub(super) async fn execute(
    executors: &ServiceExecutors,
    request: &ExecutionRequest,
) -> Result<RollbackOutcome, RollbackError> {
    let target = &request.target;
    let version = &request.target_version;

    let exists = executors
        .retrying("snapshot lookup", || executors.storage.snapshot_exists(target, version))
        .await?;
    if !exists {
        return Err(RollbackError::Validation(format!(
            "no asset snapshot for {} version {}",
            target.key, version
        )));
    }

    executors
        .retrying("snapshot restore", || executors.storage.restore_snapshot(target, version))
        .await?;
    info!(key = %target.key, version = %version, "Asset snapshot restored");

    if !request.options.skip_cache_invalidation {
        let report = executors
            .invalidate(request, &[CacheType::Cdn], &HashSet::new(), true)
            .await;
        match report.status_of(CacheType::Cdn) {
            Some(InvalidationStatus::Succeeded) => {}
            Some(InvalidationStatus::TimedOut) => {
                warn!(key = %target.key, "CDN invalidation still propagating, stale assets may be served briefly");
            }
            _ => {
                let detail = report
                    .results
                    .get(&CacheType::Cdn)
                    .and_then(|r| r.detail.clone())
                    .unwrap_or_else(|| "CDN invalidation failed".to_string());
                return Ok(RollbackOutcome::partial(detail));
            }
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
