//! Periodic health polling, one independent loop per (service, environment).

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::ServiceTarget;
use crate::engine::{HealthDecision, RollbackEngine};
use crate::error::RollbackError;

pub struct MonitorScheduler {
    engine: Arc<RollbackEngine>,
    interval: Duration,
}

impl MonitorScheduler {
    pub fn new(engine: Arc<RollbackEngine>, interval: Duration) -> Self {
        Self { engine, interval }
    }

    /// Spawn a loop for every configured target that can be probed. Loops
    /// exit after their current poll once `shutdown` flips to true.
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        self.engine
            .config()
            .targets()
            .into_iter()
            .filter(|target| target.service_type.supports_automatic_rollback())
            .map(|target| self.spawn(target, shutdown.clone()))
            .collect()
    }

    fn spawn(&self, target: ServiceTarget, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let period = self.interval;

        tracing::info!(
            key = %target.key,
            interval_secs = period.as_secs(),
            "Starting health monitor"
        );

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // A slow probe run must not cause a burst of catch-up probes
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }

                match engine.poll(&target).await {
                    Ok(HealthDecision::RolledBack(report)) => {
                        tracing::warn!(
                            key = %target.key,
                            succeeded = report.succeeded(),
                            "Health monitor triggered a rollback"
                        );
                    }
                    Ok(_) => {}
                    // Not deployed yet
                    Err(RollbackError::Validation(_)) => {}
                    Err(e) => {
                        tracing::error!(key = %target.key, error = %e, "Health poll failed");
                    }
                }
            }

            tracing::debug!(key = %target.key, "Health monitor stopped");
        })
    }
}
