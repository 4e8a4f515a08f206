//! Queue of rollback jobs submitted by operators and automation.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use super::{RollbackEngine, RollbackReport, RollbackRequest};
use crate::error::RollbackError;

type JobResult = Result<RollbackReport, RollbackError>;

pub type RollbackJob = (String, RollbackRequest, oneshot::Sender<JobResult>);

/// Submitted job; await `wait` for its report
pub struct JobHandle {
    pub id: String,
    receiver: oneshot::Receiver<JobResult>,
}

impl JobHandle {
    pub async fn wait(self) -> JobResult {
        self.receiver.await.unwrap_or_else(|_| {
            Err(RollbackError::Failed(format!(
                "rollback job {} was dropped before completing",
                self.id
            )))
        })
    }
}

#[derive(Clone)]
pub struct RollbackQueue {
    tx: mpsc::Sender<RollbackJob>,
}

impl RollbackQueue {
    pub async fn submit(&self, request: RollbackRequest) -> Result<JobHandle, RollbackError> {
        let id = uuid::Uuid::new_v4().to_string();
        let (reply, receiver) = oneshot::channel();
        self.tx
            .send((id.clone(), request, reply))
            .await
            .map_err(|_| RollbackError::Failed("rollback worker is not running".to_string()))?;
        Ok(JobHandle { id, receiver })
    }
}

pub struct RollbackWorker {
    engine: Arc<RollbackEngine>,
    rx: mpsc::Receiver<RollbackJob>,
}

impl RollbackWorker {
    pub fn new(engine: Arc<RollbackEngine>, queue_size: usize) -> (RollbackQueue, Self) {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        (RollbackQueue { tx }, Self { engine, rx })
    }

    /// Process jobs until every queue handle is dropped. Jobs for different
    /// keys run concurrently; the engine serializes jobs for the same key.
    pub async fn run(mut self) {
        tracing::info!("Rollback worker started");

        while let Some((job_id, request, reply)) = self.rx.recv().await {
            tracing::info!(
                job_id = %job_id,
                key = %request.key,
                triggered_by = %request.triggered_by,
                "Processing rollback job"
            );

            let engine = self.engine.clone();
            tokio::spawn(async move {
                let result = engine.trigger_rollback(request).await;
                if let Err(e) = &result {
                    tracing::error!(job_id = %job_id, error = %e, "Rollback job failed");
                }
                // The submitter may have stopped waiting
                let _ = reply.send(result);
            });
        }

        tracing::info!("Rollback worker stopped");
    }
}
