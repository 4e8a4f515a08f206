//! Adapters for the external systems a rollback touches.
//!
//! Executors only see the traits below. Production adapters shell out to the
//! cloud CLIs or call HTTP endpoints; every call carries its own timeout and
//! classifies failures as transient or validation errors.

mod aws;
mod http;
mod redis;

pub use aws::{ApiGatewayCache, AwsCli, CloudFrontCache};
pub use http::ApplicationCache;
pub use redis::RedisCliCache;

use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;

use crate::config::ServiceTarget;
use crate::error::BackendError;

/// A published, immutable function version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedVersion {
    pub version: String,
    /// Release label the version was published with (e.g. "v5")
    pub description: String,
}

/// Alias-addressed functions (API backends and standalone functions)
#[async_trait]
pub trait FunctionBackend: Send + Sync {
    /// Published version the alias currently points at
    async fn alias_version(&self, function: &str, alias: &str) -> Result<String, BackendError>;

    /// Published versions, oldest first
    async fn published_versions(
        &self,
        function: &str,
    ) -> Result<Vec<PublishedVersion>, BackendError>;

    /// Atomically repoint an alias
    async fn update_alias(
        &self,
        function: &str,
        alias: &str,
        version: &str,
    ) -> Result<(), BackendError>;

    /// Synchronously invoke a function, returning its status code
    async fn invoke(
        &self,
        function: &str,
        qualifier: &str,
        payload: &serde_json::Value,
    ) -> Result<u16, BackendError>;
}

/// Per-version snapshots of static assets
#[async_trait]
pub trait SnapshotStorage: Send + Sync {
    async fn snapshot_exists(
        &self,
        target: &ServiceTarget,
        version: &str,
    ) -> Result<bool, BackendError>;

    /// Replace the serving root with the snapshot of `version`
    async fn restore_snapshot(
        &self,
        target: &ServiceTarget,
        version: &str,
    ) -> Result<(), BackendError>;
}

/// Output of an external command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Run an external program with a hard timeout. A timeout is a transient
/// failure; the child is killed when the future is dropped.
pub async fn run_command(
    program: &str,
    args: &[String],
    timeout: Duration,
) -> Result<CommandOutput, BackendError> {
    let mut command = Command::new(program);
    command.args(args).kill_on_drop(true);

    let output = tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| {
            BackendError::Transient(format!(
                "{} timed out after {}s",
                program,
                timeout.as_secs()
            ))
        })?
        .map_err(|e| BackendError::Failed(format!("failed to run {}: {}", program, e)))?;

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code().unwrap_or(-1),
    })
}

/// Run a shell snippet through `/bin/sh -c`
pub async fn run_shell(script: &str, timeout: Duration) -> Result<CommandOutput, BackendError> {
    run_command(
        "/bin/sh",
        &["-c".to_string(), script.to_string()],
        timeout,
    )
    .await
}

/// Classify a failed command's stderr
pub fn classify_failure(program: &str, stderr: &str) -> BackendError {
    const TRANSIENT: [&str; 7] = [
        "Throttling",
        "TooManyRequests",
        "RequestLimitExceeded",
        "ServiceUnavailable",
        "RequestTimeout",
        "timed out",
        "Connection refused",
    ];
    const VALIDATION: [&str; 5] = [
        "ResourceNotFoundException",
        "NoSuchKey",
        "NoSuchBucket",
        "NotFoundException",
        "InvalidParameterValue",
    ];

    let message = format!("{}: {}", program, stderr.trim());
    if TRANSIENT.iter().any(|m| stderr.contains(m)) {
        BackendError::Transient(message)
    } else if VALIDATION.iter().any(|m| stderr.contains(m)) {
        BackendError::Validation(message)
    } else {
        BackendError::Failed(message)
    }
}
