//! Health monitor.
//!
//! Produces one healthy/unhealthy verdict per invocation from up to
//! `max_retries` sequential probe attempts. It never touches deployment state;
//! the decision engine consumes its results.

mod scheduler;

pub use scheduler::MonitorScheduler;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backends::{run_shell, FunctionBackend};
use crate::config::{HealthConfig, ServiceTarget};
use crate::db::ServiceType;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    /// No verdict could be formed (nothing to probe)
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub target: String,
    pub status: HealthStatus,
    pub response_time_ms: u64,
    pub attempts_made: u32,
    pub last_error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl HealthCheckResult {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Something that can be probed
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeTarget {
    Http {
        url: String,
    },
    Function {
        name: String,
        qualifier: String,
        payload: serde_json::Value,
    },
}

impl ProbeTarget {
    /// Synthetic invocation used as a function health probe
    pub fn function(name: &str, qualifier: &str) -> Self {
        Self::Function {
            name: name.to_string(),
            qualifier: qualifier.to_string(),
            payload: serde_json::json!({ "source": "rollbackr.health-check" }),
        }
    }

    /// Default probe for a configured service: its health URL when set,
    /// otherwise an invocation of its first function through the live alias
    pub fn for_service(target: &ServiceTarget) -> Option<Self> {
        if let Some(url) = &target.environment.health_url {
            return Some(Self::Http { url: url.clone() });
        }
        match target.service_type {
            ServiceType::Api | ServiceType::Lambda => target
                .functions
                .first()
                .map(|name| Self::function(name, &target.alias)),
            ServiceType::Web | ServiceType::Infrastructure => None,
        }
    }

    pub fn identity(&self) -> String {
        match self {
            Self::Http { url } => url.clone(),
            Self::Function {
                name, qualifier, ..
            } => format!("{}:{}", name, qualifier),
        }
    }
}

/// Configuration for one health check
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    pub expected_status: u16,
    /// Bound on a single attempt
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Shell command whose zero exit status counts as a passing attempt,
    /// used instead of the status comparison when set
    pub custom_validation: Option<String>,
}

impl HealthCheckConfig {
    pub fn from_health_config(config: &HealthConfig) -> Self {
        Self {
            expected_status: config.expected_status,
            timeout: Duration::from_secs(config.timeout_secs),
            max_retries: config.max_retries,
            retry_delay: Duration::from_secs(config.retry_delay_secs),
            custom_validation: None,
        }
    }

    pub fn with_custom_validation(mut self, command: Option<String>) -> Self {
        self.custom_validation = command;
        self
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self::from_health_config(&HealthConfig::default())
    }
}

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("request failed: {0}")]
    Transport(String),

    #[error("invocation failed: {0}")]
    Invocation(String),
}

/// A single probe attempt returning the observed status code
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, target: &ProbeTarget) -> Result<u16, ProbeError>;
}

/// HTTP GET for endpoints, synchronous invocation for functions
pub struct DefaultProbe {
    http_client: reqwest::Client,
    functions: Arc<dyn FunctionBackend>,
}

impl DefaultProbe {
    pub fn new(functions: Arc<dyn FunctionBackend>) -> Self {
        let http_client = reqwest::Client::builder()
            .user_agent(format!("rollbackr/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();

        Self {
            http_client,
            functions,
        }
    }
}

#[async_trait]
impl Probe for DefaultProbe {
    async fn probe(&self, target: &ProbeTarget) -> Result<u16, ProbeError> {
        match target {
            ProbeTarget::Http { url } => self
                .http_client
                .get(url)
                .send()
                .await
                .map(|response| response.status().as_u16())
                .map_err(|e| ProbeError::Transport(e.to_string())),
            ProbeTarget::Function {
                name,
                qualifier,
                payload,
            } => self
                .functions
                .invoke(name, qualifier, payload)
                .await
                .map_err(|e| ProbeError::Invocation(e.to_string())),
        }
    }
}

pub struct HealthMonitor {
    probe: Arc<dyn Probe>,
}

impl HealthMonitor {
    pub fn new(probe: Arc<dyn Probe>) -> Self {
        Self { probe }
    }

    /// Run up to `max_retries` strictly sequential attempts against `target`.
    ///
    /// Returns healthy on the first passing attempt. Timeouts and probe errors
    /// are failed attempts; the loop is never aborted early by them.
    pub async fn check_health(
        &self,
        service_type: ServiceType,
        target: &ProbeTarget,
        config: &HealthCheckConfig,
    ) -> HealthCheckResult {
        let identity = target.identity();
        let mut result = HealthCheckResult {
            target: identity.clone(),
            status: HealthStatus::Unknown,
            response_time_ms: 0,
            attempts_made: 0,
            last_error: None,
            checked_at: Utc::now(),
        };

        if !service_type.supports_automatic_rollback() {
            result.last_error = Some(format!("{} services are not probed", service_type));
            return result;
        }
        if config.max_retries == 0 {
            result.last_error = Some("max_retries is zero".to_string());
            return result;
        }

        for attempt in 1..=config.max_retries {
            result.attempts_made = attempt;
            let start = Instant::now();
            let outcome = self.attempt(target, config).await;
            result.response_time_ms = start.elapsed().as_millis() as u64;

            match outcome {
                Ok(()) => {
                    debug!(
                        target = %identity,
                        attempt,
                        response_time_ms = result.response_time_ms,
                        "Health check passed"
                    );
                    result.status = HealthStatus::Healthy;
                    result.last_error = None;
                    result.checked_at = Utc::now();
                    return result;
                }
                Err(error) => {
                    debug!(
                        target = %identity,
                        attempt,
                        max_retries = config.max_retries,
                        error = %error,
                        "Health check attempt failed"
                    );
                    result.last_error = Some(error);
                }
            }

            if attempt < config.max_retries {
                tokio::time::sleep(config.retry_delay).await;
            }
        }

        warn!(
            target = %identity,
            attempts = result.attempts_made,
            error = result.last_error.as_deref().unwrap_or_default(),
            "Health check failed after all attempts"
        );
        result.status = HealthStatus::Unhealthy;
        result.checked_at = Utc::now();
        result
    }

    async fn attempt(&self, target: &ProbeTarget, config: &HealthCheckConfig) -> Result<(), String> {
        if let Some(command) = &config.custom_validation {
            let output = run_shell(command, config.timeout)
                .await
                .map_err(|e| e.to_string())?;
            return if output.exit_code == 0 {
                Ok(())
            } else {
                Err(format!(
                    "custom validation exited with {}: {}",
                    output.exit_code,
                    output.stderr.trim()
                ))
            };
        }

        match tokio::time::timeout(config.timeout, self.probe.probe(target)).await {
            Ok(Ok(status)) if status == config.expected_status => Ok(()),
            Ok(Ok(status)) => Err(format!(
                "expected status {}, got {}",
                config.expected_status, status
            )),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("timed out after {}ms", config.timeout.as_millis())),
        }
    }
}

/// Log a verdict at the level its status deserves
pub fn log_result(service: &str, environment: &str, result: &HealthCheckResult) {
    match result.status {
        HealthStatus::Healthy => debug!(
            service = %service,
            environment = %environment,
            attempts = result.attempts_made,
            "Target healthy"
        ),
        HealthStatus::Unhealthy => warn!(
            service = %service,
            environment = %environment,
            attempts = result.attempts_made,
            error = result.last_error.as_deref().unwrap_or_default(),
            "Target unhealthy"
        ),
        HealthStatus::Unknown => info!(
            service = %service,
            environment = %environment,
            reason = result.last_error.as_deref().unwrap_or_default(),
            "No health verdict"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedProbe;

    fn fast_config(max_retries: u32) -> HealthCheckConfig {
        HealthCheckConfig {
            expected_status: 200,
            timeout: Duration::from_millis(50),
            max_retries,
            retry_delay: Duration::from_millis(5),
            custom_validation: None,
        }
    }

    fn http_target() -> ProbeTarget {
        ProbeTarget::Http {
            url: "http://127.0.0.1:9/health".to_string(),
        }
    }

    #[tokio::test]
    async fn test_healthy_on_first_matching_attempt() {
        let probe = Arc::new(ScriptedProbe::new(vec![Ok(503), Ok(200), Ok(200)]));
        let monitor = HealthMonitor::new(probe.clone());

        let result = monitor
            .check_health(ServiceType::Api, &http_target(), &fast_config(3))
            .await;

        assert_eq!(result.status, HealthStatus::Healthy);
        assert_eq!(result.attempts_made, 2);
        assert!(result.last_error.is_none());
        assert_eq!(probe.calls(), 2);
    }

    #[tokio::test]
    async fn test_unhealthy_after_exhausting_attempts() {
        let probe = Arc::new(ScriptedProbe::new(vec![
            Ok(500),
            Err("connection refused".to_string()),
            Ok(404),
        ]));
        let monitor = HealthMonitor::new(probe.clone());

        let result = monitor
            .check_health(ServiceType::Web, &http_target(), &fast_config(3))
            .await;

        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert_eq!(result.attempts_made, 3);
        assert_eq!(result.last_error.as_deref(), Some("expected status 200, got 404"));
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failed_attempt() {
        let probe = Arc::new(
            ScriptedProbe::new(vec![Ok(200), Ok(200)]).with_first_delay(Duration::from_millis(500)),
        );
        let monitor = HealthMonitor::new(probe.clone());

        let result = monitor
            .check_health(ServiceType::Api, &http_target(), &fast_config(2))
            .await;

        assert_eq!(result.status, HealthStatus::Healthy);
        assert_eq!(result.attempts_made, 2);
    }

    #[tokio::test]
    async fn test_custom_validation_exit_code_decides() {
        let monitor = HealthMonitor::new(Arc::new(ScriptedProbe::new(vec![])));

        let mut passing = fast_config(1).with_custom_validation(Some("true".to_string()));
        passing.timeout = Duration::from_secs(5);
        let result = monitor
            .check_health(ServiceType::Lambda, &http_target(), &passing)
            .await;
        assert_eq!(result.status, HealthStatus::Healthy);

        let mut failing = fast_config(2).with_custom_validation(Some("exit 1".to_string()));
        failing.timeout = Duration::from_secs(5);
        let result = monitor
            .check_health(ServiceType::Lambda, &http_target(), &failing)
            .await;
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert_eq!(result.attempts_made, 2);
    }

    #[tokio::test]
    async fn test_infrastructure_is_never_probed() {
        let probe = Arc::new(ScriptedProbe::new(vec![Ok(200)]));
        let monitor = HealthMonitor::new(probe.clone());

        let result = monitor
            .check_health(ServiceType::Infrastructure, &http_target(), &fast_config(3))
            .await;

        assert_eq!(result.status, HealthStatus::Unknown);
        assert_eq!(probe.calls(), 0);
    }

    #[test]
    fn test_probe_target_for_service() {
        use crate::config::EnvironmentConfig;
        use crate::db::DeploymentKey;

        let mut target = ServiceTarget {
            key: DeploymentKey::new("workers", "prod"),
            service_type: ServiceType::Lambda,
            alias: "live".to_string(),
            functions: vec!["pdf-worker".to_string()],
            custom_validation: None,
            environment: EnvironmentConfig::default(),
        };
        assert_eq!(
            ProbeTarget::for_service(&target).unwrap().identity(),
            "pdf-worker:live"
        );

        target.environment.health_url = Some("https://example.com/health".to_string());
        assert_eq!(
            ProbeTarget::for_service(&target).unwrap().identity(),
            "https://example.com/health"
        );

        target.service_type = ServiceType::Web;
        target.environment.health_url = None;
        assert!(ProbeTarget::for_service(&target).is_none());
    }
}
