use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::cache::CacheType;
use crate::db::{DeploymentKey, ServiceType};
use crate::error::RollbackError;

lazy_static! {
    /// Service and environment names (lowercase alphanumeric with dashes)
    static ref NAME_REGEX: Regex = Regex::new(r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?$").unwrap();
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub rollback: RollbackConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub migration: MigrationConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub aws: AwsConfig,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RollbackConfig {
    /// Consecutive unhealthy checks that trigger an automatic rollback (default: 2)
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Consecutive healthy checks before a deployment is stable (default: 1)
    #[serde(default = "default_healthy_checks_to_stable")]
    pub healthy_checks_to_stable: u32,
    /// Retries for transient executor errors (default: 2)
    #[serde(default = "default_transient_retries")]
    pub transient_retries: u32,
    /// Re-read attempts after losing a state store race (default: 3)
    #[serde(default = "default_conflict_retries")]
    pub conflict_retries: u32,
    /// Take a database backup before any schema downgrade (default: true)
    #[serde(default = "default_true")]
    pub backup_before_migration_rollback: bool,
    /// Cache layers an API rollback must invalidate to count as complete
    #[serde(default = "default_api_required_caches")]
    pub api_required_caches: Vec<CacheType>,
    /// Base delay between transient retries in milliseconds (default: 1000)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Capacity of the rollback job queue (default: 100)
    #[serde(default = "default_worker_queue_size")]
    pub worker_queue_size: usize,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            healthy_checks_to_stable: default_healthy_checks_to_stable(),
            transient_retries: default_transient_retries(),
            conflict_retries: default_conflict_retries(),
            backup_before_migration_rollback: true,
            api_required_caches: default_api_required_caches(),
            retry_backoff_ms: default_retry_backoff_ms(),
            worker_queue_size: default_worker_queue_size(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    2
}

fn default_healthy_checks_to_stable() -> u32 {
    1
}

fn default_transient_retries() -> u32 {
    2
}

fn default_conflict_retries() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_api_required_caches() -> Vec<CacheType> {
    vec![CacheType::ApiGateway, CacheType::Application]
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_worker_queue_size() -> usize {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// HTTP status a healthy target returns (default: 200)
    #[serde(default = "default_expected_status")]
    pub expected_status: u16,
    /// Timeout for a single probe attempt in seconds (default: 10)
    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,
    /// Probe attempts per check (default: 3)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay between attempts in seconds (default: 5)
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    /// Interval between scheduled checks in seconds (default: 60)
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            expected_status: default_expected_status(),
            timeout_secs: default_health_timeout(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay(),
            interval_secs: default_health_interval(),
        }
    }
}

fn default_expected_status() -> u16 {
    200
}

fn default_health_timeout() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    5
}

fn default_health_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Upper bound on waiting for a CDN invalidation (default: 300)
    #[serde(default = "default_cdn_wait_timeout")]
    pub cdn_wait_timeout_secs: u64,
    #[serde(default = "default_cdn_poll_interval")]
    pub cdn_poll_interval_secs: u64,
    /// Timeout for API gateway and Redis flushes (default: 30)
    #[serde(default = "default_sync_timeout")]
    pub sync_timeout_secs: u64,
    /// Timeout for the application cache endpoint (default: 5)
    #[serde(default = "default_application_timeout")]
    pub application_timeout_secs: u64,
    #[serde(default)]
    pub environments: HashMap<String, CacheTargets>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cdn_wait_timeout_secs: default_cdn_wait_timeout(),
            cdn_poll_interval_secs: default_cdn_poll_interval(),
            sync_timeout_secs: default_sync_timeout(),
            application_timeout_secs: default_application_timeout(),
            environments: HashMap::new(),
        }
    }
}

fn default_cdn_wait_timeout() -> u64 {
    300
}

fn default_cdn_poll_interval() -> u64 {
    10
}

fn default_sync_timeout() -> u64 {
    30
}

fn default_application_timeout() -> u64 {
    5
}

/// Cache endpoints of one environment
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheTargets {
    pub cdn_distribution_id: Option<String>,
    pub api_id: Option<String>,
    pub stage: Option<String>,
    pub redis_url: Option<String>,
    pub application_url: Option<String>,
    pub application_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MigrationConfig {
    /// Prints applied revisions, oldest first, one per line
    pub history_command: Option<String>,
    /// Prints the current revision
    pub current_command: Option<String>,
    /// Downgrades one step; `{revision}` is replaced by the step's target
    pub downgrade_command: Option<String>,
    /// Creates a backup and prints its id
    pub backup_command: Option<String>,
    #[serde(default = "default_statement_timeout")]
    pub statement_timeout_secs: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            history_command: None,
            current_command: None,
            downgrade_command: None,
            backup_command: None,
            statement_timeout_secs: default_statement_timeout(),
        }
    }
}

fn default_statement_timeout() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    /// Endpoint receiving structured JSON events; events are only logged if unset
    pub webhook_url: Option<String>,
    #[serde(default = "default_notification_timeout")]
    pub timeout_secs: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: default_notification_timeout(),
        }
    }
}

fn default_notification_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct AwsConfig {
    #[serde(default = "default_aws_cli")]
    pub cli_path: String,
    pub region: Option<String>,
    pub profile: Option<String>,
    #[serde(default = "default_aws_call_timeout")]
    pub call_timeout_secs: u64,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            cli_path: default_aws_cli(),
            region: None,
            profile: None,
            call_timeout_secs: default_aws_call_timeout(),
        }
    }
}

fn default_aws_cli() -> String {
    "aws".to_string()
}

fn default_aws_call_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub service_type: ServiceType,
    /// Alias that serves live traffic (default: "live")
    #[serde(default = "default_alias")]
    pub alias: String,
    /// Functions behind the alias; defaults to the service name
    #[serde(default)]
    pub functions: Vec<String>,
    /// Shell command whose zero exit status marks the service healthy
    pub custom_validation: Option<String>,
    #[serde(default)]
    pub environments: HashMap<String, EnvironmentConfig>,
}

fn default_alias() -> String {
    "live".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvironmentConfig {
    pub health_url: Option<String>,
    /// Bucket holding per-version snapshots of static assets
    pub snapshot_bucket: Option<String>,
    /// Bucket the CDN serves from
    pub serving_bucket: Option<String>,
}

/// Everything an executor needs to know about one (service, environment)
#[derive(Debug, Clone)]
pub struct ServiceTarget {
    pub key: DeploymentKey,
    pub service_type: ServiceType,
    pub alias: String,
    pub functions: Vec<String>,
    pub custom_validation: Option<String>,
    pub environment: EnvironmentConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            info!("Loading configuration from {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| "Failed to parse configuration file")?;
            Ok(config)
        } else {
            info!("No config file found, using defaults");
            Ok(Config::default())
        }
    }

    pub fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            rollback: RollbackConfig::default(),
            health: HealthConfig::default(),
            cache: CacheConfig::default(),
            migration: MigrationConfig::default(),
            notifications: NotificationConfig::default(),
            aws: AwsConfig::default(),
            services: Vec::new(),
        }
    }

    /// Resolve the configured target for a key. Unknown names are validation
    /// errors and are never retried.
    pub fn resolve_target(&self, key: &DeploymentKey) -> Result<ServiceTarget, RollbackError> {
        let service = self
            .services
            .iter()
            .find(|s| s.name == key.service)
            .ok_or_else(|| RollbackError::Validation(format!("unknown service '{}'", key.service)))?;

        let environment = service.environments.get(&key.environment).ok_or_else(|| {
            RollbackError::Validation(format!(
                "service '{}' has no environment '{}'",
                key.service, key.environment
            ))
        })?;

        let functions = if service.functions.is_empty() {
            vec![service.name.clone()]
        } else {
            service.functions.clone()
        };

        Ok(ServiceTarget {
            key: key.clone(),
            service_type: service.service_type,
            alias: service.alias.clone(),
            functions,
            custom_validation: service.custom_validation.clone(),
            environment: environment.clone(),
        })
    }

    /// Every configured (service, environment) pair
    pub fn targets(&self) -> Vec<ServiceTarget> {
        self.services
            .iter()
            .flat_map(|s| {
                s.environments
                    .keys()
                    .map(move |env| DeploymentKey::new(&s.name, env))
            })
            .filter_map(|key| self.resolve_target(&key).ok())
            .collect()
    }

    /// Collect every configuration problem instead of stopping at the first
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.rollback.failure_threshold == 0 {
            problems.push("rollback.failure_threshold must be at least 1".to_string());
        }
        if self.rollback.healthy_checks_to_stable == 0 {
            problems.push("rollback.healthy_checks_to_stable must be at least 1".to_string());
        }
        if self.health.max_retries == 0 {
            problems.push("health.max_retries must be at least 1".to_string());
        }
        if self.health.timeout_secs == 0 {
            problems.push("health.timeout_secs must be at least 1".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for service in &self.services {
            if !NAME_REGEX.is_match(&service.name) {
                problems.push(format!("invalid service name '{}'", service.name));
            }
            if !seen.insert(service.name.as_str()) {
                problems.push(format!("service '{}' is declared twice", service.name));
            }
            if service.environments.is_empty() {
                problems.push(format!("service '{}' has no environments", service.name));
            }
            for (env, target) in &service.environments {
                if !NAME_REGEX.is_match(env) {
                    problems.push(format!(
                        "invalid environment name '{}' for service '{}'",
                        env, service.name
                    ));
                }
                if service.service_type == ServiceType::Web && target.snapshot_bucket.is_none() {
                    problems.push(format!(
                        "web service '{}' needs snapshot_bucket in environment '{}'",
                        service.name, env
                    ));
                }
                if service.service_type == ServiceType::Web && target.serving_bucket.is_none() {
                    problems.push(format!(
                        "web service '{}' needs serving_bucket in environment '{}'",
                        service.name, env
                    ));
                }
            }
        }

        problems
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[rollback]
failure_threshold = 3

[health]
max_retries = 5

[cache.environments.prod]
cdn_distribution_id = "E123"
redis_url = "redis://cache:6379"

[[services]]
name = "api"
type = "api"
functions = ["pdf-api"]

[services.environments.prod]
health_url = "https://api.example.com/health"

[[services]]
name = "web"
type = "web"

[services.environments.prod]
health_url = "https://example.com/"
snapshot_bucket = "web-snapshots"
serving_bucket = "web-prod"
"#;

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = Config::load(Path::new("/nonexistent/rollbackr.toml")).unwrap();
        assert_eq!(config.rollback.failure_threshold, 2);
        assert_eq!(config.rollback.healthy_checks_to_stable, 1);
        assert_eq!(config.rollback.transient_retries, 2);
        assert_eq!(config.health.expected_status, 200);
        assert!(config.services.is_empty());
    }

    #[test]
    fn test_load_file_with_services() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.rollback.failure_threshold, 3);
        assert_eq!(config.health.max_retries, 5);
        assert_eq!(config.health.timeout_secs, 10);
        assert_eq!(config.services.len(), 2);
        assert_eq!(
            config.cache.environments["prod"].cdn_distribution_id.as_deref(),
            Some("E123")
        );
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_resolve_target() {
        let config: Config = toml::from_str(SAMPLE).unwrap();

        let target = config.resolve_target(&DeploymentKey::new("api", "prod")).unwrap();
        assert_eq!(target.service_type, ServiceType::Api);
        assert_eq!(target.alias, "live");
        assert_eq!(target.functions, vec!["pdf-api".to_string()]);

        let web = config.resolve_target(&DeploymentKey::new("web", "prod")).unwrap();
        assert_eq!(web.functions, vec!["web".to_string()]);

        assert!(matches!(
            config.resolve_target(&DeploymentKey::new("api", "dev")),
            Err(RollbackError::Validation(_))
        ));
        assert!(matches!(
            config.resolve_target(&DeploymentKey::new("billing", "prod")),
            Err(RollbackError::Validation(_))
        ));
        assert_eq!(config.targets().len(), 2);
    }

    #[test]
    fn test_validate_reports_all_problems() {
        let config: Config = toml::from_str(
            r#"
[rollback]
failure_threshold = 0

[[services]]
name = "Bad_Name"
type = "web"

[services.environments.prod]
health_url = "https://example.com/"
"#,
        )
        .unwrap();

        let problems = config.validate();
        assert!(problems.iter().any(|p| p.contains("failure_threshold")));
        assert!(problems.iter().any(|p| p.contains("invalid service name")));
        assert!(problems.iter().any(|p| p.contains("snapshot_bucket")));
        assert!(problems.iter().any(|p| p.contains("serving_bucket")));
    }
}
