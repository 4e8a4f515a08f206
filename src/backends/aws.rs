//! AWS adapters built on the `aws` CLI.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use super::{classify_failure, run_command, FunctionBackend, PublishedVersion, SnapshotStorage};
use crate::cache::{CacheBackend, InvalidationTicket};
use crate::config::{AwsConfig, CacheTargets, ServiceTarget};
use crate::error::BackendError;

/// Thin wrapper over the `aws` binary returning parsed JSON output
#[derive(Debug, Clone)]
pub struct AwsCli {
    config: AwsConfig,
}

impl AwsCli {
    pub fn new(config: AwsConfig) -> Self {
        Self { config }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.call_timeout_secs)
    }

    async fn call(&self, args: &[&str]) -> Result<Value, BackendError> {
        let mut full: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        full.extend(["--output".to_string(), "json".to_string()]);
        if let Some(region) = &self.config.region {
            full.extend(["--region".to_string(), region.clone()]);
        }
        if let Some(profile) = &self.config.profile {
            full.extend(["--profile".to_string(), profile.clone()]);
        }

        debug!(command = %args.join(" "), "Running aws cli");
        let output = run_command(&self.config.cli_path, &full, self.timeout()).await?;
        if output.exit_code != 0 {
            return Err(classify_failure("aws", &output.stderr));
        }

        if output.stdout.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&output.stdout)
            .map_err(|e| BackendError::Failed(format!("unparseable aws output: {}", e)))
    }
}

fn string_field(value: &Value, pointer: &str) -> Result<String, BackendError> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| BackendError::Failed(format!("aws output missing {}", pointer)))
}

/// Parse `lambda list-versions-by-function` output, skipping `$LATEST`
fn parse_versions(value: &Value) -> Vec<PublishedVersion> {
    let mut versions: Vec<PublishedVersion> = value
        .get("Versions")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let version = item.get("Version")?.as_str()?;
                    if version == "$LATEST" {
                        return None;
                    }
                    Some(PublishedVersion {
                        version: version.to_string(),
                        description: item
                            .get("Description")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    versions.sort_by_key(|v| v.version.parse::<u64>().unwrap_or(0));
    versions
}

#[async_trait]
impl FunctionBackend for AwsCli {
    async fn alias_version(&self, function: &str, alias: &str) -> Result<String, BackendError> {
        let output = self
            .call(&["lambda", "get-alias", "--function-name", function, "--name", alias])
            .await?;
        string_field(&output, "/FunctionVersion")
    }

    async fn published_versions(
        &self,
        function: &str,
    ) -> Result<Vec<PublishedVersion>, BackendError> {
        let output = self
            .call(&["lambda", "list-versions-by-function", "--function-name", function])
            .await?;
        Ok(parse_versions(&output))
    }

    async fn update_alias(
        &self,
        function: &str,
        alias: &str,
        version: &str,
    ) -> Result<(), BackendError> {
        self.call(&[
            "lambda",
            "update-alias",
            "--function-name",
            function,
            "--name",
            alias,
            "--function-version",
            version,
        ])
        .await?;
        Ok(())
    }

    async fn invoke(
        &self,
        function: &str,
        qualifier: &str,
        payload: &Value,
    ) -> Result<u16, BackendError> {
        let payload = payload.to_string();
        let output = self
            .call(&[
                "lambda",
                "invoke",
                "--function-name",
                function,
                "--qualifier",
                qualifier,
                "--cli-binary-format",
                "raw-in-base64-out",
                "--payload",
                &payload,
                "/dev/null",
            ])
            .await?;

        // A handled or unhandled function error still returns 200 from the API
        if output.get("FunctionError").is_some() {
            return Ok(500);
        }
        Ok(output
            .get("StatusCode")
            .and_then(Value::as_u64)
            .unwrap_or(500) as u16)
    }
}

fn snapshot_prefix(target: &ServiceTarget, version: &str) -> String {
    format!("{}/{}/", target.key.environment, version)
}

fn bucket<'a>(value: &'a Option<String>, name: &str, target: &ServiceTarget) -> Result<&'a str, BackendError> {
    value.as_deref().ok_or_else(|| {
        BackendError::Validation(format!("{} is not configured for {}", name, target.key))
    })
}

#[async_trait]
impl SnapshotStorage for AwsCli {
    async fn snapshot_exists(
        &self,
        target: &ServiceTarget,
        version: &str,
    ) -> Result<bool, BackendError> {
        let snapshots = bucket(&target.environment.snapshot_bucket, "snapshot_bucket", target)?;
        let prefix = snapshot_prefix(target, version);
        let output = self
            .call(&[
                "s3api",
                "list-objects-v2",
                "--bucket",
                snapshots,
                "--prefix",
                &prefix,
                "--max-keys",
                "1",
            ])
            .await?;

        let count = output.get("KeyCount").and_then(Value::as_u64).unwrap_or(0);
        let has_contents = output
            .get("Contents")
            .and_then(Value::as_array)
            .is_some_and(|c| !c.is_empty());
        Ok(count > 0 || has_contents)
    }

    async fn restore_snapshot(
        &self,
        target: &ServiceTarget,
        version: &str,
    ) -> Result<(), BackendError> {
        let snapshots = bucket(&target.environment.snapshot_bucket, "snapshot_bucket", target)?;
        let serving = bucket(&target.environment.serving_bucket, "serving_bucket", target)?;
        let source = format!("s3://{}/{}", snapshots, snapshot_prefix(target, version));
        let destination = format!("s3://{}/", serving);

        self.call(&["s3", "sync", &source, &destination, "--delete", "--only-show-errors"])
            .await?;
        Ok(())
    }
}

fn cache_target<'a>(
    targets: &'a HashMap<String, CacheTargets>,
    environment: &str,
) -> Result<&'a CacheTargets, BackendError> {
    targets.get(environment).ok_or_else(|| {
        BackendError::Validation(format!("no cache targets for environment '{}'", environment))
    })
}

/// CloudFront distribution invalidation
pub struct CloudFrontCache {
    cli: AwsCli,
    targets: HashMap<String, CacheTargets>,
}

impl CloudFrontCache {
    pub fn new(cli: AwsCli, targets: HashMap<String, CacheTargets>) -> Self {
        Self { cli, targets }
    }

    fn distribution(&self, environment: &str) -> Result<String, BackendError> {
        cache_target(&self.targets, environment)?
            .cdn_distribution_id
            .clone()
            .ok_or_else(|| {
                BackendError::Validation(format!("no CDN distribution for '{}'", environment))
            })
    }
}

#[async_trait]
impl CacheBackend for CloudFrontCache {
    async fn invalidate(
        &self,
        environment: &str,
        patterns: &[String],
    ) -> Result<InvalidationTicket, BackendError> {
        let distribution = self.distribution(environment)?;
        let mut args = vec![
            "cloudfront",
            "create-invalidation",
            "--distribution-id",
            distribution.as_str(),
            "--paths",
        ];
        args.extend(patterns.iter().map(String::as_str));

        let output = self.cli.call(&args).await?;
        Ok(InvalidationTicket::Pending(string_field(&output, "/Invalidation/Id")?))
    }

    async fn job_completed(&self, environment: &str, job_id: &str) -> Result<bool, BackendError> {
        let distribution = self.distribution(environment)?;
        let output = self
            .cli
            .call(&[
                "cloudfront",
                "get-invalidation",
                "--distribution-id",
                &distribution,
                "--id",
                job_id,
            ])
            .await?;
        Ok(string_field(&output, "/Invalidation/Status")? == "Completed")
    }
}

/// API Gateway stage cache flush
pub struct ApiGatewayCache {
    cli: AwsCli,
    targets: HashMap<String, CacheTargets>,
}

impl ApiGatewayCache {
    pub fn new(cli: AwsCli, targets: HashMap<String, CacheTargets>) -> Self {
        Self { cli, targets }
    }
}

#[async_trait]
impl CacheBackend for ApiGatewayCache {
    async fn invalidate(
        &self,
        environment: &str,
        _patterns: &[String],
    ) -> Result<InvalidationTicket, BackendError> {
        let target = cache_target(&self.targets, environment)?;
        let (Some(api_id), Some(stage)) = (&target.api_id, &target.stage) else {
            return Err(BackendError::Validation(format!(
                "api_id and stage are required to flush the gateway cache for '{}'",
                environment
            )));
        };

        self.cli
            .call(&[
                "apigateway",
                "flush-stage-cache",
                "--rest-api-id",
                api_id,
                "--stage-name",
                stage,
            ])
            .await?;
        Ok(InvalidationTicket::Completed)
    }
}
