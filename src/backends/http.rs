//! Application cache invalidation over an authenticated HTTP endpoint.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;

use crate::cache::{CacheBackend, InvalidationTicket};
use crate::config::CacheTargets;
use crate::error::BackendError;

pub struct ApplicationCache {
    targets: HashMap<String, CacheTargets>,
    http_client: reqwest::Client,
}

impl ApplicationCache {
    pub fn new(targets: HashMap<String, CacheTargets>, timeout: Duration) -> Self {
        let http_client = reqwest::Client::builder()
            .user_agent(format!("rollbackr/{}", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Self {
            targets,
            http_client,
        }
    }
}

fn classify_status(status: StatusCode, body: &str) -> BackendError {
    let message = format!("application cache returned {}: {}", status, body.trim());
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        BackendError::Transient(message)
    } else if status == StatusCode::NOT_FOUND || status == StatusCode::UNPROCESSABLE_ENTITY {
        BackendError::Validation(message)
    } else {
        BackendError::Failed(message)
    }
}

#[async_trait]
impl CacheBackend for ApplicationCache {
    async fn invalidate(
        &self,
        environment: &str,
        patterns: &[String],
    ) -> Result<InvalidationTicket, BackendError> {
        let target = self.targets.get(environment).ok_or_else(|| {
            BackendError::Validation(format!("no cache targets for environment '{}'", environment))
        })?;
        let url = target.application_url.as_deref().ok_or_else(|| {
            BackendError::Validation(format!("no application_url for '{}'", environment))
        })?;

        let mut request = self
            .http_client
            .post(url)
            .json(&json!({ "environment": environment, "patterns": patterns }));
        if let Some(token) = &target.application_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                BackendError::Transient(format!("application cache unreachable: {}", e))
            } else {
                BackendError::Failed(format!("application cache request failed: {}", e))
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(InvalidationTicket::Completed);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, "").is_transient());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down").is_transient());
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, ""),
            BackendError::Validation(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, "bad token"),
            BackendError::Failed(_)
        ));
    }
}
