//! Redis flush through `redis-cli`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use super::{classify_failure, run_command};
use crate::cache::{CacheBackend, InvalidationTicket};
use crate::config::CacheTargets;
use crate::error::BackendError;

pub struct RedisCliCache {
    targets: HashMap<String, CacheTargets>,
    timeout: Duration,
}

impl RedisCliCache {
    pub fn new(targets: HashMap<String, CacheTargets>, timeout: Duration) -> Self {
        Self { targets, timeout }
    }
}

#[async_trait]
impl CacheBackend for RedisCliCache {
    async fn invalidate(
        &self,
        environment: &str,
        _patterns: &[String],
    ) -> Result<InvalidationTicket, BackendError> {
        let url = self
            .targets
            .get(environment)
            .and_then(|t| t.redis_url.clone())
            .ok_or_else(|| {
                BackendError::Validation(format!("no redis_url for environment '{}'", environment))
            })?;

        let args = vec!["-u".to_string(), url, "FLUSHDB".to_string()];
        let output = run_command("redis-cli", &args, self.timeout).await?;

        // redis-cli exits 0 even for server-side errors; the reply tells us
        if output.exit_code != 0 || !output.stdout.trim().eq_ignore_ascii_case("OK") {
            let reply = if output.stderr.trim().is_empty() {
                output.stdout
            } else {
                output.stderr
            };
            return Err(classify_failure("redis-cli", &reply));
        }
        Ok(InvalidationTicket::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_environment_is_validation_error() {
        let cache = RedisCliCache::new(HashMap::new(), Duration::from_secs(1));
        let err = cache.invalidate("prod", &[]).await.unwrap_err();
        assert!(matches!(err, BackendError::Validation(_)));
    }
}
