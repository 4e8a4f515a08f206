pub mod backends;
pub mod cache;
pub mod cli;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod executors;
pub mod health;
pub mod migrations;
pub mod notifications;
pub mod store;

#[cfg(test)]
mod testing;

pub use db::DbPool;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use crate::backends::{ApiGatewayCache, ApplicationCache, AwsCli, CloudFrontCache, RedisCliCache};
use crate::cache::{CacheInvalidationCoordinator, CacheTimeouts, CacheType};
use crate::config::Config;
use crate::engine::RollbackEngine;
use crate::executors::{ExecutorSettings, ServiceExecutors};
use crate::health::{DefaultProbe, HealthMonitor};
use crate::migrations::{CommandMigrations, MigrationRollbackCoordinator};
use crate::notifications::NotificationService;
use crate::store::{SqliteStateStore, StateStore};

/// Everything a command needs, wired to the production adapters
pub struct AppContext {
    pub config: Arc<Config>,
    pub store: Arc<dyn StateStore>,
    pub migrations: Option<Arc<MigrationRollbackCoordinator>>,
    pub engine: Arc<RollbackEngine>,
}

impl AppContext {
    /// Open the sqlite state store under `server.data_dir` and build the engine
    pub async fn open(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.server.data_dir)?;
        let db = db::init(&config.server.data_dir).await?;
        Ok(Self::build(config, Arc::new(SqliteStateStore::new(db))))
    }

    pub fn build(config: Config, store: Arc<dyn StateStore>) -> Self {
        let config = Arc::new(config);
        let aws = AwsCli::new(config.aws.clone());
        let functions = Arc::new(aws.clone());

        let targets = config.cache.environments.clone();
        let sync_timeout = Duration::from_secs(config.cache.sync_timeout_secs);
        let caches = CacheInvalidationCoordinator::new(CacheTimeouts::from_config(&config.cache))
            .with_backend(
                CacheType::Cdn,
                Arc::new(CloudFrontCache::new(aws.clone(), targets.clone())),
            )
            .with_backend(
                CacheType::ApiGateway,
                Arc::new(ApiGatewayCache::new(aws.clone(), targets.clone())),
            )
            .with_backend(
                CacheType::Redis,
                Arc::new(RedisCliCache::new(targets.clone(), sync_timeout)),
            )
            .with_backend(
                CacheType::Application,
                Arc::new(ApplicationCache::new(
                    targets,
                    Duration::from_secs(config.cache.application_timeout_secs),
                )),
            );

        let migrations = config.migration.history_command.as_ref().map(|_| {
            Arc::new(MigrationRollbackCoordinator::new(
                Arc::new(CommandMigrations::new(config.migration.clone())),
                store.clone(),
                Duration::from_secs(config.migration.statement_timeout_secs),
            ))
        });

        let health = Arc::new(HealthMonitor::new(Arc::new(DefaultProbe::new(functions.clone()))));
        let executors = ServiceExecutors::new(
            functions.clone(),
            functions,
            Arc::new(caches),
            migrations.clone(),
            health,
            store.clone(),
            ExecutorSettings::from_config(&config),
        );

        let notifications = NotificationService::from_config(&config.notifications);
        let engine = Arc::new(RollbackEngine::new(
            config.clone(),
            store.clone(),
            Arc::new(executors),
            Arc::new(notifications),
        ));

        Self {
            config,
            store,
            migrations,
            engine,
        }
    }
}
