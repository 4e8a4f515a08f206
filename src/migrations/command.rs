//! Migration backend driven by configured shell commands.

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use super::{DowngradeStep, MigrationBackend};
use crate::backends::{classify_failure, run_shell};
use crate::config::MigrationConfig;
use crate::error::BackendError;

pub struct CommandMigrations {
    config: MigrationConfig,
    timeout: Duration,
}

impl CommandMigrations {
    pub fn new(config: MigrationConfig) -> Self {
        let timeout = Duration::from_secs(config.statement_timeout_secs);
        Self { config, timeout }
    }

    fn command<'a>(&self, value: &'a Option<String>, name: &str) -> Result<&'a str, BackendError> {
        value
            .as_deref()
            .ok_or_else(|| BackendError::Validation(format!("migration.{} is not configured", name)))
    }

    async fn run(&self, script: &str) -> Result<String, BackendError> {
        debug!(command = %script, "Running migration command");
        let output = run_shell(script, self.timeout).await?;
        if output.exit_code != 0 {
            return Err(classify_failure("migration command", &output.stderr));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl MigrationBackend for CommandMigrations {
    async fn history(&self) -> Result<Vec<String>, BackendError> {
        let script = self.command(&self.config.history_command, "history_command")?;
        let stdout = self.run(script).await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn current(&self) -> Result<String, BackendError> {
        let script = self.command(&self.config.current_command, "current_command")?;
        let revision = self.run(script).await?.trim().to_string();
        if revision.is_empty() {
            return Err(BackendError::Failed(
                "current_command printed no revision".to_string(),
            ));
        }
        Ok(revision)
    }

    async fn apply_downgrade(&self, step: &DowngradeStep) -> Result<(), BackendError> {
        let template = self.command(&self.config.downgrade_command, "downgrade_command")?;
        let script = template
            .replace("{revision}", &step.to)
            .replace("{from}", &step.from);
        self.run(&script).await?;
        Ok(())
    }

    async fn create_backup(&self) -> Result<String, BackendError> {
        let script = self.command(&self.config.backup_command, "backup_command")?;
        let id = self.run(script).await?.trim().to_string();
        if id.is_empty() {
            return Err(BackendError::Failed(
                "backup_command printed no backup id".to_string(),
            ));
        }
        Ok(id)
    }
}
