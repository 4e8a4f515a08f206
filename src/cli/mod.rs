//! Command-line interface.
//!
//! Subcommands operate directly on the state store:
//! - `serve` - Run health monitors (default)
//! - `deploy` / `live` - Record a deployment and report it live
//! - `rollback` - Roll a service back through the job queue
//! - `status` - Show deployment records
//! - `acknowledge` - Clear a rollback failure marker
//! - `recover` - Fail a rollback left behind by a dead process
//! - `migration plan|rollback` - Database downgrade tooling
//! - `config check` - Validate configuration file

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::Config;
use crate::db::{DeploymentKey, DeploymentRecord};
use crate::engine::{RollbackReport, RollbackRequest, RollbackTarget, RollbackWorker};
use crate::executors::RollbackOptions;
use crate::migrations::{MigrationExecuteOptions, MigrationRollbackCoordinator};
use crate::AppContext;

/// CLI arguments structure
#[derive(Parser, Debug)]
#[command(name = "rollbackr")]
#[command(author, version, about = "Deployment state tracker and rollback orchestrator", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "ROLLBACKR_CONFIG", default_value = "rollbackr.toml")]
    pub config: PathBuf,

    /// Override log level
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Subcommand to run (if none, starts the monitors)
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run health monitors until interrupted
    Serve,

    /// Record that a new version is being deployed
    Deploy {
        service: String,
        environment: String,
        version: String,
        /// Emergency deployment: never roll back on failed health checks
        #[arg(long)]
        skip_health_checks: bool,
        /// Schema revision this release runs against
        #[arg(long)]
        migration: Option<String>,
    },

    /// Report the deploying version live and start monitoring it
    Live { service: String, environment: String },

    /// Roll a service back
    Rollback {
        service: String,
        environment: String,
        /// Explicit version, overriding the stored target
        #[arg(long)]
        target_version: Option<String>,
        /// Return to the last healthy version instead of the previous one
        #[arg(long, conflicts_with = "target_version")]
        last_healthy: bool,
        #[arg(long, default_value = "manual rollback")]
        reason: String,
        #[arg(long)]
        skip_health_checks: bool,
        #[arg(long)]
        skip_cache_invalidation: bool,
    },

    /// Show deployment records
    Status {
        service: Option<String>,
        #[arg(requires = "service")]
        environment: Option<String>,
    },

    /// Clear the failure marker left by a failed or partial rollback
    Acknowledge { service: String, environment: String },

    /// Mark a rollback interrupted mid-flight as failed so the service can be
    /// redeployed. Only use when no rollback process is still running.
    Recover { service: String, environment: String },

    /// Database migration rollback commands
    #[command(subcommand)]
    Migration(MigrationCommands),

    /// Configuration management commands
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand, Debug)]
pub enum MigrationCommands {
    /// Show the downgrade steps to a revision
    Plan(MigrationArgs),
    /// Downgrade the schema
    Rollback {
        #[command(flatten)]
        args: MigrationArgs,
        /// Compute steps without applying them
        #[arg(long)]
        dry_run: bool,
        /// Skip the backup taken before the first downgrade
        #[arg(long)]
        no_backup: bool,
    },
}

#[derive(clap::Args, Debug)]
pub struct MigrationArgs {
    pub service: String,
    pub environment: String,
    /// Current revision (default: asked from the migration tool)
    #[arg(long)]
    pub current: Option<String>,
    /// Target revision
    #[arg(long, conflicts_with = "release")]
    pub target: Option<String>,
    /// Resolve the target from the revision recorded for this release
    #[arg(long)]
    pub release: Option<String>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Validate configuration file
    Check,
}

/// Run a CLI command. `serve` is handled by the binary.
pub async fn run_command(cli: &Cli, config: Config) -> Result<()> {
    let command = match &cli.command {
        Some(Commands::Config(ConfigCommands::Check)) => return cmd_config_check(cli, &config),
        Some(Commands::Serve) | None => return Ok(()),
        Some(command) => command,
    };

    let ctx = AppContext::open(config).await?;
    match command {
        Commands::Deploy {
            service,
            environment,
            version,
            skip_health_checks,
            migration,
        } => {
            let key = DeploymentKey::new(service, environment);
            let record = ctx
                .engine
                .begin_deployment(&key, version, *skip_health_checks, migration.as_deref())
                .await?;
            println!("Deploying {} to {}", record.current_version, key);
            print_record(&record);
            Ok(())
        }
        Commands::Live {
            service,
            environment,
        } => {
            let key = DeploymentKey::new(service, environment);
            let record = ctx.engine.mark_live(&key).await?;
            print_record(&record);
            Ok(())
        }
        Commands::Rollback {
            service,
            environment,
            target_version,
            last_healthy,
            reason,
            skip_health_checks,
            skip_cache_invalidation,
        } => {
            let mut request = RollbackRequest::manual(DeploymentKey::new(service, environment), reason);
            request.target_version = target_version.clone();
            if *last_healthy {
                request.target = RollbackTarget::LastHealthy;
            }
            request.options = RollbackOptions {
                skip_health_checks: *skip_health_checks,
                skip_cache_invalidation: *skip_cache_invalidation,
            };
            cmd_rollback(&ctx, request).await
        }
        Commands::Status {
            service,
            environment,
        } => cmd_status(&ctx, service.as_deref(), environment.as_deref()).await,
        Commands::Acknowledge {
            service,
            environment,
        } => {
            let key = DeploymentKey::new(service, environment);
            let record = ctx.engine.acknowledge(&key).await?;
            println!("Acknowledged {}", key);
            print_record(&record);
            Ok(())
        }
        Commands::Recover {
            service,
            environment,
        } => {
            let key = DeploymentKey::new(service, environment);
            let record = ctx.engine.recover(&key).await?;
            println!("Marked interrupted rollback of {} as failed", key);
            print_record(&record);
            Ok(())
        }
        Commands::Migration(MigrationCommands::Plan(args)) => {
            let coordinator = migration_coordinator(&ctx)?;
            let key = DeploymentKey::new(&args.service, &args.environment);
            let plan = coordinator
                .plan(&key, args.current.as_deref(), args.target.as_deref(), args.release.as_deref())
                .await?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
            Ok(())
        }
        Commands::Migration(MigrationCommands::Rollback {
            args,
            dry_run,
            no_backup,
        }) => {
            let coordinator = migration_coordinator(&ctx)?;
            let key = DeploymentKey::new(&args.service, &args.environment);
            let plan = coordinator
                .plan(&key, args.current.as_deref(), args.target.as_deref(), args.release.as_deref())
                .await?;
            let result = coordinator
                .execute(
                    plan,
                    MigrationExecuteOptions {
                        dry_run: *dry_run,
                        backup_before_rollback: !no_backup
                            && ctx.config.rollback.backup_before_migration_rollback,
                    },
                )
                .await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.succeeded {
                anyhow::bail!(
                    "Migration rollback failed{}",
                    if result.backup_available {
                        "; a backup is available to restore from"
                    } else {
                        ""
                    }
                );
            }
            Ok(())
        }
        Commands::Serve | Commands::Config(_) => Ok(()),
    }
}

fn migration_coordinator(ctx: &AppContext) -> Result<&MigrationRollbackCoordinator> {
    ctx.migrations
        .as_deref()
        .context("No migration commands configured (set migration.history_command)")
}

/// Submit a rollback through the job queue and wait for its report
async fn cmd_rollback(ctx: &AppContext, request: RollbackRequest) -> Result<()> {
    let (queue, worker) = RollbackWorker::new(ctx.engine.clone(), ctx.config.rollback.worker_queue_size);
    let worker = tokio::spawn(worker.run());

    let key = request.key.clone();
    let job = queue.submit(request).await?;
    println!("Submitted rollback job {} for {}", job.id, key);
    let report = job.wait().await;
    drop(queue);
    let _ = worker.await;

    match report? {
        RollbackReport::Completed { record, event } => {
            println!(
                "Rollback {} -> {}: {} (service {})",
                event.from_version, event.to_version, event.outcome, event.service_availability
            );
            print_record(&record);
            if !matches!(event.outcome, crate::db::RollbackResult::Succeeded) {
                anyhow::bail!("Rollback did not complete; run `acknowledge` once resolved");
            }
        }
        RollbackReport::AlreadyInProgress(key) => {
            println!("A rollback for {} is already in progress", key);
        }
        RollbackReport::Blocked(record) => {
            println!("Infrastructure rollback for {} requires manual review", record.key());
            print_record(&record);
        }
        RollbackReport::Aborted(record) => {
            print_record(&record);
            anyhow::bail!("Rollback aborted; run `acknowledge` once resolved");
        }
    }
    Ok(())
}

async fn cmd_status(ctx: &AppContext, service: Option<&str>, environment: Option<&str>) -> Result<()> {
    let records = match (service, environment) {
        (Some(service), Some(environment)) => {
            vec![ctx.engine.record(&DeploymentKey::new(service, environment)).await?]
        }
        (Some(service), None) => ctx
            .engine
            .records()
            .await?
            .into_iter()
            .filter(|r| r.service == service)
            .collect(),
        _ => ctx.engine.records().await?,
    };

    if records.is_empty() {
        println!("No deployments recorded.");
        return Ok(());
    }

    println!(
        "{:<24} {:<12} {:<12} {:<12} {:<20} {}",
        "SERVICE", "ENV", "CURRENT", "PREVIOUS", "STATUS", "FAILURES"
    );
    println!("{}", "-".repeat(92));
    for record in &records {
        println!(
            "{:<24} {:<12} {:<12} {:<12} {:<20} {}",
            truncate(&record.service, 24),
            truncate(&record.environment, 12),
            truncate(&record.current_version, 12),
            truncate(record.previous_version.as_deref().unwrap_or("-"), 12),
            record.status,
            record.consecutive_failures
        );
    }

    if records.len() == 1 {
        println!();
        print_record(&records[0]);
    }

    let unacknowledged: Vec<_> = records
        .iter()
        .filter(|r| r.unacknowledged_failure.is_some())
        .collect();
    if !unacknowledged.is_empty() {
        println!();
        println!("Unacknowledged rollback failures:");
        for record in unacknowledged {
            println!(
                "  [!!] {}: {}",
                record.key(),
                record.unacknowledged_failure.as_deref().unwrap_or_default()
            );
        }
    }
    Ok(())
}

fn print_record(record: &DeploymentRecord) {
    println!("  Key:          {}", record.key());
    println!("  Status:       {}", record.status);
    println!("  Current:      {}", record.current_version);
    println!(
        "  Previous:     {}",
        record.previous_version.as_deref().unwrap_or("-")
    );
    println!(
        "  Last healthy: {}",
        record.last_healthy_version.as_deref().unwrap_or("-")
    );
    if record.skip_health_checks {
        println!("  Health checks skipped (emergency deployment)");
    }
    if let Some(checked) = record.last_health_check_at {
        println!("  Last check:   {}", checked.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(failure) = &record.unacknowledged_failure {
        println!("  [!!] {}", failure);
    }
    if !record.rollback_history.is_empty() {
        println!("  Rollbacks:");
        for event in record.rollback_history.iter().rev().take(5) {
            println!(
                "    {} {} {} -> {} {} ({})",
                event.started_at.format("%Y-%m-%d %H:%M"),
                event.triggered_by,
                event.from_version,
                event.to_version,
                event.outcome,
                event.reason
            );
        }
    }
}

/// Validate configuration file
fn cmd_config_check(cli: &Cli, config: &Config) -> Result<()> {
    println!("Checking configuration: {}", cli.config.display());
    if !cli.config.exists() {
        println!("  [!!] File not found, defaults in use");
    }

    let problems = config.validate();
    println!("  Services:     {}", config.services.len());
    println!("  Targets:      {}", config.targets().len());
    println!(
        "  Threshold:    {} consecutive failures",
        config.rollback.failure_threshold
    );

    if problems.is_empty() {
        println!();
        println!("[OK] Configuration is valid");
        return Ok(());
    }

    println!();
    for problem in &problems {
        println!("  [!!] {}", problem);
    }
    anyhow::bail!("Configuration has {} problem(s)", problems.len())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
