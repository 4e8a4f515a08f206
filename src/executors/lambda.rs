//! Standalone functions, each repointed through its alias.

use tracing::{info, warn};

use super::{ExecutionRequest, RollbackOutcome, ServiceExecutors};
use crate::backends::PublishedVersion;
use crate::error::RollbackError;
use crate::health::ProbeTarget;

/// Version to roll `function` back to: the one published for the target
/// release. Only when the target is the record's previous release may it
/// fall back to the newest version older than the live one.
fn choose_version<'a>(
    function: &str,
    versions: &'a [PublishedVersion],
    live: &str,
    release: &str,
    fallback_to_predecessor: bool,
) -> Result<&'a PublishedVersion, RollbackError> {
    if let Some(published) = versions.iter().rev().find(|v| v.description == release) {
        return Ok(published);
    }
    if !fallback_to_predecessor {
        return Err(RollbackError::Validation(format!(
            "no published version of {} for release {}",
            function, release
        )));
    }

    let live_idx = versions.iter().position(|v| v.version == live).ok_or_else(|| {
        RollbackError::Validation(format!(
            "live version {} of {} is not a published version",
            live, function
        ))
    })?;
    if live_idx == 0 {
        return Err(RollbackError::Validation(format!(
            "{} has no version older than {}",
            function, live
        )));
    }
    Ok(&versions[live_idx - 1])
}

pub(super) async fn execute(
    executors: &ServiceExecutors,
    request: &ExecutionRequest,
) -> Result<RollbackOutcome, RollbackError> {
    let target = &request.target;
    if target.functions.is_empty() {
        return Err(RollbackError::Validation(format!(
            "no functions configured for {}",
            target.key
        )));
    }

    let mut repointed = Vec::new();
    for function in &target.functions {
        match repoint(executors, request, function).await {
            Ok(version) => repointed.push((function.clone(), version)),
            Err(e) if repointed.is_empty() => return Err(e),
            Err(e) => {
                warn!(
                    key = %target.key,
                    function = %function,
                    repointed = repointed.len(),
                    error = %e,
                    "Function rollback failed after others were repointed"
                );
                let done: Vec<&str> = repointed.iter().map(|(f, _)| f.as_str()).collect();
                return Ok(RollbackOutcome::partial(format!(
                    "{} failed ({}); already repointed: {}",
                    function,
                    e,
                    done.join(", ")
                )));
            }
        }
    }

    for (function, _) in &repointed {
        let probe = ProbeTarget::function(function, &target.alias);
        if let Some(check) = executors.verify(request, Some(probe)).await {
            if !check.is_healthy() {
                return Ok(RollbackOutcome::unhealthy(&check));
            }
        }
    }

    let pinned: Vec<String> = repointed
        .iter()
        .map(|(function, version)| format!("{}@{}", function, version))
        .collect();
    let mut outcome = RollbackOutcome::succeeded();
    outcome.detail = Some(format!("pinned {}", pinned.join(", ")));
    Ok(outcome)
}

async fn repoint(
    executors: &ServiceExecutors,
    request: &ExecutionRequest,
    function: &str,
) -> Result<String, RollbackError> {
    let alias = &request.target.alias;
    let live = executors
        .retrying("get alias", || executors.functions.alias_version(function, alias))
        .await?;
    let versions = executors
        .retrying("list versions", || executors.functions.published_versions(function))
        .await?;
    let fallback = request.previous_version.as_deref() == Some(request.target_version.as_str());
    let chosen = choose_version(function, &versions, &live, &request.target_version, fallback)?;

    executors
        .retrying("update alias", || {
            executors.functions.update_alias(function, alias, &chosen.version)
        })
        .await?;

    info!(function = %function, alias = %alias, from = %live, to = %chosen.version, "Function alias repointed");
    Ok(chosen.version.clone())
}
