//! In-process fakes for the external systems, shared by unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::backends::{FunctionBackend, PublishedVersion, SnapshotStorage};
use crate::cache::{CacheBackend, InvalidationTicket};
use crate::config::ServiceTarget;
use crate::db::NotificationEventType;
use crate::error::BackendError;
use crate::health::{Probe, ProbeError, ProbeTarget};
use crate::migrations::{DowngradeStep, MigrationBackend};
use crate::notifications::{NotificationEvent, Notifier};

enum CacheBehavior {
    Completed,
    PendingForever,
    PendingThenComplete(u32),
    Slow(Duration),
    Failing,
}

pub struct FakeCache {
    behavior: CacheBehavior,
    calls: AtomicU32,
    polls: AtomicU32,
}

impl FakeCache {
    fn with(behavior: CacheBehavior) -> Self {
        Self {
            behavior,
            calls: AtomicU32::new(0),
            polls: AtomicU32::new(0),
        }
    }

    pub fn completed() -> Self {
        Self::with(CacheBehavior::Completed)
    }

    pub fn pending_forever() -> Self {
        Self::with(CacheBehavior::PendingForever)
    }

    /// Pending job that reports completion on the `polls`-th status check
    pub fn pending_then_complete(polls: u32) -> Self {
        Self::with(CacheBehavior::PendingThenComplete(polls))
    }

    pub fn slow(delay: Duration) -> Self {
        Self::with(CacheBehavior::Slow(delay))
    }

    pub fn failing() -> Self {
        Self::with(CacheBehavior::Failing)
    }

    /// Invalidation requests received
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CacheBackend for FakeCache {
    async fn invalidate(
        &self,
        _environment: &str,
        _patterns: &[String],
    ) -> Result<InvalidationTicket, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            CacheBehavior::Completed => Ok(InvalidationTicket::Completed),
            CacheBehavior::PendingForever | CacheBehavior::PendingThenComplete(_) => {
                Ok(InvalidationTicket::Pending("job-1".to_string()))
            }
            CacheBehavior::Slow(delay) => {
                tokio::time::sleep(*delay).await;
                Ok(InvalidationTicket::Completed)
            }
            CacheBehavior::Failing => Err(BackendError::Failed("cache unavailable".to_string())),
        }
    }

    async fn job_completed(&self, _environment: &str, _job_id: &str) -> Result<bool, BackendError> {
        let polls = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        match self.behavior {
            CacheBehavior::PendingThenComplete(n) => Ok(polls >= n),
            CacheBehavior::PendingForever => Ok(false),
            _ => Ok(true),
        }
    }
}

/// Probe that replays a script of outcomes; the last entry repeats
pub struct ScriptedProbe {
    script: Mutex<VecDeque<Result<u16, String>>>,
    last: Mutex<Option<Result<u16, String>>>,
    first_delay: Option<Duration>,
    calls: AtomicU32,
}

impl ScriptedProbe {
    pub fn new(script: Vec<Result<u16, String>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(None),
            first_delay: None,
            calls: AtomicU32::new(0),
        }
    }

    pub fn always(status: u16) -> Self {
        Self::new(vec![Ok(status)])
    }

    /// Delay only the first attempt, to exercise the per-attempt timeout
    pub fn with_first_delay(mut self, delay: Duration) -> Self {
        self.first_delay = Some(delay);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Probe for ScriptedProbe {
    async fn probe(&self, _target: &ProbeTarget) -> Result<u16, ProbeError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call == 0 {
            if let Some(delay) = self.first_delay {
                tokio::time::sleep(delay).await;
            }
        }

        let next = {
            let mut script = self.script.lock();
            let mut last = self.last.lock();
            match script.pop_front() {
                Some(outcome) => {
                    *last = Some(outcome.clone());
                    Some(outcome)
                }
                None => last.clone(),
            }
        };

        match next {
            Some(Ok(status)) => Ok(status),
            Some(Err(message)) => Err(ProbeError::Transport(message)),
            None => Err(ProbeError::Transport("probe script is empty".to_string())),
        }
    }
}

pub struct FakeMigrations {
    history: Vec<String>,
    current: Mutex<String>,
    failing_on: Option<String>,
    failing_backup: bool,
    backups: Mutex<Vec<String>>,
    operations: Mutex<Vec<String>>,
}

impl FakeMigrations {
    pub fn new(history: Vec<String>, current: &str) -> Self {
        Self {
            history,
            current: Mutex::new(current.to_string()),
            failing_on: None,
            failing_backup: false,
            backups: Mutex::new(Vec::new()),
            operations: Mutex::new(Vec::new()),
        }
    }

    /// Fail the step that reverts `revision`
    pub fn failing_on(mut self, revision: &str) -> Self {
        self.failing_on = Some(revision.to_string());
        self
    }

    pub fn failing_backup(mut self) -> Self {
        self.failing_backup = true;
        self
    }

    pub fn current_revision(&self) -> String {
        self.current.lock().clone()
    }

    pub fn backups(&self) -> Vec<String> {
        self.backups.lock().clone()
    }

    /// Every mutating call in order: "backup" or "downgrade FROM->TO"
    pub fn operations(&self) -> Vec<String> {
        self.operations.lock().clone()
    }
}

#[async_trait]
impl MigrationBackend for FakeMigrations {
    async fn history(&self) -> Result<Vec<String>, BackendError> {
        Ok(self.history.clone())
    }

    async fn current(&self) -> Result<String, BackendError> {
        Ok(self.current_revision())
    }

    async fn apply_downgrade(&self, step: &DowngradeStep) -> Result<(), BackendError> {
        self.operations
            .lock()
            .push(format!("downgrade {}->{}", step.from, step.to));
        if self.failing_on.as_deref() == Some(step.from.as_str()) {
            return Err(BackendError::Failed(format!(
                "downgrade of {} raised an error",
                step.from
            )));
        }
        *self.current.lock() = step.to.clone();
        Ok(())
    }

    async fn create_backup(&self) -> Result<String, BackendError> {
        if self.failing_backup {
            return Err(BackendError::Failed("snapshot quota exceeded".to_string()));
        }
        let mut backups = self.backups.lock();
        let id = format!("backup-{}", backups.len() + 1);
        backups.push(id.clone());
        self.operations.lock().push("backup".to_string());
        Ok(id)
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<NotificationEvent>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<NotificationEvent> {
        self.events.lock().clone()
    }

    pub fn types(&self) -> Vec<NotificationEventType> {
        self.events.lock().iter().map(|e| e.event_type).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: &NotificationEvent) -> anyhow::Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

#[derive(Default)]
struct FunctionState {
    versions: HashMap<String, Vec<PublishedVersion>>,
    aliases: HashMap<(String, String), String>,
}

/// Alias-addressed functions held in memory
pub struct FakeFunctions {
    state: Mutex<FunctionState>,
    update_delay: Mutex<Option<Duration>>,
    failing_updates: AtomicU32,
    alias_updates: AtomicU32,
}

impl FakeFunctions {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FunctionState::default()),
            update_delay: Mutex::new(None),
            failing_updates: AtomicU32::new(0),
            alias_updates: AtomicU32::new(0),
        }
    }

    /// Publish `(version, description)` pairs, oldest first
    pub fn publish(&self, function: &str, versions: &[(&str, &str)]) {
        let published = versions
            .iter()
            .map(|(version, description)| PublishedVersion {
                version: version.to_string(),
                description: description.to_string(),
            })
            .collect();
        self.state
            .lock()
            .versions
            .insert(function.to_string(), published);
    }

    pub fn set_alias(&self, function: &str, alias: &str, version: &str) {
        self.state
            .lock()
            .aliases
            .insert((function.to_string(), alias.to_string()), version.to_string());
    }

    pub fn alias(&self, function: &str, alias: &str) -> Option<String> {
        self.state
            .lock()
            .aliases
            .get(&(function.to_string(), alias.to_string()))
            .cloned()
    }

    /// Slow down alias updates so concurrent callers overlap
    pub fn set_update_delay(&self, delay: Duration) {
        *self.update_delay.lock() = Some(delay);
    }

    /// The next `n` alias updates fail with a throttling error
    pub fn fail_next_updates(&self, n: u32) {
        self.failing_updates.store(n, Ordering::SeqCst);
    }

    pub fn alias_updates(&self) -> u32 {
        self.alias_updates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FunctionBackend for FakeFunctions {
    async fn alias_version(&self, function: &str, alias: &str) -> Result<String, BackendError> {
        self.alias(function, alias).ok_or_else(|| {
            BackendError::Validation(format!("alias {} of {} not found", alias, function))
        })
    }

    async fn published_versions(
        &self,
        function: &str,
    ) -> Result<Vec<PublishedVersion>, BackendError> {
        self.state
            .lock()
            .versions
            .get(function)
            .cloned()
            .ok_or_else(|| BackendError::Validation(format!("function {} not found", function)))
    }

    async fn update_alias(
        &self,
        function: &str,
        alias: &str,
        version: &str,
    ) -> Result<(), BackendError> {
        self.alias_updates.fetch_add(1, Ordering::SeqCst);
        let delay = *self.update_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .failing_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(BackendError::Transient("ThrottlingException".to_string()));
        }

        self.set_alias(function, alias, version);
        Ok(())
    }

    async fn invoke(
        &self,
        _function: &str,
        _qualifier: &str,
        _payload: &serde_json::Value,
    ) -> Result<u16, BackendError> {
        Ok(200)
    }
}

/// Snapshots keyed by "environment/version"
#[derive(Default)]
pub struct FakeStorage {
    snapshots: Mutex<HashSet<String>>,
    restores: Mutex<Vec<String>>,
}

impl FakeStorage {
    pub fn add_snapshot(&self, environment: &str, version: &str) {
        self.snapshots
            .lock()
            .insert(format!("{}/{}", environment, version));
    }

    pub fn restores(&self) -> Vec<String> {
        self.restores.lock().clone()
    }
}

#[async_trait]
impl SnapshotStorage for FakeStorage {
    async fn snapshot_exists(
        &self,
        target: &ServiceTarget,
        version: &str,
    ) -> Result<bool, BackendError> {
        Ok(self
            .snapshots
            .lock()
            .contains(&format!("{}/{}", target.key.environment, version)))
    }

    async fn restore_snapshot(
        &self,
        target: &ServiceTarget,
        version: &str,
    ) -> Result<(), BackendError> {
        self.restores
            .lock()
            .push(format!("{}/{}", target.key.environment, version));
        Ok(())
    }
}
