//! Deployment record models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::RollbackEvent;

/// Lifecycle status of a (service, environment) deployment record
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Deploying,
    Monitoring,
    Stable,
    RollbackTriggered,
    RollingBack,
    RolledBack,
    RollbackFailed,
    RollbackBlocked,
}

impl DeploymentStatus {
    pub const ALL: [DeploymentStatus; 8] = [
        Self::Deploying,
        Self::Monitoring,
        Self::Stable,
        Self::RollbackTriggered,
        Self::RollingBack,
        Self::RolledBack,
        Self::RollbackFailed,
        Self::RollbackBlocked,
    ];

    /// Terminal states accept no automatic or manual rollback until a new
    /// deployment supersedes them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RollbackFailed | Self::RollbackBlocked)
    }

    /// Legal transitions of the rollback state machine.
    ///
    /// A new deployment may start from any state except `RollingBack`,
    /// since an executor may still be mutating external systems.
    pub fn can_transition_to(&self, next: DeploymentStatus) -> bool {
        use DeploymentStatus::*;

        if next == Deploying {
            return *self != RollingBack;
        }

        match (self, next) {
            (Deploying, Monitoring) => true,
            // Emergency deployments skip monitoring entirely
            (Deploying, Stable) => true,
            (Monitoring, Stable) => true,
            (Monitoring, RollbackTriggered) => true,
            (Monitoring, RollbackBlocked) => true,
            (RollbackTriggered, RollingBack) => true,
            // Armed, but nothing to roll back to
            (RollbackTriggered, RollbackFailed) => true,
            (RollbackTriggered, RollbackBlocked) => true,
            (RollingBack, RolledBack) => true,
            (RollingBack, RollbackFailed) => true,
            // Manual triggers enter directly from any non-terminal resting state
            (Deploying | Monitoring | Stable | RolledBack, RollingBack) => true,
            (Deploying | Stable | RolledBack, RollbackBlocked) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Deploying => write!(f, "deploying"),
            Self::Monitoring => write!(f, "monitoring"),
            Self::Stable => write!(f, "stable"),
            Self::RollbackTriggered => write!(f, "rollback_triggered"),
            Self::RollingBack => write!(f, "rolling_back"),
            Self::RolledBack => write!(f, "rolled_back"),
            Self::RollbackFailed => write!(f, "rollback_failed"),
            Self::RollbackBlocked => write!(f, "rollback_blocked"),
        }
    }
}

impl std::str::FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deploying" => Ok(Self::Deploying),
            "monitoring" => Ok(Self::Monitoring),
            "stable" => Ok(Self::Stable),
            "rollback_triggered" => Ok(Self::RollbackTriggered),
            "rolling_back" => Ok(Self::RollingBack),
            "rolled_back" => Ok(Self::RolledBack),
            "rollback_failed" => Ok(Self::RollbackFailed),
            "rollback_blocked" => Ok(Self::RollbackBlocked),
            _ => Err(format!("Unknown deployment status: {}", s)),
        }
    }
}

/// Partition key of the state store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeploymentKey {
    pub service: String,
    pub environment: String,
}

impl DeploymentKey {
    pub fn new(service: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            environment: environment.into(),
        }
    }
}

impl std::fmt::Display for DeploymentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.service, self.environment)
    }
}

/// Durable state of one service in one environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub service: String,
    pub environment: String,
    pub current_version: String,
    pub previous_version: Option<String>,
    /// Last version that reached `Stable` or was successfully rolled back to
    pub last_healthy_version: Option<String>,
    pub status: DeploymentStatus,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    /// Emergency mode: health failures never trigger an automatic rollback
    pub skip_health_checks: bool,
    pub last_health_check_at: Option<DateTime<Utc>>,
    /// Set when a rollback fails or partially completes; cleared only by
    /// an explicit acknowledgement
    pub unacknowledged_failure: Option<String>,
    pub rollback_history: Vec<RollbackEvent>,
    /// Optimistic concurrency token, bumped on every write
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeploymentRecord {
    /// Record for the first deployment of a (service, environment) pair
    pub fn first_deployment(key: &DeploymentKey, version: &str, status: DeploymentStatus) -> Self {
        let now = Utc::now();
        Self {
            service: key.service.clone(),
            environment: key.environment.clone(),
            current_version: version.to_string(),
            previous_version: None,
            last_healthy_version: None,
            status,
            consecutive_failures: 0,
            consecutive_successes: 0,
            skip_health_checks: false,
            last_health_check_at: None,
            unacknowledged_failure: None,
            rollback_history: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> DeploymentKey {
        DeploymentKey::new(&self.service, &self.environment)
    }

    /// Move `current_version` into `previous_version` and install `new_version`
    pub fn rotate(&mut self, new_version: &str) {
        let old = std::mem::replace(&mut self.current_version, new_version.to_string());
        self.previous_version = Some(old);
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_strings() {
        for status in DeploymentStatus::ALL {
            let parsed: DeploymentStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("paused".parse::<DeploymentStatus>().is_err());
    }

    #[test]
    fn test_rolling_back_is_only_entered_from_allowed_states() {
        use DeploymentStatus::*;
        assert!(Monitoring.can_transition_to(RollingBack));
        assert!(RollbackTriggered.can_transition_to(RollingBack));
        assert!(!RollingBack.can_transition_to(RollingBack));
        assert!(!RollbackFailed.can_transition_to(RollingBack));
        assert!(!RollbackBlocked.can_transition_to(RollingBack));
    }

    #[test]
    fn test_new_deployment_blocked_only_while_rolling_back() {
        use DeploymentStatus::*;
        for status in DeploymentStatus::ALL {
            assert_eq!(status.can_transition_to(Deploying), status != RollingBack);
        }
    }

    #[test]
    fn test_rotate_moves_current_to_previous() {
        let key = DeploymentKey::new("api", "prod");
        let mut record = DeploymentRecord::first_deployment(&key, "v1", DeploymentStatus::Stable);
        record.consecutive_failures = 3;
        record.rotate("v2");
        assert_eq!(record.current_version, "v2");
        assert_eq!(record.previous_version.as_deref(), Some("v1"));
        assert_eq!(record.consecutive_failures, 0);
    }
}
