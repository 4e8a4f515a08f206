//! Rollback event models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who initiated a rollback
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TriggeredBy {
    Automatic,
    Manual,
}

impl std::fmt::Display for TriggeredBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Automatic => write!(f, "automatic"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

impl std::str::FromStr for TriggeredBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "automatic" => Ok(Self::Automatic),
            "manual" => Ok(Self::Manual),
            _ => Err(format!("Unknown rollback trigger: {}", s)),
        }
    }
}

/// Final result of a rollback execution
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RollbackResult {
    Succeeded,
    Failed,
    /// Traffic already shifted but a later step (e.g. cache invalidation) failed
    Partial,
}

impl std::fmt::Display for RollbackResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Partial => write!(f, "partial"),
        }
    }
}

impl std::str::FromStr for RollbackResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "partial" => Ok(Self::Partial),
            _ => Err(format!("Unknown rollback outcome: {}", s)),
        }
    }
}

/// Whether the service kept serving traffic during the rollback
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServiceAvailability {
    Maintained,
    Interrupted,
}

impl std::fmt::Display for ServiceAvailability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Maintained => write!(f, "maintained"),
            Self::Interrupted => write!(f, "interrupted"),
        }
    }
}

impl std::str::FromStr for ServiceAvailability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "maintained" => Ok(Self::Maintained),
            "interrupted" => Ok(Self::Interrupted),
            _ => Err(format!("Unknown service availability: {}", s)),
        }
    }
}

/// One entry of a record's rollback history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollbackEvent {
    pub id: String,
    pub triggered_by: TriggeredBy,
    pub reason: String,
    pub from_version: String,
    pub to_version: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RollbackResult,
    pub service_availability: ServiceAvailability,
}
