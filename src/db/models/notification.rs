//! Notification event models.

use serde::{Deserialize, Serialize};

/// Notification event types understood by the external notifier
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationEventType {
    Start,
    Success,
    Failure,
    ApprovalRequired,
    Rollback,
    SecurityAlert,
}

impl std::fmt::Display for NotificationEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::ApprovalRequired => write!(f, "approval_required"),
            Self::Rollback => write!(f, "rollback"),
            Self::SecurityAlert => write!(f, "security_alert"),
        }
    }
}
