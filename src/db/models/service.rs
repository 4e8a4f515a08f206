//! Service type model.

use serde::{Deserialize, Serialize};

/// Kind of independently deployable service; selects the rollback strategy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    /// Alias-based blue/green API
    Api,
    /// Static assets served from object storage behind a CDN
    Web,
    /// Standalone functions pinned by alias
    Lambda,
    /// Infrastructure changes, always manually gated
    Infrastructure,
}

impl ServiceType {
    /// Whether rollbacks of this service type may run without a human
    pub fn supports_automatic_rollback(&self) -> bool {
        !matches!(self, Self::Infrastructure)
    }
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Api => write!(f, "api"),
            Self::Web => write!(f, "web"),
            Self::Lambda => write!(f, "lambda"),
            Self::Infrastructure => write!(f, "infrastructure"),
        }
    }
}

impl std::str::FromStr for ServiceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "api" => Ok(Self::Api),
            "web" => Ok(Self::Web),
            "lambda" | "lambda-functions" => Ok(Self::Lambda),
            "infrastructure" | "infra" => Ok(Self::Infrastructure),
            _ => Err(format!("Unknown service type: {}", s)),
        }
    }
}
