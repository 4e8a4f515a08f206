//! Notification events for the external notifier.
//!
//! Events are structured; formatting and delivery to chat or paging systems
//! belong to whatever listens on the webhook.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config::NotificationConfig;
use crate::db::{DeploymentKey, NotificationEventType};

/// Event payload delivered to notifiers
#[derive(Debug, Clone, Serialize)]
pub struct NotificationEvent {
    #[serde(rename = "type")]
    pub event_type: NotificationEventType,
    pub service: String,
    pub environment: String,
    pub version: Option<String>,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn new(
        event_type: NotificationEventType,
        key: &DeploymentKey,
        version: Option<&str>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            service: key.service.clone(),
            environment: key.environment.clone(),
            version: version.map(str::to_string),
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    /// One-line summary
    pub fn title(&self) -> String {
        let subject = format!("{}/{}", self.service, self.environment);
        match self.event_type {
            NotificationEventType::Start => format!("Deployment Started: {}", subject),
            NotificationEventType::Success => format!("Deployment Healthy: {}", subject),
            NotificationEventType::Failure => format!("Failure: {}", subject),
            NotificationEventType::ApprovalRequired => format!("Approval Required: {}", subject),
            NotificationEventType::Rollback => format!("Rollback: {}", subject),
            NotificationEventType::SecurityAlert => format!("Security Alert: {}", subject),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &NotificationEvent) -> Result<()>;
}

/// Writes events to the log only
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &NotificationEvent) -> Result<()> {
        tracing::info!(
            event_type = %event.event_type,
            service = %event.service,
            environment = %event.environment,
            version = event.version.as_deref().unwrap_or("-"),
            reason = %event.reason,
            "{}",
            event.title()
        );
        Ok(())
    }
}

/// POSTs events as JSON to a webhook
pub struct WebhookNotifier {
    url: String,
    http_client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: String, timeout: Duration) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { url, http_client }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &NotificationEvent) -> Result<()> {
        let response = self
            .http_client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .context("Failed to send notification webhook")?;

        if !response.status().is_success() {
            anyhow::bail!("Notification webhook returned {}", response.status());
        }
        Ok(())
    }
}

/// Fans events out to every configured notifier
pub struct NotificationService {
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl NotificationService {
    pub fn new(notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        Self { notifiers }
    }

    pub fn from_config(config: &NotificationConfig) -> Self {
        let mut notifiers: Vec<Arc<dyn Notifier>> = vec![Arc::new(LogNotifier)];
        if let Some(url) = &config.webhook_url {
            notifiers.push(Arc::new(WebhookNotifier::new(
                url.clone(),
                Duration::from_secs(config.timeout_secs),
            )));
        }
        Self::new(notifiers)
    }

    /// Deliver an event. Delivery failures are logged, never swallowed
    /// silently, and never abort the caller.
    pub async fn send(&self, event: &NotificationEvent) {
        for notifier in &self.notifiers {
            if let Err(e) = notifier.notify(event).await {
                tracing::error!(
                    event_type = %event.event_type,
                    service = %event.service,
                    environment = %event.environment,
                    error = %e,
                    "Failed to deliver notification"
                );
            }
        }
    }
}
