//! Operator notifications for skips, failures and deletions.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::model::{ExecutionRequest, FailureDetail, SkipDetail};

/// Identifying fields of the request a notification is about.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSummary {
    pub name: String,
    pub namespace: Option<String>,
    pub uid: String,
    pub target: String,
    pub workflow: String,
    pub created_at: DateTime<Utc>,
}

impl From<&ExecutionRequest> for RequestSummary {
    fn from(request: &ExecutionRequest) -> Self {
        Self {
            name: request.name().to_string(),
            namespace: request.metadata.namespace.clone(),
            uid: request.uid().to_string(),
            target: request.spec.target.clone(),
            workflow: request.spec.workflow.identity(),
            created_at: request.metadata.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Notification {
    /// Only sent for ResourceBusy; cooldown skips are routine.
    Skipped { request: RequestSummary, detail: SkipDetail },
    Failed { request: RequestSummary, detail: FailureDetail },
    Deleted { request: RequestSummary },
}

impl Notification {
    pub fn request(&self) -> &RequestSummary {
        match self {
            Notification::Skipped { request, .. }
            | Notification::Failed { request, .. }
            | Notification::Deleted { request } => request,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Notification::Skipped { .. } => "skipped",
            Notification::Failed { .. } => "failed",
            Notification::Deleted { .. } => "deleted",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("notification channel unavailable: {0}")]
    Unavailable(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError>;
}

/// Emits each notification as a structured log event.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        let request = notification.request();
        match &notification {
            Notification::Skipped { detail, .. } => warn!(
                request = %request.name,
                locator = %request.target,
                reason = %detail.reason,
                conflicting = %detail.conflicting.name,
                "remediation skipped: {}", detail.message
            ),
            Notification::Failed { detail, .. } => warn!(
                request = %request.name,
                locator = %request.target,
                reason = %detail.reason,
                manual_review = detail.requires_manual_review(),
                "{}", detail.natural_language_summary
            ),
            Notification::Deleted { .. } => info!(
                request = %request.name,
                locator = %request.target,
                "remediation request deleted"
            ),
        }
        Ok(())
    }
}

/// POSTs each notification as JSON to a webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        self.client
            .post(&self.url)
            .json(&notification)
            .send()
            .await?
            .error_for_status()?;
        tracing::debug!(kind = notification.kind(), request = %notification.request().name, "webhook delivered");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _notification: Notification) -> Result<(), NotifyError> {
        Ok(())
    }
}
