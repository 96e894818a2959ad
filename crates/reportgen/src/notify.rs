//! Notification channel.
//!
//! Notifications are advisory: the router logs a failed delivery and moves
//! on, the sub-report update it follows stays in place.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use thiserror::Error;

use crate::report::{ReportStatus, TargetKind};

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Failed to build HTTP client: {0}")]
    Client(String),

    #[error("Notification delivery failed: {0}")]
    Transport(String),

    #[error("Notification endpoint returned HTTP {0}")]
    Status(u16),
}

/// What a notification reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutcomeKind {
    Completed,
    Failed,
}

impl OutcomeKind {
    /// `None` for PENDING, which never triggers a notification.
    pub fn from_status(status: ReportStatus) -> Option<Self> {
        match status {
            ReportStatus::Pending => None,
            ReportStatus::Completed => Some(OutcomeKind::Completed),
            ReportStatus::Failed => Some(OutcomeKind::Failed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub recipient: String,
    pub outcome: OutcomeKind,
    pub submitter: String,
    pub request_id: String,
    pub target_kind: TargetKind,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, n: &Notification) -> Result<(), NotifyError> {
        info!(
            "Notify {}: {} report of {} for {} is {:?}",
            n.recipient, n.target_kind, n.request_id, n.submitter, n.outcome
        );
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _: &Notification) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// POSTs each notification as JSON to a webhook.
pub struct WebhookNotifier {
    client: Client,
    url: String,
    token: Option<SecretString>,
}

impl WebhookNotifier {
    pub fn new(
        url: &str,
        token: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, NotifyError> {
        let client = Client::builder()
            .user_agent(concat!("reportgen/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Client(e.to_string()))?;

        Ok(Self {
            client,
            url: url.to_string(),
            token,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let mut request = self.client.post(&self.url).json(notification);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status(status.as_u16()));
        }
        debug!(
            "Delivered {} notification for {}",
            notification.target_kind, notification.request_id
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_stub::serve_once;

    fn notification() -> Notification {
        Notification {
            recipient: "ops@example.com".to_string(),
            outcome: OutcomeKind::Completed,
            submitter: "alice".to_string(),
            request_id: "Req-1".to_string(),
            target_kind: TargetKind::Excel,
        }
    }

    #[test]
    fn test_outcome_kind_from_status() {
        assert_eq!(OutcomeKind::from_status(ReportStatus::Pending), None);
        assert_eq!(
            OutcomeKind::from_status(ReportStatus::Failed),
            Some(OutcomeKind::Failed)
        );
    }

    #[tokio::test]
    async fn test_log_and_noop_notifiers_succeed() {
        assert!(LogNotifier.notify(&notification()).await.is_ok());
        assert!(NoopNotifier.notify(&notification()).await.is_ok());
    }

    #[tokio::test]
    async fn test_webhook_sends_bearer_token_and_json() {
        let (url, server) = serve_once("204 No Content", "").await;
        let notifier = WebhookNotifier::new(
            &format!("{}/hooks/reports", url),
            Some(SecretString::from("s3cret".to_string())),
            Duration::from_secs(5),
        )
        .unwrap();

        notifier.notify(&notification()).await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /hooks/reports "));
        assert!(request.to_lowercase().contains("authorization: bearer s3cret"));
        assert!(request.contains(r#""outcome":"COMPLETED""#));
        assert!(request.contains(r#""targetKind":"EXCEL""#));
    }

    #[tokio::test]
    async fn test_webhook_error_status() {
        let (url, server) = serve_once("500 Internal Server Error", "").await;
        let notifier = WebhookNotifier::new(&url, None, Duration::from_secs(5)).unwrap();
        let err = notifier.notify(&notification()).await.unwrap_err();
        assert!(matches!(err, NotifyError::Status(500)));
        server.await.unwrap();
    }
}
