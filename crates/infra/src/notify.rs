//! Failure notification sinks.
//!
//! Delivery is best-effort: the coordinator logs a sink error and still
//! returns the job's failure.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

use jobgate_core::JobIdentity;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

/// Human-facing failure message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub identity: JobIdentity,
    pub subject: String,
    pub message: String,
}

impl Notification {
    pub fn failure(identity: &JobIdentity, error: &str) -> Self {
        Self {
            identity: identity.clone(),
            subject: format!("Job failure - {identity}"),
            message: format!("Job failed for {identity}\n\nError:\n{error}"),
        }
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Report that the job for `identity` failed with `error`.
    async fn notify(&self, identity: &JobIdentity, error: &str) -> Result<(), NotifyError>;
}

/// Emits notifications as error-level log events.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn notify(&self, identity: &JobIdentity, error: &str) -> Result<(), NotifyError> {
        let notification = Notification::failure(identity, error);
        error!(
            identity = %notification.identity,
            subject = %notification.subject,
            message = %notification.message,
            "job failure notification"
        );
        Ok(())
    }
}

/// Keeps every notification in memory (tests/dry runs).
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn notify(&self, identity: &JobIdentity, error: &str) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .map_err(|_| NotifyError::Delivery("recorder poisoned".to_string()))?
            .push(Notification::failure(identity, error));
        Ok(())
    }
}

#[cfg(feature = "webhook")]
pub use webhook::WebhookNotifier;

#[cfg(feature = "webhook")]
mod webhook {
    use std::time::Duration;

    use super::*;

    /// Posts the notification as JSON to an HTTP endpoint.
    #[derive(Debug, Clone)]
    pub struct WebhookNotifier {
        client: reqwest::Client,
        url: String,
    }

    impl WebhookNotifier {
        pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .map_err(|e| NotifyError::Delivery(e.to_string()))?;
            Ok(Self {
                client,
                url: url.into(),
            })
        }
    }

    #[async_trait]
    impl NotificationSink for WebhookNotifier {
        async fn notify(&self, identity: &JobIdentity, error: &str) -> Result<(), NotifyError> {
            self.client
                .post(&self.url)
                .json(&Notification::failure(identity, error))
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| NotifyError::Delivery(e.to_string()))?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_notification_format() {
        let id = JobIdentity::new("2025-06-01").unwrap();
        let n = Notification::failure(&id, "boom");
        assert_eq!(n.subject, "Job failure - 2025-06-01");
        assert_eq!(n.message, "Job failed for 2025-06-01\n\nError:\nboom");
    }

    #[tokio::test]
    async fn recording_notifier_keeps_messages() {
        let sink = RecordingNotifier::new();
        let id = JobIdentity::new("job-x").unwrap();
        sink.notify(&id, "a").await.unwrap();
        sink.notify(&id, "b").await.unwrap();

        let sent = sink.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].message, "Job failed for job-x\n\nError:\nb");
        assert!(LogNotifier.notify(&id, "a").await.is_ok());
    }
}
