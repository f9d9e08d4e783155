//! Notification capability: the engine only knows the `Notifier` contract;
//! the default implementation posts to a configured webhook endpoint.

use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::core::error::EngineError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub channel: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationReceipt {
    pub ok: bool,
    pub provider_response: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, request: &NotificationRequest) -> Result<NotificationReceipt, EngineError>;
}

/// Posts the notification as JSON to a fixed endpoint. Stands in for the
/// mail relay the deployment wires up out-of-process.
pub struct WebhookNotifier {
    client: Client,
    endpoint: String,
}

impl WebhookNotifier {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, request: &NotificationRequest) -> Result<NotificationReceipt, EngineError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| EngineError::Internal(format!("notification dispatch: {e}")))?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.is_success() {
            Ok(NotificationReceipt {
                ok: true,
                provider_response: body,
            })
        } else {
            Err(EngineError::Internal(format!(
                "notification endpoint returned {status}: {body}"
            )))
        }
    }
}

/// Records every request; optionally fails the first N sends. Used by tests
/// and as an offline fallback.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<NotificationRequest>>,
    failures_remaining: Mutex<u32>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_first(count: u32) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failures_remaining: Mutex::new(count),
        }
    }

    pub fn sent(&self) -> Vec<NotificationRequest> {
        self.sent.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, request: &NotificationRequest) -> Result<NotificationReceipt, EngineError> {
        {
            let mut failures = self
                .failures_remaining
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            if *failures > 0 {
                *failures -= 1;
                return Err(EngineError::Internal("scripted notifier failure".to_string()));
            }
        }
        self.sent
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(request.clone());
        Ok(NotificationReceipt {
            ok: true,
            provider_response: "recorded".to_string(),
        })
    }
}
