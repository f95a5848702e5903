//! Notifier port
//!
//! Outbound messages carry an idempotency key; the mail layer uses it to drop
//! repeats so that retried orchestration never notifies a pro twice.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::MailConfig;

/// Category of the completion notification.
pub const JOB_COMPLETED: &str = "job_completed";

/// An outbound message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub category: String,
    pub idempotency_key: String,
    pub to: String,
    pub subject: String,
    pub payload: Value,
}

impl Notification {
    /// Completion notice keyed `job_completed:{job_id}`.
    pub fn job_completed(job_id: &str, pro_id: &str, to: &str, amount: f64) -> Self {
        Self {
            category: JOB_COMPLETED.to_string(),
            idempotency_key: format!("{JOB_COMPLETED}:{job_id}"),
            to: to.to_string(),
            subject: format!("Job {job_id} completed: ${amount:.2} payout pending"),
            payload: json!({
                "job_id": job_id,
                "pro_id": pro_id,
                "amount": amount,
            }),
        }
    }

    fn text_body(&self) -> String {
        let amount = self.payload.get("amount").and_then(Value::as_f64).unwrap_or(0.0);
        let job_id = self.payload.get("job_id").and_then(Value::as_str).unwrap_or("");
        format!(
            "Thanks for completing job {job_id}. A payout of ${amount:.2} is pending approval."
        )
    }
}

/// Outcome of a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// The idempotency key was already used; nothing was sent.
    Duplicate,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("mail provider rejected message ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("mail transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<Delivery, NotifyError>;
}

/// Writes notifications to the log only.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: &Notification) -> Result<Delivery, NotifyError> {
        info!(
            category = %notification.category,
            key = %notification.idempotency_key,
            to = %notification.to,
            "notification (log only)"
        );
        Ok(Delivery::Sent)
    }
}

/// Records notifications in memory and drops repeated idempotency keys.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<Notification>>,
    keys: Mutex<HashSet<String>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn send(&self, notification: &Notification) -> Result<Delivery, NotifyError> {
        let fresh = self
            .keys
            .lock()
            .map(|mut keys| keys.insert(notification.idempotency_key.clone()))
            .unwrap_or(false);
        if !fresh {
            debug!(key = %notification.idempotency_key, "duplicate notification dropped");
            return Ok(Delivery::Duplicate);
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(notification.clone());
        }
        Ok(Delivery::Sent)
    }
}

/// Posts notifications to a mail HTTP API with an `Idempotency-Key` header.
pub struct HttpNotifier {
    client: reqwest::Client,
    config: MailConfig,
}

impl HttpNotifier {
    pub fn new(config: MailConfig) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client, config })
    }

    fn body(&self, notification: &Notification) -> Value {
        json!({
            "from": self.config.from,
            "to": [notification.to],
            "subject": notification.subject,
            "text": notification.text_body(),
            "tags": [{"name": "category", "value": notification.category}],
        })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn send(&self, notification: &Notification) -> Result<Delivery, NotifyError> {
        let mut request = self
            .client
            .post(&self.config.api_url)
            .header("Idempotency-Key", &notification.idempotency_key)
            .json(&self.body(notification));
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.as_u16() == 409 {
            debug!(key = %notification.idempotency_key, "mail provider reports duplicate key");
            return Ok(Delivery::Duplicate);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        info!(
            key = %notification.idempotency_key,
            to = %notification.to,
            "notification sent"
        );
        Ok(Delivery::Sent)
    }
}
