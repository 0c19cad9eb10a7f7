//! Durable event queue abstraction and its HTTP implementation.
//!
//! `HttpQueue` speaks the SQS-compatible JSON protocol (`X-Amz-Target`
//! headers, `application/x-amz-json-1.0` bodies), which ElasticMQ and
//! LocalStack-style endpoints accept without request signing. `nack` resets
//! the entry's visibility to zero so it redelivers immediately.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// Long-poll ceiling imposed by the queue protocol itself.
pub const MAX_WAIT_SECONDS: u64 = 20;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Queue API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Decode error: {0}")]
    Decode(String),
}

#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub message_id: String,
    pub receipt: String,
    pub body: String,
}

#[async_trait]
pub trait EventQueue: Send + Sync {
    async fn send(&self, body: &str) -> Result<(), QueueError>;

    /// Long-poll for up to `wait_seconds` (capped at 20), returning at most
    /// `max_messages` entries.
    async fn receive(
        &self,
        max_messages: u32,
        wait_seconds: u64,
    ) -> Result<Vec<QueueMessage>, QueueError>;

    /// Delete a delivered entry. Only called once its inbound message row is
    /// durably written.
    async fn ack(&self, receipt: &str) -> Result<(), QueueError>;

    /// Return the entry to the queue for immediate redelivery.
    async fn nack(&self, receipt: &str) -> Result<(), QueueError>;
}

pub struct HttpQueue {
    client: reqwest::Client,
    url: String,
    visibility_timeout: u64,
}

impl HttpQueue {
    pub fn new(url: impl Into<String>, visibility_timeout: u64) -> Self {
        // No request-level timeout here: long-polling legitimately holds the
        // connection open for wait_seconds. A connect timeout still bounds
        // unreachable endpoints.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: url.into(),
            visibility_timeout,
        }
    }

    async fn call(&self, target: &str, body: Value) -> Result<Value, QueueError> {
        let resp = self
            .client
            .post(&self.url)
            .header("x-amz-target", format!("AmazonSQS.{target}"))
            .header("content-type", "application/x-amz-json-1.0")
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let message = resp.text().await.unwrap_or_default();
            warn!(target, status, body = %message, "queue API error");
            return Err(QueueError::Api { status, message });
        }

        let text = resp.text().await?;
        if text.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| QueueError::Decode(e.to_string()))
    }
}

#[async_trait]
impl EventQueue for HttpQueue {
    async fn send(&self, body: &str) -> Result<(), QueueError> {
        self.call(
            "SendMessage",
            json!({
                "QueueUrl": self.url,
                "MessageBody": body,
            }),
        )
        .await?;
        debug!(bytes = body.len(), "event enqueued");
        Ok(())
    }

    async fn receive(
        &self,
        max_messages: u32,
        wait_seconds: u64,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let resp = self
            .call(
                "ReceiveMessage",
                json!({
                    "QueueUrl": self.url,
                    "MaxNumberOfMessages": max_messages.min(10),
                    "WaitTimeSeconds": wait_seconds.min(MAX_WAIT_SECONDS),
                    "VisibilityTimeout": self.visibility_timeout,
                }),
            )
            .await?;

        let messages = resp
            .get("Messages")
            .and_then(|m| m.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| {
                        Some(QueueMessage {
                            message_id: m.get("MessageId")?.as_str()?.to_string(),
                            receipt: m.get("ReceiptHandle")?.as_str()?.to_string(),
                            body: m.get("Body")?.as_str()?.to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(messages)
    }

    async fn ack(&self, receipt: &str) -> Result<(), QueueError> {
        self.call(
            "DeleteMessage",
            json!({
                "QueueUrl": self.url,
                "ReceiptHandle": receipt,
            }),
        )
        .await?;
        Ok(())
    }

    async fn nack(&self, receipt: &str) -> Result<(), QueueError> {
        self.call(
            "ChangeMessageVisibility",
            json!({
                "QueueUrl": self.url,
                "ReceiptHandle": receipt,
                "VisibilityTimeout": 0,
            }),
        )
        .await?;
        Ok(())
    }
}
