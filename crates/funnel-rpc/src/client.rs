//! Worker-side client for the state-store RPC surface.
//!
//! The worker has no database handle of its own; everything it knows about
//! tenants, conversations and messages flows through here. Transport errors
//! and 5xx responses are retried a bounded number of times with jittered
//! backoff; 4xx responses are surfaced immediately.

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::warn;

use funnel_core::events::ObserverEvent;
use funnel_core::types::{Conversation, MessageOrigin, Tenant};

use crate::types::{
    ConversationContext, ConversationPatch, IncomingMessage, IncomingOutcome, OutgoingMessage,
    ResetStats, SendMessage,
};

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 200;
const BACKOFF_JITTER_MS: u64 = 100;
const REQUEST_TIMEOUT_SECS: u64 = 15;

pub const INTERNAL_SECRET_HEADER: &str = "x-internal-secret";

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("RPC error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Decode error: {0}")]
    Decode(String),
}

impl RpcError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RpcError::Api { status: 404, .. })
    }
}

pub struct RpcClient {
    client: reqwest::Client,
    base_url: String,
    secret: String,
}

impl RpcClient {
    pub fn new(base_url: impl Into<String>, secret: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
            secret: secret.into(),
        }
    }

    pub async fn tenant_by_phone_number_id(&self, pnid: &str) -> Result<Tenant, RpcError> {
        self.get(&format!("/tenants/by-phone-number-id/{pnid}"))
            .await
    }

    /// Resolve (tenant, phone) to its conversation, creating the lead and
    /// conversation on first contact.
    pub async fn conversation_by_phone(
        &self,
        tenant_id: i64,
        phone: &str,
    ) -> Result<Conversation, RpcError> {
        // Phones may carry a leading '+', which raw query strings mangle.
        self.get(&format!(
            "/conversations/by-phone?tenant_id={tenant_id}&phone={}",
            urlencoding::encode(phone)
        ))
        .await
    }

    pub async fn get_conversation(&self, id: i64) -> Result<Conversation, RpcError> {
        self.get(&format!("/conversations/{id}")).await
    }

    pub async fn patch_conversation(
        &self,
        id: i64,
        patch: &ConversationPatch,
    ) -> Result<Conversation, RpcError> {
        self.send_json(reqwest::Method::PATCH, &format!("/conversations/{id}"), patch)
            .await
    }

    pub async fn conversation_context(
        &self,
        id: i64,
        messages: u32,
    ) -> Result<ConversationContext, RpcError> {
        self.get(&format!("/conversations/{id}/context?messages={messages}"))
            .await
    }

    pub async fn record_incoming(
        &self,
        msg: &IncomingMessage,
    ) -> Result<IncomingOutcome, RpcError> {
        self.send_json(reqwest::Method::POST, "/messages/incoming", msg)
            .await
    }

    pub async fn record_outgoing(
        &self,
        conversation_id: i64,
        origin: MessageOrigin,
        content: &str,
    ) -> Result<funnel_core::types::Message, RpcError> {
        let msg = OutgoingMessage {
            conversation_id,
            origin,
            content: content.to_string(),
        };
        self.send_json(reqwest::Method::POST, "/messages/outgoing", &msg)
            .await
    }

    pub async fn due_followups(
        &self,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<Conversation>, RpcError> {
        // 'Z' suffix rather than '+00:00': the offset form is not
        // query-string safe.
        self.get(&format!(
            "/conversations/due-followups?now={}",
            now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        ))
        .await
    }

    /// Server-side atomic increment of the nudge counters.
    pub async fn increment_nudge(&self, conversation_id: i64) -> Result<(), RpcError> {
        let _: serde_json::Value = self
            .send_json_no_body(
                reqwest::Method::POST,
                &format!("/conversations/{conversation_id}/nudge"),
            )
            .await?;
        Ok(())
    }

    /// Dispatch an outbound message. Provider formatting and session-window
    /// rules live behind this endpoint, not in the worker.
    pub async fn send_message(
        &self,
        tenant_id: i64,
        to_phone: &str,
        text: &str,
    ) -> Result<(), RpcError> {
        let req = SendMessage {
            tenant_id,
            to_phone: to_phone.to_string(),
            text: text.to_string(),
        };
        self.send_json::<_, serde_json::Value>(reqwest::Method::POST, "/messages/send", &req)
            .await
            .map(|_| ())
    }

    pub async fn emit_event(&self, event: &ObserverEvent) -> Result<(), RpcError> {
        self.send_json::<_, serde_json::Value>(reqwest::Method::POST, "/events", event)
            .await
            .map(|_| ())
    }

    pub async fn reset_state(&self) -> Result<ResetStats, RpcError> {
        self.send_json_no_body(reqwest::Method::POST, "/admin/reset-state")
            .await
    }

    // ── transport helpers ────────────────────────────────────────────────────

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, RpcError> {
        self.request(reqwest::Method::GET, path, None::<&()>).await
    }

    async fn send_json<B: Serialize, T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: &B,
    ) -> Result<T, RpcError> {
        self.request(method, path, Some(body)).await
    }

    async fn send_json_no_body<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
    ) -> Result<T, RpcError> {
        self.request(method, path, None::<&()>).await
    }

    async fn request<B: Serialize, T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, RpcError> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let mut req = self
                .client
                .request(method.clone(), &url)
                .header(INTERNAL_SECRET_HEADER, &self.secret);
            if let Some(b) = body {
                req = req.json(b);
            }

            let outcome = req.send().await;
            match outcome {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if resp.status().is_success() {
                        let bytes = resp.bytes().await?;
                        return serde_json::from_slice(&bytes)
                            .map_err(|e| RpcError::Decode(e.to_string()));
                    }
                    let message = resp.text().await.unwrap_or_default();
                    // 4xx is a contract problem, never retried.
                    if status < 500 || attempt >= MAX_ATTEMPTS {
                        return Err(RpcError::Api { status, message });
                    }
                    warn!(%url, status, attempt, "RPC 5xx, retrying");
                }
                Err(e) => {
                    if attempt >= MAX_ATTEMPTS {
                        return Err(RpcError::Http(e));
                    }
                    warn!(%url, attempt, error = %e, "RPC transport error, retrying");
                }
            }

            tokio::time::sleep(backoff(attempt)).await;
        }
    }
}

/// Exponential backoff with jitter so overlapping retries don't align.
fn backoff(attempt: u32) -> Duration {
    let base = BACKOFF_BASE_MS * 2u64.saturating_pow(attempt.saturating_sub(1));
    let jitter = rand::rng().random_range(0..BACKOFF_JITTER_MS);
    Duration::from_millis(base + jitter)
}
