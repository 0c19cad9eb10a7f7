//! Axum handlers for the internal RPC surface. Thin: parse, delegate to the
//! store, map errors to status codes.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use funnel_core::events::ObserverEvent;
use funnel_core::types::{Conversation, Tenant};

use crate::types::{
    ConversationContext, ConversationPatch, ErrorBody, IncomingMessage, IncomingOutcome,
    OutgoingMessage, ResetStats, SendMessage,
};

use super::store::StoreError;
use super::AppState;

type Rejection = (StatusCode, Json<ErrorBody>);
type Handler<T> = Result<Json<T>, Rejection>;

pub async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

pub async fn tenant_by_phone_number_id(
    State(state): State<Arc<AppState>>,
    Path(pnid): Path<String>,
) -> Handler<Tenant> {
    state
        .store
        .tenant_by_phone_number_id(&pnid)
        .map(Json)
        .map_err(reject)
}

#[derive(Deserialize)]
pub struct ByPhoneQuery {
    pub tenant_id: i64,
    pub phone: String,
}

pub async fn conversation_by_phone(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ByPhoneQuery>,
) -> Handler<Conversation> {
    // Creating on miss keeps this endpoint idempotent for the consumer.
    state
        .store
        .conversation_by_phone(q.tenant_id, &q.phone)
        .map(Json)
        .map_err(reject)
}

pub async fn get_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Handler<Conversation> {
    state.store.get_conversation(id).map(Json).map_err(reject)
}

pub async fn patch_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<ConversationPatch>,
) -> Handler<Conversation> {
    state
        .store
        .patch_conversation(id, &body)
        .map(Json)
        .map_err(reject)
}

#[derive(Deserialize)]
pub struct ContextQuery {
    #[serde(default = "default_context_messages")]
    pub messages: u32,
}

fn default_context_messages() -> u32 {
    10
}

pub async fn conversation_context(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(q): Query<ContextQuery>,
) -> Handler<ConversationContext> {
    state
        .store
        .context(id, q.messages)
        .map(Json)
        .map_err(reject)
}

#[derive(Deserialize)]
pub struct DueQuery {
    pub now: chrono::DateTime<chrono::Utc>,
}

pub async fn due_followups(
    State(state): State<Arc<AppState>>,
    Query(q): Query<DueQuery>,
) -> Handler<Vec<Conversation>> {
    state
        .store
        .due_followups(q.now, &state.followup_buckets)
        .map(Json)
        .map_err(reject)
}

pub async fn increment_nudge(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Handler<Value> {
    state
        .store
        .increment_nudge(id)
        .map(|_| Json(json!({"ok": true})))
        .map_err(reject)
}

pub async fn record_incoming(
    State(state): State<Arc<AppState>>,
    Json(body): Json<IncomingMessage>,
) -> Handler<IncomingOutcome> {
    state.store.insert_incoming(&body).map(Json).map_err(reject)
}

pub async fn record_outgoing(
    State(state): State<Arc<AppState>>,
    Json(body): Json<OutgoingMessage>,
) -> Handler<funnel_core::types::Message> {
    state.store.insert_outgoing(&body).map(Json).map_err(reject)
}

pub async fn send_message(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SendMessage>,
) -> Handler<Value> {
    let tenant = state.store.tenant_by_id(body.tenant_id).map_err(reject)?;
    state
        .provider
        .send_text(&tenant, &body.to_phone, &body.text)
        .await
        .map_err(|e| {
            warn!(tenant_id = body.tenant_id, error = %e, "provider dispatch failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(ErrorBody {
                    error: e.to_string(),
                    code: "PROVIDER_ERROR".to_string(),
                }),
            )
        })?;
    Ok(Json(json!({"ok": true})))
}

pub async fn ingest_event(
    State(state): State<Arc<AppState>>,
    Json(event): Json<ObserverEvent>,
) -> Handler<Value> {
    info!(
        event = ?event.kind,
        conversation_id = event.conversation_id,
        tenant_id = event.tenant_id,
        stage = %event.stage,
        "observer event"
    );
    // Zero dashboard subscribers is normal; the send is best-effort.
    let _ = state.events_tx.send(event);
    Ok(Json(json!({"ok": true})))
}

pub async fn reset_state(State(state): State<Arc<AppState>>) -> Handler<ResetStats> {
    state.store.reset_state().map(Json).map_err(reject)
}

fn reject(err: StoreError) -> Rejection {
    let status = match &err {
        StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
        StoreError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let code = match &err {
        StoreError::NotFound { .. } => "NOT_FOUND",
        StoreError::Database(_) => "DATABASE_ERROR",
    };
    (
        status,
        Json(ErrorBody {
            error: err.to_string(),
            code: code.to_string(),
        }),
    )
}
