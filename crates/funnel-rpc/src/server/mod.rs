//! State-store server: the only process with a database handle.
//!
//! Serves the internal RPC surface the worker, scheduler and CLI depend on,
//! owns the provider send path, and fans observer events out on a broadcast
//! channel for the dashboard side.

pub mod provider;
pub mod routes;
pub mod store;

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
    routing::{get, post},
    Router,
};
use tokio::sync::broadcast;
use tracing::warn;

use funnel_core::config::{FollowupBucket, FunnelConfig};
use funnel_core::events::ObserverEvent;

use crate::client::INTERNAL_SECRET_HEADER;
use provider::ProviderClient;
use store::ConversationStore;

const EVENT_CHANNEL_CAPACITY: usize = 256;

pub struct AppState {
    pub store: ConversationStore,
    pub provider: ProviderClient,
    pub secret: String,
    pub followup_buckets: Vec<FollowupBucket>,
    /// Observer events for dashboard subscribers. Sends succeed even with
    /// zero receivers.
    pub events_tx: broadcast::Sender<ObserverEvent>,
}

impl AppState {
    pub fn new(config: &FunnelConfig, store: ConversationStore) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            provider: ProviderClient::new(config.rpc.provider_base_url.clone()),
            secret: config.rpc.internal_secret.clone().unwrap_or_default(),
            followup_buckets: config.scheduler.followup_buckets.clone(),
            events_tx,
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/tenants/by-phone-number-id/{pnid}",
            get(routes::tenant_by_phone_number_id),
        )
        .route("/conversations/by-phone", get(routes::conversation_by_phone))
        .route(
            "/conversations/due-followups",
            get(routes::due_followups),
        )
        .route(
            "/conversations/{id}",
            get(routes::get_conversation).patch(routes::patch_conversation),
        )
        .route("/conversations/{id}/context", get(routes::conversation_context))
        .route("/conversations/{id}/nudge", post(routes::increment_nudge))
        .route("/messages/incoming", post(routes::record_incoming))
        .route("/messages/outgoing", post(routes::record_outgoing))
        .route("/messages/send", post(routes::send_message))
        .route("/events", post(routes::ingest_event))
        .route("/admin/reset-state", post(routes::reset_state))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            require_secret,
        ))
        .route("/health", get(routes::health))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Shared-secret gate for every internal route. Comparison is constant-time.
async fn require_secret(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let presented = req
        .headers()
        .get(INTERNAL_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if ring::constant_time::verify_slices_are_equal(
        presented.as_bytes(),
        state.secret.as_bytes(),
    )
    .is_err()
    {
        warn!(path = %req.uri().path(), "internal RPC rejected: bad secret");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}
