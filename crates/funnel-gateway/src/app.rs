use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use funnel_core::config::FunnelConfig;
use funnel_worker::queue::{EventQueue, HttpQueue};

/// Gateway state: webhook secrets and a queue handle. Deliberately no
/// database and no RPC client — the gateway validates and enqueues, nothing
/// else.
pub struct AppState {
    pub app_secret: String,
    pub verify_token: String,
    pub queue: Arc<dyn EventQueue>,
}

impl AppState {
    pub fn new(config: &FunnelConfig) -> Self {
        Self {
            app_secret: config.gateway.app_secret.clone().unwrap_or_default(),
            verify_token: config.gateway.verify_token.clone().unwrap_or_default(),
            queue: Arc::new(HttpQueue::new(
                config.queue.url.clone().unwrap_or_default(),
                config.queue.visibility_timeout_seconds,
            )),
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::webhook::health_handler))
        .route(
            "/webhook",
            get(crate::webhook::verify_handler).post(crate::webhook::webhook_handler),
        )
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
