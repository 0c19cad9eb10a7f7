//! Wire-level tests for the internal RPC surface: secret gate, conversation
//! lifecycle, message idempotency, follow-up query.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use funnel_core::config::FunnelConfig;
use funnel_rpc::server::{build_router, store::ConversationStore, AppState};

const SECRET: &str = "test-secret";

fn test_router() -> axum::Router {
    let mut config = FunnelConfig::default();
    config.rpc.internal_secret = Some(SECRET.to_string());
    let store = ConversationStore::open_in_memory().unwrap();
    store
        .create_tenant("Acme Dental", "pn-1", "tok", "Friendly clinic assistant")
        .unwrap();
    build_router(Arc::new(AppState::new(&config, store)))
}

async fn send(router: &axum::Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

fn get(path: &str) -> Request<Body> {
    Request::get(path)
        .header("x-internal-secret", SECRET)
        .body(Body::empty())
        .unwrap()
}

fn post_json(path: &str, body: Value) -> Request<Body> {
    Request::post(path)
        .header("x-internal-secret", SECRET)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_is_open_without_secret() {
    let router = test_router();
    let (status, body) = send(
        &router,
        Request::get("/health").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn internal_routes_reject_missing_or_wrong_secret() {
    let router = test_router();

    let (status, _) = send(
        &router,
        Request::get("/conversations/by-phone?tenant_id=1&phone=4915000")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        &router,
        Request::get("/conversations/1")
            .header("x-internal-secret", "wrong")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unknown_tenant_is_404() {
    let router = test_router();
    let (status, body) = send(&router, get("/tenants/by-phone-number-id/pn-nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn conversation_lifecycle_round_trip() {
    let router = test_router();

    // First contact creates lead + conversation.
    let (status, conv) = send(
        &router,
        get("/conversations/by-phone?tenant_id=1&phone=4917212345678"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(conv["stage"], "greeting");
    assert_eq!(conv["mode"], "bot");
    let id = conv["id"].as_i64().unwrap();

    // Inbound message, then a redelivery of the same provider id.
    let incoming = json!({
        "conversation_id": id,
        "provider_message_id": "wamid.a1",
        "content": "What's your pricing?",
    });
    let (status, outcome) = send(&router, post_json("/messages/incoming", incoming.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["duplicate"], false);

    let (_, outcome) = send(&router, post_json("/messages/incoming", incoming)).await;
    assert_eq!(outcome["duplicate"], true);

    // Patch stage + attention flag.
    let patch = json!({"stage": "pricing", "needs_human_attention": true});
    let (status, patched) = send(
        &router,
        Request::patch(format!("/conversations/{id}"))
            .header("x-internal-secret", SECRET)
            .header("content-type", "application/json")
            .body(Body::from(patch.to_string()))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(patched["stage"], "pricing");
    assert_eq!(patched["needs_human_attention"], true);

    // Context carries tenant identity, lead phone and the message.
    let (status, ctx) = send(&router, get(&format!("/conversations/{id}/context?messages=5"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ctx["tenant_name"], "Acme Dental");
    assert_eq!(ctx["lead_phone"], "4917212345678");
    assert_eq!(ctx["messages"].as_array().unwrap().len(), 1);
    assert_eq!(ctx["messages"][0]["origin"], "lead");
}

#[tokio::test]
async fn outgoing_message_and_nudge_counters() {
    let router = test_router();
    let (_, conv) = send(
        &router,
        get("/conversations/by-phone?tenant_id=1&phone=4917299999"),
    )
    .await;
    let id = conv["id"].as_i64().unwrap();

    let (status, msg) = send(
        &router,
        post_json(
            "/messages/outgoing",
            json!({"conversation_id": id, "origin": "bot", "content": "Our plan is 49 EUR."}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(msg["origin"], "bot");

    let (_, conv) = send(&router, get(&format!("/conversations/{id}"))).await;
    assert!(conv["last_bot_message_at"].is_string());

    let (status, _) = send(
        &router,
        post_json(&format!("/conversations/{id}/nudge"), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, conv) = send(&router, get(&format!("/conversations/{id}"))).await;
    assert_eq!(conv["followup_count_24h"], 1);
    assert_eq!(conv["total_nudges"], 1);
}

#[tokio::test]
async fn due_followups_is_empty_for_fresh_conversations() {
    let router = test_router();
    send(
        &router,
        get("/conversations/by-phone?tenant_id=1&phone=4917288888"),
    )
    .await;
    let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    let (status, due) = send(
        &router,
        get(&format!("/conversations/due-followups?now={now}")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(due.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn observer_event_ingest_accepts_payload() {
    let router = test_router();
    let (status, body) = send(
        &router,
        post_json(
            "/events",
            json!({
                "type": "ACTION_HUMAN_ATTENTION_REQUIRED",
                "conversation_id": 1,
                "tenant_id": 1,
                "stage": "pricing",
                "intent_level": "high",
                "sentiment": "curious",
                "needs_human_attention": true,
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
}

#[tokio::test]
async fn reset_state_truncates_and_reports() {
    let router = test_router();
    let (_, conv) = send(
        &router,
        get("/conversations/by-phone?tenant_id=1&phone=4917277777"),
    )
    .await;
    let id = conv["id"].as_i64().unwrap();
    send(
        &router,
        post_json(
            "/messages/incoming",
            json!({"conversation_id": id, "provider_message_id": "wamid.r1", "content": "hi"}),
        ),
    )
    .await;

    let (status, stats) = send(&router, post_json("/admin/reset-state", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["conversations_deleted"], 1);
    assert_eq!(stats["messages_deleted"], 1);

    let (status, _) = send(&router, get(&format!("/conversations/{id}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
