//! Webhook ingress — the provider POSTs signed event envelopes here.
//!
//! The raw body is opaque to the gateway: signature valid → enqueue bytes
//! untouched and return 200; signature invalid → 401 and nothing happens;
//! queue down → 503 so the provider retries. Duplicate deliveries are
//! allowed through on purpose — dedupe is by provider message id at the
//! persistence step downstream.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{info, warn};

use crate::app::AppState;

type HmacSha256 = Hmac<Sha256>;

pub async fn health_handler() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

/// GET /webhook — the provider's subscription handshake: echo the challenge
/// when the verify token matches.
#[derive(Deserialize)]
pub struct VerifyParams {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

pub async fn verify_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<VerifyParams>,
) -> Result<String, StatusCode> {
    let mode_ok = params.mode.as_deref() == Some("subscribe");
    let token_ok = params.verify_token.as_deref() == Some(state.verify_token.as_str())
        && !state.verify_token.is_empty();

    if mode_ok && token_ok {
        info!("webhook subscription verified");
        return Ok(params.challenge.unwrap_or_default());
    }
    warn!("webhook verification rejected");
    Err(StatusCode::FORBIDDEN)
}

/// POST /webhook — validate the HMAC over the raw body, enqueue, 200.
pub async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    verify_signature(&headers, &body, &state.app_secret).map_err(|reason| {
        warn!(reason = %reason, "webhook signature rejected");
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "invalid signature"})),
        )
    })?;

    let raw = String::from_utf8_lossy(&body).into_owned();
    state.queue.send(&raw).await.map_err(|e| {
        warn!(error = %e, "queue send failed");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "queue unavailable"})),
        )
    })?;

    let receipt_id = uuid::Uuid::new_v4().to_string();
    info!(bytes = body.len(), receipt_id = %receipt_id, "webhook event enqueued");
    Ok(Json(json!({"ok": true, "receipt_id": receipt_id})))
}

/// Meta-style signature: `sha256=<hex>` of HMAC-SHA256 over the raw body.
fn verify_signature(headers: &HeaderMap, body: &[u8], secret: &str) -> Result<(), String> {
    if secret.is_empty() {
        return Err("no app secret configured".to_string());
    }

    let sig_header = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| "missing X-Hub-Signature-256 header".to_string())?;

    let sig_hex = sig_header
        .strip_prefix("sha256=")
        .ok_or_else(|| "malformed X-Hub-Signature-256 header".to_string())?;

    let expected =
        hex::decode(sig_hex).map_err(|_| "X-Hub-Signature-256 is not valid hex".to_string())?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| "invalid HMAC key length".to_string())?;
    mac.update(body);

    mac.verify_slice(&expected)
        .map_err(|_| "HMAC signature mismatch".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn headers_with_signature(sig: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-hub-signature-256", sig.parse().unwrap());
        headers
    }

    #[test]
    fn valid_signature_passes() {
        let body = br#"{"entry": []}"#;
        let headers = headers_with_signature(&sign("topsecret", body));
        assert!(verify_signature(&headers, body, "topsecret").is_ok());
    }

    #[test]
    fn tampered_body_fails() {
        let headers = headers_with_signature(&sign("topsecret", b"original"));
        assert!(verify_signature(&headers, b"tampered", "topsecret").is_err());
    }

    #[test]
    fn wrong_secret_fails() {
        let body = b"payload";
        let headers = headers_with_signature(&sign("other", body));
        assert!(verify_signature(&headers, body, "topsecret").is_err());
    }

    #[test]
    fn missing_header_fails() {
        assert!(verify_signature(&HeaderMap::new(), b"x", "topsecret").is_err());
    }

    #[test]
    fn malformed_prefix_fails() {
        let headers = headers_with_signature("md5=abcdef");
        assert!(verify_signature(&headers, b"x", "topsecret").is_err());
    }

    #[test]
    fn empty_secret_rejects_everything() {
        let body = b"payload";
        let headers = headers_with_signature(&sign("", body));
        assert!(verify_signature(&headers, body, "").is_err());
    }
}
