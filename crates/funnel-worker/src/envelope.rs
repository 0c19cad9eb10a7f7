//! Provider envelope parsing.
//!
//! The gateway enqueues raw webhook bodies untouched; the consumer is the
//! first place the envelope is opened. One webhook body can carry events for
//! several messages (and for delivery statuses, which yield nothing here).

use serde_json::Value;
use tracing::debug;

/// One inbound user message extracted from a webhook body.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    /// Provider-side id of the tenant's business number.
    pub phone_number_id: String,
    /// Provider-assigned message id — the dedupe key.
    pub provider_message_id: String,
    pub from_phone: String,
    pub text: String,
}

/// Extract inbound user messages from a raw provider envelope.
///
/// Unknown shapes and status-only notifications produce an empty list, not
/// an error: the consumer acks those without side effects.
pub fn parse_events(body: &str) -> Vec<InboundEvent> {
    let root: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(_) => return Vec::new(),
    };

    let mut events = Vec::new();
    let entries = root.get("entry").and_then(|e| e.as_array());
    for entry in entries.into_iter().flatten() {
        let changes = entry.get("changes").and_then(|c| c.as_array());
        for change in changes.into_iter().flatten() {
            let value = match change.get("value") {
                Some(v) => v,
                None => continue,
            };
            let phone_number_id = value
                .pointer("/metadata/phone_number_id")
                .and_then(|p| p.as_str())
                .unwrap_or("");
            if phone_number_id.is_empty() {
                continue;
            }

            let messages = value.get("messages").and_then(|m| m.as_array());
            for msg in messages.into_iter().flatten() {
                let provider_message_id = msg.get("id").and_then(|i| i.as_str()).unwrap_or("");
                let from_phone = msg.get("from").and_then(|f| f.as_str()).unwrap_or("");
                if provider_message_id.is_empty() || from_phone.is_empty() {
                    continue;
                }
                events.push(InboundEvent {
                    phone_number_id: phone_number_id.to_string(),
                    provider_message_id: provider_message_id.to_string(),
                    from_phone: from_phone.to_string(),
                    text: message_text(msg),
                });
            }
        }
    }

    debug!(events = events.len(), "envelope parsed");
    events
}

/// Text body, or a placeholder naming the unsupported message type.
fn message_text(msg: &Value) -> String {
    if let Some(text) = msg.pointer("/text/body").and_then(|t| t.as_str()) {
        return text.to_string();
    }
    let kind = msg.get("type").and_then(|t| t.as_str()).unwrap_or("unknown");
    format!("[unsupported: {kind}]")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(value: serde_json::Value) -> String {
        serde_json::json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "id": "1031",
                "changes": [{
                    "field": "messages",
                    "value": value,
                }],
            }],
        })
        .to_string()
    }

    #[test]
    fn parses_text_message() {
        let body = envelope(serde_json::json!({
            "messaging_product": "whatsapp",
            "metadata": {"display_phone_number": "4915570", "phone_number_id": "pn-1"},
            "messages": [{
                "from": "4917212345678",
                "id": "wamid.abc",
                "timestamp": "1714000000",
                "type": "text",
                "text": {"body": "What's your pricing?"},
            }],
        }));
        let events = parse_events(&body);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].phone_number_id, "pn-1");
        assert_eq!(events[0].provider_message_id, "wamid.abc");
        assert_eq!(events[0].from_phone, "4917212345678");
        assert_eq!(events[0].text, "What's your pricing?");
    }

    #[test]
    fn multiple_messages_in_one_envelope() {
        let body = envelope(serde_json::json!({
            "metadata": {"phone_number_id": "pn-1"},
            "messages": [
                {"from": "491", "id": "wamid.1", "type": "text", "text": {"body": "hi"}},
                {"from": "491", "id": "wamid.2", "type": "text", "text": {"body": "anyone there?"}},
            ],
        }));
        let events = parse_events(&body);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].text, "anyone there?");
    }

    #[test]
    fn status_only_notification_yields_nothing() {
        let body = envelope(serde_json::json!({
            "metadata": {"phone_number_id": "pn-1"},
            "statuses": [{"id": "wamid.1", "status": "delivered"}],
        }));
        assert!(parse_events(&body).is_empty());
    }

    #[test]
    fn non_text_message_gets_placeholder() {
        let body = envelope(serde_json::json!({
            "metadata": {"phone_number_id": "pn-1"},
            "messages": [{"from": "491", "id": "wamid.9", "type": "audio", "audio": {"id": "media-1"}}],
        }));
        let events = parse_events(&body);
        assert_eq!(events[0].text, "[unsupported: audio]");
    }

    #[test]
    fn malformed_body_yields_nothing() {
        assert!(parse_events("not json at all").is_empty());
        assert!(parse_events("{}").is_empty());
    }
}
