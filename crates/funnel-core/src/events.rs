//! Observer events the worker emits towards the dashboard via the internal
//! RPC layer. The core only names the event types and their payload; fan-out
//! to WebSocket clients happens on the state-store side.

use serde::{Deserialize, Serialize};

use crate::types::{IntentLevel, Sentiment, Stage};

/// Wire names match the dashboard contract exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "CONVERSATION_UPDATED")]
    ConversationUpdated,
    #[serde(rename = "ACTION_HUMAN_ATTENTION_REQUIRED")]
    ActionHumanAttentionRequired,
    #[serde(rename = "ACTION_CONVERSATIONS_FLAGGED")]
    ActionConversationsFlagged,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserverEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub conversation_id: i64,
    pub tenant_id: i64,
    pub stage: Stage,
    pub intent_level: IntentLevel,
    pub sentiment: Sentiment,
    pub needs_human_attention: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_wire_names() {
        let e = ObserverEvent {
            kind: EventKind::ActionHumanAttentionRequired,
            conversation_id: 7,
            tenant_id: 1,
            stage: Stage::Pricing,
            intent_level: IntentLevel::High,
            sentiment: Sentiment::Curious,
            needs_human_attention: true,
        };
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["type"], "ACTION_HUMAN_ATTENTION_REQUIRED");
        assert_eq!(v["conversation_id"], 7);
    }
}
