//! Wire DTOs shared by the RPC client and the state-store server.

use serde::{Deserialize, Serialize};

use funnel_core::types::{
    Conversation, ConversationMode, Cta, IntentLevel, Message, MessageOrigin, Sentiment, Stage,
};

/// Partial conversation update. Absent fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent_level: Option<IntentLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_sentiment: Option<Sentiment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<ConversationMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rolling_summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub needs_human_attention: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_cta_id: Option<i64>,
}

/// Inbound message persistence request. Idempotent on
/// `provider_message_id`: a redelivered event writes nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub conversation_id: i64,
    pub provider_message_id: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingOutcome {
    /// `None` when the provider message id was already recorded.
    pub message_id: Option<i64>,
    pub duplicate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub conversation_id: i64,
    pub origin: MessageOrigin,
    pub content: String,
}

/// Everything the pipeline input needs, in one round trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationContext {
    pub conversation: Conversation,
    pub tenant_name: String,
    pub tenant_persona: String,
    /// The lead's phone, needed by the outbound send path.
    pub lead_phone: String,
    /// Last K messages, oldest first.
    pub messages: Vec<Message>,
    pub ctas: Vec<Cta>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessage {
    pub tenant_id: i64,
    pub to_phone: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetStats {
    pub conversations_deleted: usize,
    pub messages_deleted: usize,
    pub leads_deleted: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
}
