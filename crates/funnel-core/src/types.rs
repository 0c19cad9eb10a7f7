use serde::{Deserialize, Serialize};

/// A tenant is one business running its own WhatsApp number through the
/// platform. Looked up by the provider-side phone-number-id on every inbound
/// event; immutable while a message is being processed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: i64,
    pub name: String,
    /// Provider-assigned id of the WhatsApp business number.
    pub phone_number_id: String,
    /// Provider API token used by the send path.
    pub access_token: String,
    /// Short persona/identity blurb injected into the system prompt.
    pub persona: String,
    pub created_at: String,
}

/// An end-user phone, unique per (tenant, phone). Created on first contact,
/// never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: i64,
    pub tenant_id: i64,
    pub phone: String,
    pub created_at: String,
}

/// Who is driving the conversation right now.
///
/// While `Human`, the pipeline must never run: inbound messages are persisted
/// and observers notified, nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationMode {
    Bot,
    Human,
}

impl ConversationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bot => "bot",
            Self::Human => "human",
        }
    }
}

impl std::fmt::Display for ConversationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ConversationMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bot" => Ok(Self::Bot),
            "human" => Ok(Self::Human),
            other => Err(format!("unknown conversation mode: {other}")),
        }
    }
}

/// Funnel stage. Terminal stages (`closed`, `lost`, `ghosted`) end the
/// conversation lifecycle; everything else is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Greeting,
    Qualification,
    Pricing,
    Cta,
    Followup,
    Closed,
    Lost,
    Ghosted,
}

impl Stage {
    pub const ALL: &'static [Stage] = &[
        Stage::Greeting,
        Stage::Qualification,
        Stage::Pricing,
        Stage::Cta,
        Stage::Followup,
        Stage::Closed,
        Stage::Lost,
        Stage::Ghosted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Greeting => "greeting",
            Self::Qualification => "qualification",
            Self::Pricing => "pricing",
            Self::Cta => "cta",
            Self::Followup => "followup",
            Self::Closed => "closed",
            Self::Lost => "lost",
            Self::Ghosted => "ghosted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Lost | Self::Ghosted)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|v| v.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown stage: {s}"))
    }
}

/// How ready the lead looks to buy, as judged by the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentLevel {
    Unknown,
    Low,
    Medium,
    High,
}

impl IntentLevel {
    pub const ALL: &'static [IntentLevel] = &[
        IntentLevel::Unknown,
        IntentLevel::Low,
        IntentLevel::Medium,
        IntentLevel::High,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl std::fmt::Display for IntentLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for IntentLevel {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|v| v.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown intent level: {s}"))
    }
}

/// Mood of the lead's most recent messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Frustrated,
    Skeptical,
    Neutral,
    Curious,
    Excited,
}

impl Sentiment {
    pub const ALL: &'static [Sentiment] = &[
        Sentiment::Frustrated,
        Sentiment::Skeptical,
        Sentiment::Neutral,
        Sentiment::Curious,
        Sentiment::Excited,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Frustrated => "frustrated",
            Self::Skeptical => "skeptical",
            Self::Neutral => "neutral",
            Self::Curious => "curious",
            Self::Excited => "excited",
        }
    }
}

impl std::fmt::Display for Sentiment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Sentiment {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|v| v.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown sentiment: {s}"))
    }
}

/// Who authored a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageOrigin {
    Lead,
    Bot,
    Human,
}

impl MessageOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lead => "lead",
            Self::Bot => "bot",
            Self::Human => "human",
        }
    }
}

impl std::fmt::Display for MessageOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageOrigin {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lead" => Ok(Self::Lead),
            "bot" => Ok(Self::Bot),
            "human" => Ok(Self::Human),
            other => Err(format!("unknown message origin: {other}")),
        }
    }
}

/// What the pipeline decided to do with its turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotAction {
    SendNow,
    WaitSchedule,
    FlagAttention,
    InitiateCta,
}

impl BotAction {
    pub const ALL: &'static [BotAction] = &[
        BotAction::SendNow,
        BotAction::WaitSchedule,
        BotAction::FlagAttention,
        BotAction::InitiateCta,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SendNow => "send_now",
            Self::WaitSchedule => "wait_schedule",
            Self::FlagAttention => "flag_attention",
            Self::InitiateCta => "initiate_cta",
        }
    }
}

impl std::fmt::Display for BotAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BotAction {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|v| v.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown bot action: {s}"))
    }
}

/// Risk grading for the spam/policy/hallucination guardrail flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub const ALL: &'static [RiskLevel] = &[RiskLevel::Low, RiskLevel::Medium, RiskLevel::High];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RiskLevel {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(format!("unknown risk level: {other}")),
        }
    }
}

/// One conversation per (tenant, lead). Perpetual until a terminal stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: i64,
    pub tenant_id: i64,
    pub lead_id: i64,
    pub mode: ConversationMode,
    pub stage: Stage,
    pub intent_level: IntentLevel,
    pub user_sentiment: Sentiment,
    pub rolling_summary: String,
    pub last_user_message_at: Option<String>,
    pub last_bot_message_at: Option<String>,
    pub followup_count_24h: u32,
    pub total_nudges: u32,
    pub needs_human_attention: bool,
    pub active_cta_id: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

/// Stored message row. Append-only; never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub conversation_id: i64,
    pub origin: MessageOrigin,
    pub content: String,
    /// Provider-assigned id for inbound messages — the dedupe key under
    /// queue redelivery. `None` for bot/human-originated rows.
    pub provider_message_id: Option<String>,
    pub created_at: String,
}

/// A call-to-action the bot may initiate (booking link, payment link, …).
/// Managed outside the core; read-only here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cta {
    pub id: i64,
    pub tenant_id: i64,
    pub name: String,
    pub description: String,
    pub link: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_roundtrip() {
        for s in Stage::ALL {
            assert_eq!(s.as_str().parse::<Stage>().unwrap(), *s);
        }
    }

    #[test]
    fn terminal_stages() {
        assert!(Stage::Closed.is_terminal());
        assert!(Stage::Lost.is_terminal());
        assert!(Stage::Ghosted.is_terminal());
        assert!(!Stage::Followup.is_terminal());
    }

    #[test]
    fn action_serde_snake_case() {
        let v = serde_json::to_string(&BotAction::FlagAttention).unwrap();
        assert_eq!(v, "\"flag_attention\"");
    }

    #[test]
    fn unknown_enum_string_is_rejected() {
        assert!("qualifying".parse::<Stage>().is_err());
        assert!("handoff".parse::<BotAction>().is_err());
    }
}
