//! Pipeline input/output records.
//!
//! `GenerateOutput` is the strict-schema decision+message artifact. It is
//! only ever constructed through [`GenerateOutput::from_llm_json`] (defaults
//! filled, enums normalized) or [`GenerateOutput::emergency`], so downstream
//! code never branches on raw model strings.

use serde::{Deserialize, Serialize};

use funnel_core::types::{
    BotAction, Cta, IntentLevel, Message, RiskLevel, Sentiment, Stage,
};

use crate::normalize;

/// Guardrail flags graded by the model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RiskFlags {
    pub spam: RiskLevel,
    pub policy: RiskLevel,
    pub hallucination: RiskLevel,
}

impl RiskFlags {
    pub fn low() -> Self {
        Self {
            spam: RiskLevel::Low,
            policy: RiskLevel::Low,
            hallucination: RiskLevel::Low,
        }
    }

    pub fn any_high(&self) -> bool {
        self.spam == RiskLevel::High
            || self.policy == RiskLevel::High
            || self.hallucination == RiskLevel::High
    }
}

/// Everything one pipeline invocation sees. Built per invocation from the
/// conversation context; never persisted.
#[derive(Debug, Clone)]
pub struct PipelineInput {
    pub conversation_id: i64,
    pub tenant_id: i64,
    pub business_name: String,
    pub persona: String,
    pub rolling_summary: String,
    /// Last K messages, oldest first.
    pub recent_messages: Vec<Message>,
    pub stage: Stage,
    pub intent_level: IntentLevel,
    pub user_sentiment: Sentiment,
    pub now: chrono::DateTime<chrono::Utc>,
    /// Whether the provider's 24 h session window is still open (the last
    /// user message is less than 24 h old).
    pub session_window_open: bool,
    pub followup_count_24h: u32,
    pub total_nudges: u32,
    pub available_ctas: Vec<Cta>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateOutput {
    pub thought_process: String,
    pub intent_level: IntentLevel,
    pub user_sentiment: Sentiment,
    pub risk_flags: RiskFlags,
    pub action: BotAction,
    pub new_stage: Stage,
    pub should_respond: bool,
    pub selected_cta_id: Option<i64>,
    pub cta_scheduled_at: Option<String>,
    pub followup_in_minutes: Option<u32>,
    pub message_text: String,
    pub message_language: String,
    pub confidence: f64,
    pub needs_human_attention: bool,
}

impl GenerateOutput {
    /// Pre-fabricated result for when the pipeline cannot produce a safe
    /// answer: never respond, flag a human, leave the stage alone.
    pub fn emergency(stage: Stage) -> Self {
        Self {
            thought_process: String::new(),
            intent_level: IntentLevel::Unknown,
            user_sentiment: Sentiment::Neutral,
            risk_flags: RiskFlags::low(),
            action: BotAction::WaitSchedule,
            new_stage: stage,
            should_respond: false,
            selected_cta_id: None,
            cta_scheduled_at: None,
            followup_in_minutes: None,
            message_text: String::new(),
            message_language: "en".to_string(),
            confidence: 0.0,
            needs_human_attention: true,
        }
    }

    /// Build from a parsed (but untrusted) model payload. Missing fields get
    /// documented defaults; every enum goes through the normalizer; a high
    /// risk grade on a send is downgraded to `flag_attention` here, so no
    /// caller ever sees a sendable high-risk output.
    pub fn from_llm_json(v: &serde_json::Value, input_stage: Stage) -> Self {
        let str_field = |key: &str| v.get(key).and_then(|x| x.as_str()).unwrap_or("");

        let intent_level = normalize::normalize_intent(str_field("intent_level"), IntentLevel::Unknown);
        let user_sentiment =
            normalize::normalize_sentiment(str_field("user_sentiment"), Sentiment::Neutral);
        let action = normalize::normalize_action(str_field("action"), BotAction::WaitSchedule);
        let new_stage = normalize::normalize_stage(str_field("new_stage"), input_stage);

        let risks = v.get("risk_flags").cloned().unwrap_or_default();
        let risk_field = |key: &str| {
            risks
                .get(key)
                .and_then(|x| x.as_str())
                .map(|s| normalize::normalize_risk(s, RiskLevel::Low))
                .unwrap_or(RiskLevel::Low)
        };
        let risk_flags = RiskFlags {
            spam: risk_field("spam"),
            policy: risk_field("policy"),
            hallucination: risk_field("hallucination"),
        };

        let message_text = str_field("message_text").to_string();
        // Absent should_respond follows the action: send_now implies a reply.
        let should_respond = v
            .get("should_respond")
            .and_then(|x| x.as_bool())
            .unwrap_or(action == BotAction::SendNow);

        let needs_human_attention = v
            .get("needs_human_attention")
            .and_then(|x| x.as_bool())
            .unwrap_or(false);

        // Guardrail: a message graded high on spam, policy or hallucination
        // risk never goes out. The turn is parked for a human instead. The
        // reverse is untouched — a "don't send" is never turned into a send.
        let (action, should_respond, needs_human_attention) =
            if risk_flags.any_high() && action == BotAction::SendNow {
                tracing::warn!(
                    spam = %risk_flags.spam,
                    policy = %risk_flags.policy,
                    hallucination = %risk_flags.hallucination,
                    "high risk grade on send_now, parking turn for human"
                );
                (BotAction::FlagAttention, false, true)
            } else {
                (action, should_respond, needs_human_attention)
            };

        let confidence = v
            .get("confidence")
            .and_then(|x| x.as_f64())
            .unwrap_or(0.5)
            .clamp(0.0, 1.0);

        let message_language = {
            let lang = str_field("message_language");
            if lang.is_empty() {
                "en".to_string()
            } else {
                lang.to_string()
            }
        };

        let selected_cta_id = v.get("selected_cta_id").and_then(|x| {
            x.as_i64()
                .or_else(|| x.as_str().and_then(|s| s.parse().ok()))
        });

        Self {
            thought_process: str_field("thought_process").to_string(),
            intent_level,
            user_sentiment,
            risk_flags,
            action,
            new_stage,
            should_respond,
            selected_cta_id,
            cta_scheduled_at: v
                .get("cta_scheduled_at")
                .and_then(|x| x.as_str())
                .map(String::from),
            followup_in_minutes: v
                .get("followup_in_minutes")
                .and_then(|x| x.as_u64())
                .map(|n| n as u32),
            message_text,
            message_language,
            confidence,
            needs_human_attention,
        }
    }
}

/// What one pipeline run hands back to the action applier.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub generate: GenerateOutput,
    pub latency_ms: u64,
    pub tokens_in: u32,
    pub tokens_out: u32,
    /// False when the emergency path fired; there is nothing worth
    /// summarizing from a turn that produced no decision.
    pub needs_background_summary: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_get_documented_defaults() {
        let out = GenerateOutput::from_llm_json(&serde_json::json!({}), Stage::Pricing);
        assert_eq!(out.intent_level, IntentLevel::Unknown);
        assert_eq!(out.user_sentiment, Sentiment::Neutral);
        assert_eq!(out.action, BotAction::WaitSchedule);
        assert_eq!(out.new_stage, Stage::Pricing);
        assert_eq!(out.risk_flags.spam, RiskLevel::Low);
        assert!((out.confidence - 0.5).abs() < 1e-9);
        assert_eq!(out.message_language, "en");
        assert!(!out.should_respond);
        assert!(!out.needs_human_attention);
    }

    #[test]
    fn enum_drift_is_normalized() {
        let v = serde_json::json!({
            "action": "handoff",
            "new_stage": "qualifying",
            "user_sentiment": "positive",
        });
        let out = GenerateOutput::from_llm_json(&v, Stage::Greeting);
        assert_eq!(out.action, BotAction::FlagAttention);
        assert_eq!(out.new_stage, Stage::Qualification);
        assert_eq!(out.user_sentiment, Sentiment::Curious);
    }

    #[test]
    fn should_respond_follows_action_when_absent() {
        let v = serde_json::json!({
            "action": "send_now",
            "message_text": "Happy to help!",
        });
        let out = GenerateOutput::from_llm_json(&v, Stage::Greeting);
        assert!(out.should_respond);

        let v = serde_json::json!({"action": "wait_schedule"});
        assert!(!GenerateOutput::from_llm_json(&v, Stage::Greeting).should_respond);
    }

    #[test]
    fn explicit_should_respond_wins_over_action() {
        let v = serde_json::json!({
            "action": "send_now",
            "should_respond": false,
            "message_text": "draft",
        });
        assert!(!GenerateOutput::from_llm_json(&v, Stage::Greeting).should_respond);
    }

    #[test]
    fn confidence_is_clamped() {
        let v = serde_json::json!({"confidence": 7.5});
        assert!((GenerateOutput::from_llm_json(&v, Stage::Greeting).confidence - 1.0).abs() < 1e-9);
        let v = serde_json::json!({"confidence": -1.0});
        assert_eq!(GenerateOutput::from_llm_json(&v, Stage::Greeting).confidence, 0.0);
    }

    #[test]
    fn cta_id_accepts_number_or_string() {
        let v = serde_json::json!({"selected_cta_id": 3});
        assert_eq!(GenerateOutput::from_llm_json(&v, Stage::Cta).selected_cta_id, Some(3));
        let v = serde_json::json!({"selected_cta_id": "5"});
        assert_eq!(GenerateOutput::from_llm_json(&v, Stage::Cta).selected_cta_id, Some(5));
    }

    #[test]
    fn high_risk_send_is_parked_for_human() {
        let v = serde_json::json!({
            "action": "send_now",
            "should_respond": true,
            "message_text": "Guaranteed results, wire the money today!",
            "risk_flags": {"spam": "high", "policy": "low", "hallucination": "low"},
        });
        let out = GenerateOutput::from_llm_json(&v, Stage::Pricing);
        assert_eq!(out.action, BotAction::FlagAttention);
        assert!(!out.should_respond);
        assert!(out.needs_human_attention);
    }

    #[test]
    fn medium_risk_send_passes_through() {
        let v = serde_json::json!({
            "action": "send_now",
            "message_text": "Our plan is 49 EUR monthly.",
            "risk_flags": {"spam": "moderate", "policy": "low", "hallucination": "low"},
        });
        let out = GenerateOutput::from_llm_json(&v, Stage::Pricing);
        assert_eq!(out.action, BotAction::SendNow);
        assert!(out.should_respond);
        assert!(!out.needs_human_attention);
    }

    #[test]
    fn high_risk_without_send_is_left_alone() {
        let v = serde_json::json!({
            "action": "wait_schedule",
            "risk_flags": {"hallucination": "high"},
        });
        let out = GenerateOutput::from_llm_json(&v, Stage::Pricing);
        assert_eq!(out.action, BotAction::WaitSchedule);
        assert!(!out.needs_human_attention);
    }

    #[test]
    fn emergency_result_shape() {
        let out = GenerateOutput::emergency(Stage::Qualification);
        assert!(!out.should_respond);
        assert!(out.needs_human_attention);
        assert_eq!(out.new_stage, Stage::Qualification);
        assert_eq!(out.action, BotAction::WaitSchedule);
        assert_eq!(out.confidence, 0.0);
    }

    #[test]
    fn risk_flags_any_high() {
        let mut flags = RiskFlags::low();
        assert!(!flags.any_high());
        flags.policy = RiskLevel::High;
        assert!(flags.any_high());
    }
}
