//! Prompt assembly for the generate and memory stages.

use funnel_core::types::{Message, MessageOrigin, Stage};
use funnel_retrieval::RetrievedChunk;

use crate::types::PipelineInput;

/// Stage map given to the model so transitions stay inside the closed set.
const STAGE_GUIDE: &str = "\
- greeting: first contact, learn why they reached out
- qualification: understand needs, budget and fit
- pricing: they asked about cost, present plans
- cta: push exactly one concrete next step (booking, payment link)
- followup: they went quiet, we are nudging
- closed: they bought or booked
- lost: they explicitly declined
- ghosted: repeated nudges with no reply";

pub fn build_system_prompt(input: &PipelineInput) -> String {
    let mut out = String::with_capacity(2048);
    out.push_str(&format!(
        "You are the WhatsApp assistant for {name}. {persona}\n\n",
        name = input.business_name,
        persona = input.persona,
    ));
    out.push_str(
        "You reply to leads in short, natural chat messages and you decide how \
         the conversation moves through the sales funnel.\n\nFunnel stages:\n",
    );
    out.push_str(STAGE_GUIDE);
    out.push_str(
        "\n\nRespond with a single JSON object and nothing else:\n\
        {\n\
          \"thought_process\": string,\n\
          \"intent_level\": \"unknown\" | \"low\" | \"medium\" | \"high\",\n\
          \"user_sentiment\": \"frustrated\" | \"skeptical\" | \"neutral\" | \"curious\" | \"excited\",\n\
          \"risk_flags\": {\"spam\": level, \"policy\": level, \"hallucination\": level} where level is \"low\" | \"medium\" | \"high\",\n\
          \"action\": \"send_now\" | \"wait_schedule\" | \"flag_attention\" | \"initiate_cta\",\n\
          \"new_stage\": one of the stages above,\n\
          \"should_respond\": boolean,\n\
          \"selected_cta_id\": number or null,\n\
          \"cta_scheduled_at\": RFC3339 timestamp or null,\n\
          \"followup_in_minutes\": number or null,\n\
          \"message_text\": string (empty when not responding),\n\
          \"message_language\": ISO 639-1 code,\n\
          \"confidence\": number between 0 and 1,\n\
          \"needs_human_attention\": boolean\n\
        }\n\n\
        Ground every factual claim in the knowledge section. If the knowledge \
        does not cover a question, say so and set needs_human_attention when it \
        matters. Never invent prices or availability.",
    );
    out
}

pub fn build_user_prompt(input: &PipelineInput, user_text: &str, knowledge_block: &str) -> String {
    let mut out = String::with_capacity(4096);

    out.push_str("## Conversation state\n");
    out.push_str(&format!(
        "stage: {}\nintent_level: {}\nuser_sentiment: {}\n",
        input.stage, input.intent_level, input.user_sentiment
    ));
    out.push_str(&format!(
        "now: {}\nsession_window_open: {}\nfollowups_sent_24h: {}\ntotal_nudges: {}\n",
        input.now.to_rfc3339(),
        input.session_window_open,
        input.followup_count_24h,
        input.total_nudges
    ));

    if !input.rolling_summary.is_empty() {
        out.push_str("\n## Conversation summary so far\n");
        out.push_str(&input.rolling_summary);
        out.push('\n');
    }

    if !input.available_ctas.is_empty() {
        out.push_str("\n## Available CTAs\n");
        for cta in &input.available_ctas {
            out.push_str(&format!(
                "- id {}: {} — {}\n",
                cta.id, cta.name, cta.description
            ));
        }
    }

    out.push_str("\n## Knowledge\n");
    out.push_str(knowledge_block);
    out.push('\n');

    if !input.recent_messages.is_empty() {
        out.push_str("\n## Recent messages\n");
        for msg in &input.recent_messages {
            out.push_str(&format!("[{}] {}\n", origin_label(msg.origin), msg.content));
        }
    }

    out.push_str("\n## New user message\n");
    out.push_str(user_text);
    out
}

/// Render retrieval output for the prompt; the fallback strings are part of
/// the pipeline contract.
pub fn format_knowledge_block(chunks: &[RetrievedChunk]) -> String {
    if chunks.is_empty() {
        return "No relevant knowledge found.".to_string();
    }
    let mut out = String::new();
    for chunk in chunks {
        out.push_str(&format!(
            "### {} [{}]\n{}\n",
            chunk.title,
            chunk.reason.as_str(),
            chunk.content
        ));
    }
    out
}

pub const KNOWLEDGE_ERROR_BLOCK: &str = "Error retrieving knowledge.";

/// Memory-stage prompt: compress the turn into an updated rolling summary.
pub fn build_memory_prompt(
    prior_summary: &str,
    user_text: &str,
    bot_text: &str,
    action: &str,
    stage: Stage,
) -> String {
    format!(
        "Update the rolling summary of a WhatsApp sales conversation.\n\n\
         Prior summary:\n{prior}\n\n\
         Latest user message:\n{user}\n\n\
         Bot reply (empty if none was sent):\n{bot}\n\n\
         Action taken: {action} (stage is now {stage})\n\n\
         Respond with a single JSON object:\n\
         {{\"summary\": string (under 1500 characters, plain prose),\n\
           \"needs_recursive_summary\": boolean (true when the summary is \
         getting too dense and should be re-compressed from full history)}}",
        prior = if prior_summary.is_empty() {
            "(none)"
        } else {
            prior_summary
        },
        user = user_text,
        bot = bot_text,
        action = action,
        stage = stage,
    )
}

/// Recursive pass: rebuild the summary from scratch off the full transcript.
/// Used when the incremental summary has grown too dense to keep updating.
pub fn build_recompress_prompt(messages: &[Message], stage: Stage) -> String {
    let mut transcript = String::new();
    for msg in messages {
        transcript.push_str(&format!("[{}] {}\n", origin_label(msg.origin), msg.content));
    }
    format!(
        "Rewrite the rolling summary of a WhatsApp sales conversation from \
         scratch using the full transcript below. Keep only what matters for \
         future turns: who the lead is, what they want, objections raised, \
         promises made, and where the funnel stands (currently {stage}).\n\n\
         Transcript:\n{transcript}\n\
         Respond with a single JSON object:\n\
         {{\"summary\": string (under 1500 characters, plain prose)}}"
    )
}

fn origin_label(origin: MessageOrigin) -> &'static str {
    match origin {
        MessageOrigin::Lead => "lead",
        MessageOrigin::Bot => "bot",
        MessageOrigin::Human => "agent",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use funnel_core::types::{IntentLevel, Sentiment};

    fn sample_input() -> PipelineInput {
        PipelineInput {
            conversation_id: 1,
            tenant_id: 1,
            business_name: "Acme Dental".to_string(),
            persona: "Warm, concise, never pushy.".to_string(),
            rolling_summary: "Lead asked about whitening.".to_string(),
            recent_messages: Vec::new(),
            stage: Stage::Qualification,
            intent_level: IntentLevel::Medium,
            user_sentiment: Sentiment::Curious,
            now: chrono::Utc::now(),
            session_window_open: true,
            followup_count_24h: 0,
            total_nudges: 0,
            available_ctas: Vec::new(),
        }
    }

    #[test]
    fn system_prompt_names_business_and_contract() {
        let p = build_system_prompt(&sample_input());
        assert!(p.contains("Acme Dental"));
        assert!(p.contains("\"action\""));
        assert!(p.contains("wait_schedule"));
    }

    #[test]
    fn user_prompt_carries_state_and_message() {
        let p = build_user_prompt(&sample_input(), "how much is whitening?", "No relevant knowledge found.");
        assert!(p.contains("stage: qualification"));
        assert!(p.contains("Lead asked about whitening."));
        assert!(p.contains("how much is whitening?"));
    }

    #[test]
    fn empty_retrieval_yields_fallback_text() {
        assert_eq!(format_knowledge_block(&[]), "No relevant knowledge found.");
    }

    #[test]
    fn recompress_prompt_carries_transcript_and_stage() {
        let messages = vec![Message {
            id: 1,
            conversation_id: 1,
            origin: MessageOrigin::Lead,
            content: "how much is whitening?".to_string(),
            provider_message_id: None,
            created_at: String::new(),
        }];
        let p = build_recompress_prompt(&messages, Stage::Pricing);
        assert!(p.contains("[lead] how much is whitening?"));
        assert!(p.contains("pricing"));
    }
}
