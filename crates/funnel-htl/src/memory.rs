//! Background memory stage: compile the turn into an updated rolling
//! summary. Runs after the user-visible action has been applied; failures
//! keep the prior summary and nothing else.

use std::sync::Arc;

use tracing::{debug, warn};

use funnel_core::config::ROLLING_SUMMARY_MAX_CHARS;
use funnel_core::types::{Message, Stage};
use funnel_llm::{extract_json, ChatClient, ChatMessage, ChatRequest, JsonMode};

use crate::prompt;

const MEMORY_MAX_TOKENS: u32 = 512;

pub struct MemoryRequest {
    pub prior_summary: String,
    pub user_text: String,
    pub bot_text: String,
    pub action: String,
    pub stage: Stage,
}

#[derive(Debug, Clone)]
pub struct MemorySummary {
    pub summary: String,
    pub needs_recursive_summary: bool,
}

pub struct MemoryStage {
    llm: Arc<ChatClient>,
    model: String,
}

impl MemoryStage {
    pub fn new(llm: Arc<ChatClient>, model: impl Into<String>) -> Self {
        Self {
            llm,
            model: model.into(),
        }
    }

    /// Returns `None` on any failure — the caller retains the prior summary.
    pub async fn summarize(&self, req: &MemoryRequest) -> Option<MemorySummary> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage::user(prompt::build_memory_prompt(
                &req.prior_summary,
                &req.user_text,
                &req.bot_text,
                &req.action,
                req.stage,
            ))],
            temperature: 0.2,
            max_tokens: Some(MEMORY_MAX_TOKENS),
            json_response: true,
        };

        let completion = match self.llm.complete(&request).await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "memory update call failed, keeping prior summary");
                return None;
            }
        };

        let value = match extract_json(&completion.content, JsonMode::Tolerant) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "memory update unparseable, keeping prior summary");
                return None;
            }
        };

        let mut summary = value
            .get("summary")
            .and_then(|s| s.as_str())
            .unwrap_or("")
            .to_string();
        if summary.is_empty() {
            warn!("memory update returned an empty summary, keeping prior");
            return None;
        }
        if summary.len() > ROLLING_SUMMARY_MAX_CHARS {
            summary.truncate(ROLLING_SUMMARY_MAX_CHARS);
        }

        let needs_recursive_summary = value
            .get("needs_recursive_summary")
            .and_then(|b| b.as_bool())
            .unwrap_or(false);

        debug!(
            chars = summary.len(),
            needs_recursive_summary, "rolling summary updated"
        );
        Some(MemorySummary {
            summary,
            needs_recursive_summary,
        })
    }

    /// Recursive pass: rebuild the summary from the full transcript instead
    /// of updating it incrementally. Returns `None` on any failure — the
    /// caller keeps the incremental summary it already has.
    pub async fn recompress(&self, messages: &[Message], stage: Stage) -> Option<String> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage::user(prompt::build_recompress_prompt(
                messages, stage,
            ))],
            temperature: 0.2,
            max_tokens: Some(MEMORY_MAX_TOKENS),
            json_response: true,
        };

        let completion = match self.llm.complete(&request).await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "summary re-compression call failed");
                return None;
            }
        };

        let value = match extract_json(&completion.content, JsonMode::Tolerant) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "summary re-compression unparseable");
                return None;
            }
        };

        let mut summary = value
            .get("summary")
            .and_then(|s| s.as_str())
            .unwrap_or("")
            .to_string();
        if summary.is_empty() {
            warn!("summary re-compression returned empty text");
            return None;
        }
        if summary.len() > ROLLING_SUMMARY_MAX_CHARS {
            summary.truncate(ROLLING_SUMMARY_MAX_CHARS);
        }

        debug!(chars = summary.len(), "rolling summary re-compressed");
        Some(summary)
    }
}
