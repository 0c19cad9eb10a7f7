//! The HTL (Human Thinking Layer) pipeline: retrieve → generate, with the
//! background memory stage factored into [`crate::memory`] so the action
//! applier can fire it after the user-visible work is done.
//!
//! `run` is total: transport and parse failures degrade to the emergency
//! result instead of propagating, so the caller always has a decision to
//! apply.

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use funnel_core::config::LlmConfig;
use funnel_llm::{extract_json, ChatClient, ChatMessage, ChatRequest, JsonMode};
use funnel_retrieval::RetrievalEngine;

use crate::prompt;
use crate::types::{GenerateOutput, PipelineInput, PipelineResult};

pub struct HtlPipeline {
    llm: Arc<ChatClient>,
    model: String,
    temperature: f64,
    max_tokens: u32,
    retrieval: Option<Arc<RetrievalEngine>>,
}

impl HtlPipeline {
    pub fn new(llm: Arc<ChatClient>, cfg: &LlmConfig, retrieval: Option<Arc<RetrievalEngine>>) -> Self {
        Self {
            llm,
            model: cfg.model.clone(),
            temperature: cfg.temperature,
            max_tokens: cfg.max_tokens,
            retrieval,
        }
    }

    /// Run the staged transformation for one combined user message.
    pub async fn run(&self, input: &PipelineInput, user_text: &str) -> PipelineResult {
        let started = Instant::now();

        // Stage 1 — retrieve. A retrieval failure is not fatal: the model is
        // told retrieval errored and generation continues.
        let knowledge_block = match &self.retrieval {
            Some(engine) => match engine.search(input.tenant_id, user_text).await {
                Ok(chunks) => prompt::format_knowledge_block(&chunks),
                Err(e) => {
                    warn!(
                        conversation_id = input.conversation_id,
                        error = %e,
                        "knowledge retrieval failed"
                    );
                    prompt::KNOWLEDGE_ERROR_BLOCK.to_string()
                }
            },
            None => prompt::format_knowledge_block(&[]),
        };

        // Stage 2 — generate.
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage::system(prompt::build_system_prompt(input)),
                ChatMessage::user(prompt::build_user_prompt(input, user_text, &knowledge_block)),
            ],
            temperature: self.temperature,
            max_tokens: Some(self.max_tokens),
            json_response: true,
        };

        let (generate, tokens_in, tokens_out, degraded) = match self.llm.complete(&request).await {
            Ok(completion) => match extract_json(&completion.content, JsonMode::Tolerant) {
                Ok(value) => (
                    GenerateOutput::from_llm_json(&value, input.stage),
                    completion.tokens_in,
                    completion.tokens_out,
                    false,
                ),
                Err(e) => {
                    warn!(
                        conversation_id = input.conversation_id,
                        error = %e,
                        "generate output unparseable, applying emergency result"
                    );
                    (GenerateOutput::emergency(input.stage), completion.tokens_in, completion.tokens_out, true)
                }
            },
            Err(e) => {
                warn!(
                    conversation_id = input.conversation_id,
                    error = %e,
                    "LLM transport failed, applying emergency result"
                );
                (GenerateOutput::emergency(input.stage), 0, 0, true)
            }
        };

        let latency_ms = started.elapsed().as_millis() as u64;
        info!(
            conversation_id = input.conversation_id,
            action = %generate.action,
            stage = %generate.new_stage,
            should_respond = generate.should_respond,
            confidence = generate.confidence,
            latency_ms,
            "pipeline turn complete"
        );

        PipelineResult {
            generate,
            latency_ms,
            tokens_in,
            tokens_out,
            needs_background_summary: !degraded,
        }
    }
}
