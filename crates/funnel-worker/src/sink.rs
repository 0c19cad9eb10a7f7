//! The real drain sink: context fetch → HTL pipeline (under the budget) →
//! action applier, plus the follow-up counter increment for synthetic runs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use funnel_core::types::ConversationMode;
use funnel_htl::types::{GenerateOutput, PipelineInput, PipelineResult};
use funnel_htl::HtlPipeline;
use funnel_rpc::types::{ConversationContext, ConversationPatch};
use funnel_rpc::RpcClient;

use crate::debounce::{BatchKind, DrainError, DrainSink, DrainedBatch};

/// Text handed to the pipeline for a scheduler-injected invocation.
pub const FOLLOWUP_TRIGGER_TEXT: &str =
    "[system] The lead has not replied since your last message. Decide whether \
     to send a short, natural follow-up nudge or keep waiting.";

/// Session-window length imposed by the messaging provider.
const SESSION_WINDOW_HOURS: i64 = 24;

pub struct PipelineSink {
    rpc: Arc<RpcClient>,
    pipeline: HtlPipeline,
    applier: crate::apply::ActionApplier,
    budget: Duration,
    history_messages: u32,
}

impl PipelineSink {
    pub fn new(
        rpc: Arc<RpcClient>,
        pipeline: HtlPipeline,
        applier: crate::apply::ActionApplier,
        budget_seconds: u64,
        history_messages: u32,
    ) -> Self {
        Self {
            rpc,
            pipeline,
            applier,
            budget: Duration::from_secs(budget_seconds),
            history_messages,
        }
    }

    fn build_input(&self, ctx: &ConversationContext) -> PipelineInput {
        let conv = &ctx.conversation;
        let now = chrono::Utc::now();
        let session_window_open = conv
            .last_user_message_at
            .as_deref()
            .and_then(|ts| chrono::DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| now.signed_duration_since(ts) < chrono::Duration::hours(SESSION_WINDOW_HOURS))
            .unwrap_or(false);

        PipelineInput {
            conversation_id: conv.id,
            tenant_id: conv.tenant_id,
            business_name: ctx.tenant_name.clone(),
            persona: ctx.tenant_persona.clone(),
            rolling_summary: conv.rolling_summary.clone(),
            recent_messages: ctx.messages.clone(),
            stage: conv.stage,
            intent_level: conv.intent_level,
            user_sentiment: conv.user_sentiment,
            now,
            session_window_open,
            followup_count_24h: conv.followup_count_24h,
            total_nudges: conv.total_nudges,
            available_ctas: ctx.ctas.clone(),
        }
    }
}

#[async_trait]
impl DrainSink for PipelineSink {
    async fn drain(&self, batch: DrainedBatch) -> Result<(), DrainError> {
        let ctx = self
            .rpc
            .conversation_context(batch.conversation_id, self.history_messages)
            .await
            .map_err(|e| DrainError(format!("context fetch failed: {e}")))?;

        // Mode is re-checked at drain time: a takeover between buffering and
        // the quiet-window flush must win. The inbound rows are already
        // persisted, so dropping the batch loses nothing.
        if ctx.conversation.mode == ConversationMode::Human {
            info!(
                conversation_id = batch.conversation_id,
                "conversation in human mode at drain, skipping pipeline"
            );
            return Ok(());
        }

        let input = self.build_input(&ctx);
        let result = match tokio::time::timeout(self.budget, self.pipeline.run(&input, &batch.combined_text)).await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    conversation_id = batch.conversation_id,
                    budget_secs = self.budget.as_secs(),
                    "pipeline budget exceeded, applying emergency result"
                );
                PipelineResult {
                    generate: GenerateOutput::emergency(input.stage),
                    latency_ms: self.budget.as_millis() as u64,
                    tokens_in: 0,
                    tokens_out: 0,
                    needs_background_summary: false,
                }
            }
        };

        if let Err(e) = self.applier.apply(&ctx, &result, &batch.combined_text).await {
            // Flag the conversation so the dashboard surfaces it, then let
            // the debounce layer re-queue the batch.
            let _ = self
                .rpc
                .patch_conversation(
                    batch.conversation_id,
                    &ConversationPatch {
                        needs_human_attention: Some(true),
                        ..Default::default()
                    },
                )
                .await;
            return Err(DrainError(format!("apply failed: {e}")));
        }

        if batch.kind == BatchKind::FollowupNudge && result.generate.should_respond {
            if let Err(e) = self.rpc.increment_nudge(batch.conversation_id).await {
                warn!(
                    conversation_id = batch.conversation_id,
                    error = %e,
                    "nudge counter increment failed"
                );
            }
        }

        Ok(())
    }
}
