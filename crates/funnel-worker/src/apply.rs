//! Action applier: translate one `PipelineResult` into side effects, in a
//! fixed order — send, persist outbound, patch conversation, notify
//! observers, then kick off the background memory update.
//!
//! The send condition is deliberately conjunctive: the model saying
//! "don't send" is never overridden, whatever the risk flags say.

use std::sync::Arc;

use tracing::{info, warn};

use funnel_core::error::FunnelError;
use funnel_core::events::{EventKind, ObserverEvent};
use funnel_core::types::{BotAction, MessageOrigin};
use funnel_htl::memory::{MemoryRequest, MemoryStage};
use funnel_htl::PipelineResult;
use funnel_rpc::types::{ConversationContext, ConversationPatch};
use funnel_rpc::{RpcClient, RpcError};

/// How much history the recursive summary pass reads back.
const RECOMPRESS_HISTORY_MESSAGES: u32 = 50;

pub struct ActionApplier {
    rpc: Arc<RpcClient>,
    memory: Arc<MemoryStage>,
}

impl ActionApplier {
    pub fn new(rpc: Arc<RpcClient>, memory: Arc<MemoryStage>) -> Self {
        Self { rpc, memory }
    }

    pub async fn apply(
        &self,
        ctx: &ConversationContext,
        result: &PipelineResult,
        user_text: &str,
    ) -> Result<(), FunnelError> {
        let out = &result.generate;
        let conv = &ctx.conversation;

        // 1+2. Outbound send, then persist the outbound row (which also
        // advances last_bot_message_at server-side).
        let sent = out.should_respond
            && !out.message_text.is_empty()
            && out.action == BotAction::SendNow;
        if sent {
            self.rpc
                .send_message(conv.tenant_id, &ctx.lead_phone, &out.message_text)
                .await
                .map_err(rpc_err)?;
            self.rpc
                .record_outgoing(conv.id, MessageOrigin::Bot, &out.message_text)
                .await
                .map_err(rpc_err)?;
        }

        // 3. Conversation state.
        let updated = self
            .rpc
            .patch_conversation(
                conv.id,
                &ConversationPatch {
                    stage: Some(out.new_stage),
                    intent_level: Some(out.intent_level),
                    user_sentiment: Some(out.user_sentiment),
                    needs_human_attention: Some(out.needs_human_attention),
                    active_cta_id: out.selected_cta_id,
                    ..Default::default()
                },
            )
            .await
            .map_err(rpc_err)?;

        info!(
            conversation_id = conv.id,
            sent,
            stage = %updated.stage,
            action = %out.action,
            "pipeline result applied"
        );

        // 4+5. Observer events are best-effort: a dashboard hiccup must not
        // fail an already-applied turn.
        if out.action == BotAction::FlagAttention || out.needs_human_attention {
            self.emit(&updated, EventKind::ActionHumanAttentionRequired)
                .await;
        }
        if out.action == BotAction::InitiateCta {
            self.emit(&updated, EventKind::ActionConversationsFlagged)
                .await;
        }

        // 6. Background memory, fire-and-forget.
        if result.needs_background_summary {
            self.spawn_memory_update(ctx, result, user_text);
        }

        Ok(())
    }

    async fn emit(&self, conv: &funnel_core::types::Conversation, kind: EventKind) {
        let event = ObserverEvent {
            kind,
            conversation_id: conv.id,
            tenant_id: conv.tenant_id,
            stage: conv.stage,
            intent_level: conv.intent_level,
            sentiment: conv.user_sentiment,
            needs_human_attention: conv.needs_human_attention,
        };
        if let Err(e) = self.rpc.emit_event(&event).await {
            warn!(conversation_id = conv.id, error = %e, "observer event emit failed");
        }
    }

    fn spawn_memory_update(
        &self,
        ctx: &ConversationContext,
        result: &PipelineResult,
        user_text: &str,
    ) {
        let rpc = Arc::clone(&self.rpc);
        let memory = Arc::clone(&self.memory);
        let req = MemoryRequest {
            prior_summary: ctx.conversation.rolling_summary.clone(),
            user_text: user_text.to_string(),
            bot_text: result.generate.message_text.clone(),
            action: result.generate.action.to_string(),
            stage: result.generate.new_stage,
        };
        let conversation_id = ctx.conversation.id;

        tokio::spawn(async move {
            let Some(update) = memory.summarize(&req).await else {
                return; // prior summary retained
            };

            // The memory stage can flag the incremental summary as too dense
            // to keep updating; re-compress it from the full transcript,
            // falling back to the incremental one if that pass fails.
            let summary = if update.needs_recursive_summary {
                info!(conversation_id, "summary flagged for re-compression from full history");
                match rpc
                    .conversation_context(conversation_id, RECOMPRESS_HISTORY_MESSAGES)
                    .await
                {
                    Ok(full) => memory
                        .recompress(&full.messages, req.stage)
                        .await
                        .unwrap_or(update.summary),
                    Err(e) => {
                        warn!(
                            conversation_id,
                            error = %e,
                            "history fetch for re-compression failed, keeping incremental summary"
                        );
                        update.summary
                    }
                }
            } else {
                update.summary
            };

            let patch = ConversationPatch {
                rolling_summary: Some(summary),
                ..Default::default()
            };
            if let Err(e) = rpc.patch_conversation(conversation_id, &patch).await {
                warn!(conversation_id, error = %e, "rolling summary write failed");
            }
        });
    }
}

pub(crate) fn rpc_err(e: RpcError) -> FunnelError {
    match e {
        RpcError::Api { status, message } => FunnelError::Rpc { status, message },
        other => FunnelError::Rpc {
            status: 0,
            message: other.to_string(),
        },
    }
}
