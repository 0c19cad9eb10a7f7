//! Follow-up scheduler: on each tick, ask the state store which
//! conversations have entered a follow-up bucket and hand them to the worker
//! as synthetic pipeline triggers.
//!
//! The engine is idempotent under re-entry: a conversation that has been
//! nudged (counter incremented) or that has moved past its bucket no longer
//! matches the due query on the next tick. Dropped triggers (full channel)
//! are simply re-found later.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use funnel_core::types::Conversation;
use funnel_rpc::RpcClient;

/// A due conversation, handed to the worker's follow-up receiver. The worker
/// injects it under the conversation's serialization lock, so it never
/// interleaves with a user-initiated pipeline run.
#[derive(Debug, Clone)]
pub struct FollowupTrigger {
    pub conversation_id: i64,
    pub tenant_id: i64,
}

impl From<&Conversation> for FollowupTrigger {
    fn from(conv: &Conversation) -> Self {
        Self {
            conversation_id: conv.id,
            tenant_id: conv.tenant_id,
        }
    }
}

pub struct SchedulerEngine {
    rpc: Arc<RpcClient>,
    interval: Duration,
    fired_tx: mpsc::Sender<FollowupTrigger>,
}

impl SchedulerEngine {
    pub fn new(
        rpc: Arc<RpcClient>,
        interval_seconds: u64,
        fired_tx: mpsc::Sender<FollowupTrigger>,
    ) -> Self {
        Self {
            rpc,
            interval: Duration::from_secs(interval_seconds),
            fired_tx,
        }
    }

    /// Main loop. Ticks until `shutdown` broadcasts `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "scheduler started");
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn tick(&self) {
        let due = match self.rpc.due_followups(chrono::Utc::now()).await {
            Ok(d) => d,
            Err(e) => {
                error!(error = %e, "due-followups query failed");
                return;
            }
        };

        if due.is_empty() {
            return;
        }
        info!(count = due.len(), "follow-ups due");

        for conv in &due {
            // try_send never blocks the tick; a full channel drops the
            // trigger and the next tick re-finds the conversation.
            if self.fired_tx.try_send(FollowupTrigger::from(conv)).is_err() {
                warn!(
                    conversation_id = conv.id,
                    "follow-up channel full, trigger dropped"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use funnel_core::types::{ConversationMode, IntentLevel, Sentiment, Stage};

    #[test]
    fn trigger_carries_conversation_identity() {
        let conv = Conversation {
            id: 42,
            tenant_id: 7,
            lead_id: 9,
            mode: ConversationMode::Bot,
            stage: Stage::Followup,
            intent_level: IntentLevel::Medium,
            user_sentiment: Sentiment::Neutral,
            rolling_summary: String::new(),
            last_user_message_at: None,
            last_bot_message_at: None,
            followup_count_24h: 1,
            total_nudges: 1,
            needs_human_attention: false,
            active_cta_id: None,
            created_at: String::new(),
            updated_at: String::new(),
        };
        let trigger = FollowupTrigger::from(&conv);
        assert_eq!(trigger.conversation_id, 42);
        assert_eq!(trigger.tenant_id, 7);
    }
}
