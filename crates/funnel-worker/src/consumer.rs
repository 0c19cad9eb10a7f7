//! Queue consumer: long-poll, ingest each inbound event, ack only once the
//! inbound rows are durably written.
//!
//! Redelivery is normal (visibility timeout, nacks, crashes mid-batch); the
//! state store dedupes by provider message id, so ingest is idempotent.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use funnel_core::error::{FunnelError, Result};
use funnel_core::events::{EventKind, ObserverEvent};
use funnel_core::types::ConversationMode;
use funnel_rpc::types::IncomingMessage;
use funnel_rpc::RpcClient;

use crate::apply::rpc_err;
use crate::debounce::{DebounceTable, DrainSink};
use crate::envelope::{parse_events, InboundEvent};
use crate::queue::{EventQueue, QueueMessage};

pub struct Consumer<S: DrainSink> {
    queue: Arc<dyn EventQueue>,
    rpc: Arc<RpcClient>,
    debounce: DebounceTable<S>,
    batch_size: u32,
    wait_seconds: u64,
}

impl<S: DrainSink> Consumer<S> {
    pub fn new(
        queue: Arc<dyn EventQueue>,
        rpc: Arc<RpcClient>,
        debounce: DebounceTable<S>,
        batch_size: u32,
        wait_seconds: u64,
    ) -> Self {
        Self {
            queue,
            rpc,
            debounce,
            batch_size,
            wait_seconds,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            batch = self.batch_size,
            wait_secs = self.wait_seconds,
            "queue consumer started"
        );
        loop {
            tokio::select! {
                received = self.queue.receive(self.batch_size, self.wait_seconds) => {
                    match received {
                        Ok(messages) => {
                            for msg in messages {
                                self.handle(msg).await;
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "queue receive failed");
                            // Brief pause so a dead queue endpoint doesn't
                            // spin the loop.
                            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("queue consumer shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn handle(&self, msg: QueueMessage) {
        let events = parse_events(&msg.body);
        if events.is_empty() {
            // Status notifications and unparseable bodies carry no work;
            // acking keeps poison entries from looping forever.
            debug!(queue_message_id = %msg.message_id, "no inbound events, acking");
            self.ack(&msg).await;
            return;
        }

        for event in &events {
            if let Err(e) = self.ingest(event).await {
                warn!(
                    queue_message_id = %msg.message_id,
                    provider_message_id = %event.provider_message_id,
                    error = %e,
                    code = e.code(),
                    "ingest failed, nacking queue entry"
                );
                if let Err(nack_err) = self.queue.nack(&msg.receipt).await {
                    error!(error = %nack_err, "nack failed");
                }
                return;
            }
        }

        // Every event's Message row is written: ownership is durably ours.
        self.ack(&msg).await;
    }

    async fn ack(&self, msg: &QueueMessage) {
        if let Err(e) = self.queue.ack(&msg.receipt).await {
            error!(queue_message_id = %msg.message_id, error = %e, "ack failed");
        }
    }

    /// Steps 1–4 of the debounce contract: resolve, persist, human-mode
    /// check, buffer.
    async fn ingest(&self, event: &InboundEvent) -> Result<()> {
        let tenant = self
            .rpc
            .tenant_by_phone_number_id(&event.phone_number_id)
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    FunnelError::Invariant(format!(
                        "no tenant for phone_number_id {}",
                        event.phone_number_id
                    ))
                } else {
                    rpc_err(e)
                }
            })?;

        let conv = self
            .rpc
            .conversation_by_phone(tenant.id, &event.from_phone)
            .await
            .map_err(rpc_err)?;

        let outcome = self
            .rpc
            .record_incoming(&IncomingMessage {
                conversation_id: conv.id,
                provider_message_id: event.provider_message_id.clone(),
                content: event.text.clone(),
            })
            .await
            .map_err(rpc_err)?;

        if outcome.duplicate {
            debug!(
                conversation_id = conv.id,
                provider_message_id = %event.provider_message_id,
                "redelivered message, already persisted"
            );
            return Ok(());
        }

        if conv.mode == ConversationMode::Human {
            // A human owns this conversation: persist + notify, nothing else.
            let event = ObserverEvent {
                kind: EventKind::ConversationUpdated,
                conversation_id: conv.id,
                tenant_id: conv.tenant_id,
                stage: conv.stage,
                intent_level: conv.intent_level,
                sentiment: conv.user_sentiment,
                needs_human_attention: conv.needs_human_attention,
            };
            if let Err(e) = self.rpc.emit_event(&event).await {
                warn!(conversation_id = conv.id, error = %e, "conversation-updated emit failed");
            }
            return Ok(());
        }

        self.debounce.push(conv.id, tenant.id, event.text.clone());
        Ok(())
    }
}
