//! Per-conversation debounce and serialization.
//!
//! Each conversation gets a buffer, a quiet-window timer and a serialization
//! lock. Bursts of short messages coalesce into one pipeline invocation;
//! the lock guarantees at most one in-flight pipeline per conversation, and
//! its FIFO fairness preserves arrival order across queued drains.
//!
//! Timers are cancelled by generation counter: every buffer append bumps the
//! generation and arms a fresh timer; a timer that wakes with a stale
//! generation exits without draining.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKind {
    /// Coalesced user messages drained from the buffer.
    UserMessages,
    /// Synthetic scheduler trigger; bypasses the buffer.
    FollowupNudge,
}

#[derive(Debug, Clone)]
pub struct DrainedBatch {
    pub conversation_id: i64,
    pub tenant_id: i64,
    pub kind: BatchKind,
    /// Buffered texts concatenated with newlines, in arrival order.
    pub combined_text: String,
    pub message_count: usize,
}

#[derive(Debug, thiserror::Error)]
#[error("drain failed: {0}")]
pub struct DrainError(pub String);

/// Seam between the debounce mechanics and the pipeline. The worker wires
/// the real pipeline+applier; tests wire a recorder.
#[async_trait]
pub trait DrainSink: Send + Sync + 'static {
    async fn drain(&self, batch: DrainedBatch) -> Result<(), DrainError>;
}

struct Buffered {
    text: String,
}

struct ConvState {
    buffer: Vec<Buffered>,
    generation: u64,
}

struct ConvEntry {
    tenant_id: i64,
    state: Mutex<ConvState>,
    /// The serialization lock. tokio's Mutex is fair, which is what makes
    /// queued drains complete in arrival order.
    lock: tokio::sync::Mutex<()>,
}

struct Inner<S> {
    entries: DashMap<i64, Arc<ConvEntry>>,
    window: Duration,
    sink: Arc<S>,
}

/// Cheaply cloneable handle; all clones share the same table.
pub struct DebounceTable<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for DebounceTable<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: DrainSink> DebounceTable<S> {
    pub fn new(window_seconds: u64, sink: Arc<S>) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                window: Duration::from_secs(window_seconds),
                sink,
            }),
        }
    }

    /// Append a message to the conversation's buffer and (re)arm its
    /// quiet-window timer. The inbound row is already persisted by the time
    /// this is called.
    pub fn push(&self, conversation_id: i64, tenant_id: i64, text: String) {
        let entry = self.inner.entry(conversation_id, tenant_id);
        let generation = {
            let mut state = entry.state.lock().unwrap();
            state.buffer.push(Buffered { text });
            state.generation += 1;
            state.generation
        };
        debug!(conversation_id, generation, "message buffered");
        arm(&self.inner, conversation_id, generation);
    }

    /// Synthetic invocation: no buffering, no quiet window, but the same
    /// serialization lock, so it never interleaves with a user-initiated
    /// pipeline.
    pub async fn inject(
        &self,
        conversation_id: i64,
        tenant_id: i64,
        text: String,
    ) -> Result<(), DrainError> {
        let entry = self.inner.entry(conversation_id, tenant_id);
        let _guard = entry.lock.lock().await;
        self.inner
            .sink
            .drain(DrainedBatch {
                conversation_id,
                tenant_id,
                kind: BatchKind::FollowupNudge,
                combined_text: text,
                message_count: 0,
            })
            .await
    }
}

impl<S: DrainSink> Inner<S> {
    fn entry(&self, conversation_id: i64, tenant_id: i64) -> Arc<ConvEntry> {
        self.entries
            .entry(conversation_id)
            .or_insert_with(|| {
                Arc::new(ConvEntry {
                    tenant_id,
                    state: Mutex::new(ConvState {
                        buffer: Vec::new(),
                        generation: 0,
                    }),
                    lock: tokio::sync::Mutex::new(()),
                })
            })
            .clone()
    }
}

fn arm<S: DrainSink>(inner: &Arc<Inner<S>>, conversation_id: i64, generation: u64) {
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        tokio::time::sleep(inner.window).await;
        fire(inner, conversation_id, generation).await;
    });
}

/// Timer body: drain if this timer is still the latest, then run the sink
/// under the conversation lock. A failed drain is re-queued at the front of
/// the buffer as one synthetic marker entry; messages that arrived while
/// the failed pipeline ran stay behind it, preserving order.
async fn fire<S: DrainSink>(inner: Arc<Inner<S>>, conversation_id: i64, generation: u64) {
    let entry = match inner.entries.get(&conversation_id) {
        Some(e) => e.clone(),
        None => return,
    };

    let batch = {
        let mut state = entry.state.lock().unwrap();
        if state.generation != generation || state.buffer.is_empty() {
            // A newer message re-armed the window, or the buffer was already
            // claimed.
            return;
        }
        let drained: Vec<Buffered> = state.buffer.drain(..).collect();
        DrainedBatch {
            conversation_id,
            tenant_id: entry.tenant_id,
            kind: BatchKind::UserMessages,
            combined_text: drained
                .iter()
                .map(|b| b.text.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
            message_count: drained.len(),
        }
    };

    debug!(
        conversation_id,
        messages = batch.message_count,
        "quiet window elapsed, draining"
    );

    let _guard = entry.lock.lock().await;
    if let Err(e) = inner.sink.drain(batch.clone()).await {
        warn!(
            conversation_id,
            error = %e,
            "pipeline failed, re-queuing drained batch"
        );
        let generation = {
            let mut state = entry.state.lock().unwrap();
            state.buffer.insert(
                0,
                Buffered {
                    text: batch.combined_text,
                },
            );
            state.generation += 1;
            state.generation
        };
        arm(&inner, conversation_id, generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records drained batches; can fail the first N drains and simulate
    /// pipeline latency. Tracks the maximum number of concurrently running
    /// drains, which must never exceed 1 for a single conversation.
    struct RecordingSink {
        batches: Mutex<Vec<DrainedBatch>>,
        fail_first: AtomicUsize,
        drain_duration: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl RecordingSink {
        fn new(drain_duration: Duration) -> Arc<Self> {
            Arc::new(Self {
                batches: Mutex::new(Vec::new()),
                fail_first: AtomicUsize::new(0),
                drain_duration,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            })
        }

        fn batches(&self) -> Vec<DrainedBatch> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DrainSink for RecordingSink {
        async fn drain(&self, batch: DrainedBatch) -> Result<(), DrainError> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(self.drain_duration).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                self.batches.lock().unwrap().push(batch);
                return Err(DrainError("simulated pipeline failure".to_string()));
            }
            self.batches.lock().unwrap().push(batch);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_coalesces_into_one_invocation() {
        let sink = RecordingSink::new(Duration::from_millis(0));
        let table = DebounceTable::new(5, Arc::clone(&sink));

        table.push(1, 10, "hi".to_string());
        tokio::time::sleep(Duration::from_secs(2)).await;
        table.push(1, 10, "are you there?".to_string());
        tokio::time::sleep(Duration::from_secs(2)).await;
        table.push(1, 10, "I need help".to_string());

        // Quiet window: last message at t=4, flush due at t=9.
        tokio::time::sleep(Duration::from_secs(6)).await;

        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].combined_text, "hi\nare you there?\nI need help");
        assert_eq!(batches[0].message_count, 3);
        assert_eq!(batches[0].kind, BatchKind::UserMessages);
    }

    #[tokio::test(start_paused = true)]
    async fn at_most_one_pipeline_in_flight_per_conversation() {
        // Pipeline takes 10s; a second message lands mid-flight.
        let sink = RecordingSink::new(Duration::from_secs(10));
        let table = DebounceTable::new(5, Arc::clone(&sink));

        table.push(1, 10, "first".to_string());
        tokio::time::sleep(Duration::from_secs(6)).await; // drain 1 starts at t=5
        table.push(1, 10, "second".to_string());
        tokio::time::sleep(Duration::from_secs(40)).await;

        let batches = sink.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].combined_text, "first");
        assert_eq!(batches[1].combined_text, "second");
        assert_eq!(sink.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn separate_conversations_do_not_serialize_against_each_other() {
        let sink = RecordingSink::new(Duration::from_secs(10));
        let table = DebounceTable::new(5, Arc::clone(&sink));

        table.push(1, 10, "conv one".to_string());
        table.push(2, 10, "conv two".to_string());
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(sink.batches().len(), 2);
        // Both drains ran concurrently: the lock is per conversation.
        assert_eq!(sink.max_in_flight.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_drain_requeues_and_retries() {
        let sink = RecordingSink::new(Duration::from_millis(0));
        sink.fail_first.store(1, Ordering::SeqCst);
        let table = DebounceTable::new(5, Arc::clone(&sink));

        table.push(1, 10, "hello".to_string());
        tokio::time::sleep(Duration::from_secs(20)).await;

        let batches = sink.batches();
        // First attempt failed, batch re-queued as a single marker and
        // retried after another quiet window.
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].combined_text, "hello");
        assert_eq!(batches[1].combined_text, "hello");
        assert_eq!(batches[1].message_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn messages_arriving_after_failure_stay_behind_requeued_batch() {
        let sink = RecordingSink::new(Duration::from_secs(2));
        sink.fail_first.store(1, Ordering::SeqCst);
        let table = DebounceTable::new(5, Arc::clone(&sink));

        table.push(1, 10, "first".to_string());
        // Drain starts at t=5, fails at t=7; new message arrives at t=6.
        tokio::time::sleep(Duration::from_secs(6)).await;
        table.push(1, 10, "second".to_string());
        tokio::time::sleep(Duration::from_secs(30)).await;

        let batches = sink.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].combined_text, "first");
        // The re-queued text leads, the newer message follows.
        assert_eq!(batches[1].combined_text, "first\nsecond");
    }

    #[tokio::test(start_paused = true)]
    async fn inject_bypasses_buffer_but_takes_the_lock() {
        let sink = RecordingSink::new(Duration::from_secs(10));
        let table = DebounceTable::new(5, Arc::clone(&sink));

        // Start a user-initiated pipeline at t=5.
        table.push(1, 10, "user message".to_string());
        tokio::time::sleep(Duration::from_secs(6)).await;

        // Inject a follow-up while it is in flight; it must wait.
        let inject_table = table.clone();
        let inject = tokio::spawn(async move {
            inject_table
                .inject(1, 10, "[system] follow-up due".to_string())
                .await
        });
        tokio::time::sleep(Duration::from_secs(40)).await;
        inject.await.unwrap().unwrap();

        let batches = sink.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].kind, BatchKind::UserMessages);
        assert_eq!(batches[1].kind, BatchKind::FollowupNudge);
        assert_eq!(sink.max_in_flight.load(Ordering::SeqCst), 1);
    }
}
