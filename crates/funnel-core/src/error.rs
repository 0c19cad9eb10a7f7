use thiserror::Error;

/// Worker-side error taxonomy.
///
/// Propagation policy: `Queue`/`Rpc`/`Llm` transient failures are recovered
/// inside their layer; `Schema` at the pipeline boundary; `Invariant`
/// surfaces to the consumer, which nacks the queue entry without mutating
/// state; `Config` aborts the process before any listener starts.
#[derive(Debug, Error)]
pub enum FunnelError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("RPC error ({status}): {message}")]
    Rpc { status: u16, message: String },

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Retrieval error: {0}")]
    Retrieval(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Invariant violation: {0}")]
    Invariant(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Pipeline budget exceeded after {ms}ms")]
    BudgetExceeded { ms: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FunnelError {
    /// Short code string for structured logs and RPC error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            FunnelError::Config(_) => "CONFIG_ERROR",
            FunnelError::Queue(_) => "QUEUE_ERROR",
            FunnelError::Rpc { .. } => "RPC_ERROR",
            FunnelError::Llm(_) => "LLM_ERROR",
            FunnelError::Retrieval(_) => "RETRIEVAL_ERROR",
            FunnelError::Schema(_) => "SCHEMA_ERROR",
            FunnelError::Invariant(_) => "INVARIANT_VIOLATION",
            FunnelError::Serialization(_) => "SERIALIZATION_ERROR",
            FunnelError::Io(_) => "IO_ERROR",
            FunnelError::BudgetExceeded { .. } => "BUDGET_EXCEEDED",
            FunnelError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the consumer should nack (redeliver) rather than ack.
    pub fn should_nack(&self) -> bool {
        matches!(
            self,
            FunnelError::Invariant(_) | FunnelError::Rpc { .. } | FunnelError::Queue(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, FunnelError>;
