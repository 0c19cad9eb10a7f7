use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// Pipeline constants shared across crates.
pub const DEFAULT_DEBOUNCE_WINDOW_SECS: u64 = 5;
pub const DEFAULT_PIPELINE_BUDGET_SECS: u64 = 30;
pub const DEFAULT_SCHEDULER_INTERVAL_SECS: u64 = 60;
pub const EMBEDDING_DIMENSIONS: usize = 768; // provider vectors are truncated to this
pub const ROLLING_SUMMARY_MAX_CHARS: usize = 2000;

/// Top-level config (funnel.toml + FUNNEL_* env overrides + the bare
/// recognized keys documented in the operations guide).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FunnelConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub debounce: DebounceConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_bind")]
    pub bind: String,
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// App secret the provider signs webhook bodies with (X-Hub-Signature-256).
    pub app_secret: Option<String>,
    /// Token echoed back during the provider's GET subscription handshake.
    pub verify_token: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_gateway_bind(),
            port: default_gateway_port(),
            app_secret: None,
            verify_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// SQS-compatible queue endpoint. Required for gateway and worker.
    pub url: Option<String>,
    /// Long-poll wait. The protocol caps this at 20 s.
    #[serde(default = "default_queue_wait")]
    pub wait_seconds: u64,
    #[serde(default = "default_queue_batch")]
    pub batch_size: u32,
    /// Must exceed the pipeline budget plus a safety margin, otherwise the
    /// queue redelivers entries that are still being processed.
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_seconds: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            url: None,
            wait_seconds: default_queue_wait(),
            batch_size: default_queue_batch(),
            visibility_timeout_seconds: default_visibility_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    pub api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            api_key: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Falls back to `llm.base_url` when not set.
    pub base_url: Option<String>,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    /// Falls back to `llm.api_key` when not set.
    pub api_key: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            model: default_embedding_model(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Base URL the worker-side client talks to.
    #[serde(default = "default_rpc_base_url")]
    pub base_url: String,
    /// Shared secret for the X-Internal-Secret header. Required.
    pub internal_secret: Option<String>,
    /// Bind address/port for the state-store server binary.
    #[serde(default = "default_rpc_bind")]
    pub bind: String,
    #[serde(default = "default_rpc_port")]
    pub port: u16,
    /// Graph-API-style base the send path posts to.
    #[serde(default = "default_provider_base_url")]
    pub provider_base_url: String,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            base_url: default_rpc_base_url(),
            internal_secret: None,
            bind: default_rpc_bind(),
            port: default_rpc_port(),
            provider_base_url: default_provider_base_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebounceConfig {
    /// Quiet window W: seconds of silence before a buffered burst flushes.
    #[serde(default = "default_debounce_window")]
    pub window_seconds: u64,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            window_seconds: default_debounce_window(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Hard ceiling on one pipeline invocation; on expiry the emergency
    /// result is applied and the serialization lock released.
    #[serde(default = "default_pipeline_budget")]
    pub budget_seconds: u64,
    /// How many recent messages the pipeline input carries.
    #[serde(default = "default_history_messages")]
    pub history_messages: u32,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            budget_seconds: default_pipeline_budget(),
            history_messages: default_history_messages(),
            retrieval: RetrievalConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: u32,
    /// Semantic gate: emit when `vec_sim` exceeds this.
    #[serde(default = "default_vector_threshold")]
    pub vector_threshold: f64,
    /// Lexical gate: emit when the keyword rank is at or under this.
    #[serde(default = "default_keyword_rank_threshold")]
    pub keyword_rank_threshold: u32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            vector_threshold: default_vector_threshold(),
            keyword_rank_threshold: default_keyword_rank_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_interval")]
    pub interval_seconds: u64,
    /// Follow-up buckets: (minutes-elapsed window, required prior count).
    /// Windows overlap the jitter of the tick cadence on purpose.
    #[serde(default = "default_followup_buckets")]
    pub followup_buckets: Vec<FollowupBucket>,
    /// Liveness file the `start` subcommand owns and `stop` removes.
    #[serde(default = "default_liveness_path")]
    pub liveness_path: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_scheduler_interval(),
            followup_buckets: default_followup_buckets(),
            liveness_path: default_liveness_path(),
        }
    }
}

/// One follow-up window: due when `min_minutes <= elapsed <= max_minutes`
/// since the last bot message and exactly `required_prior` follow-ups have
/// already gone out in the current 24 h span.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FollowupBucket {
    pub min_minutes: i64,
    pub max_minutes: i64,
    pub required_prior: u32,
}

impl FollowupBucket {
    /// Parse the `FOLLOWUP_BUCKETS` env format: `10-20:0,180-200:1,360-400:2`.
    pub fn parse_list(raw: &str) -> Result<Vec<FollowupBucket>, String> {
        let mut out = Vec::new();
        for part in raw.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (window, prior) = part
                .split_once(':')
                .ok_or_else(|| format!("bucket '{part}' is missing ':count'"))?;
            let (min, max) = window
                .split_once('-')
                .ok_or_else(|| format!("bucket window '{window}' is not 'min-max'"))?;
            let bucket = FollowupBucket {
                min_minutes: min
                    .trim()
                    .parse()
                    .map_err(|_| format!("bad bucket minimum '{min}'"))?,
                max_minutes: max
                    .trim()
                    .parse()
                    .map_err(|_| format!("bad bucket maximum '{max}'"))?,
                required_prior: prior
                    .trim()
                    .parse()
                    .map_err(|_| format!("bad bucket count '{prior}'"))?,
            };
            if bucket.min_minutes > bucket.max_minutes {
                return Err(format!("bucket '{part}' has min > max"));
            }
            out.push(bucket);
        }
        if out.is_empty() {
            return Err("FOLLOWUP_BUCKETS parsed to an empty list".to_string());
        }
        Ok(out)
    }
}

fn default_gateway_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_gateway_port() -> u16 {
    8080
}
fn default_queue_wait() -> u64 {
    20
}
fn default_queue_batch() -> u32 {
    10
}
fn default_visibility_timeout() -> u64 {
    120
}
fn default_llm_base_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_temperature() -> f64 {
    0.4
}
fn default_max_tokens() -> u32 {
    1024
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_rpc_base_url() -> String {
    "http://127.0.0.1:8090".to_string()
}
fn default_rpc_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_rpc_port() -> u16 {
    8090
}
fn default_provider_base_url() -> String {
    "https://graph.facebook.com/v19.0".to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.funnel/funnel.db")
}
fn default_debounce_window() -> u64 {
    DEFAULT_DEBOUNCE_WINDOW_SECS
}
fn default_pipeline_budget() -> u64 {
    DEFAULT_PIPELINE_BUDGET_SECS
}
fn default_history_messages() -> u32 {
    10
}
fn default_top_k() -> u32 {
    5
}
fn default_vector_threshold() -> f64 {
    0.65
}
fn default_keyword_rank_threshold() -> u32 {
    5
}
fn default_scheduler_interval() -> u64 {
    DEFAULT_SCHEDULER_INTERVAL_SECS
}
fn default_followup_buckets() -> Vec<FollowupBucket> {
    vec![
        FollowupBucket {
            min_minutes: 10,
            max_minutes: 20,
            required_prior: 0,
        },
        FollowupBucket {
            min_minutes: 180,
            max_minutes: 200,
            required_prior: 1,
        },
        FollowupBucket {
            min_minutes: 360,
            max_minutes: 400,
            required_prior: 2,
        },
    ]
}
fn default_liveness_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.funnel/funnel.run")
}

impl FunnelConfig {
    /// Load config from a TOML file with FUNNEL_* env var overrides, then
    /// apply the bare recognized keys on top (highest precedence).
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. FUNNEL_CONFIG env var
    ///   3. ~/.funnel/funnel.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("FUNNEL_CONFIG").ok())
            .unwrap_or_else(default_config_path);

        let mut config: FunnelConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("FUNNEL_").split("__"))
            .extract()
            .map_err(|e| crate::error::FunnelError::Config(e.to_string()))?;

        config.apply_recognized_env()?;
        Ok(config)
    }

    /// Bare env keys recognized regardless of the FUNNEL_ prefix scheme.
    fn apply_recognized_env(&mut self) -> crate::error::Result<()> {
        if let Ok(v) = std::env::var("QUEUE_URL") {
            self.queue.url = Some(v);
        }
        if let Ok(v) = std::env::var("LLM_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Ok(v) = std::env::var("LLM_MODEL") {
            self.llm.model = v;
        }
        if let Ok(v) = std::env::var("LLM_API_KEY") {
            self.llm.api_key = Some(v);
        }
        if let Ok(v) = std::env::var("EMBEDDING_MODEL") {
            self.embedding.model = v;
        }
        if let Ok(v) = std::env::var("INTERNAL_SECRET") {
            self.rpc.internal_secret = Some(v);
        }
        if let Ok(v) = std::env::var("DEBOUNCE_WINDOW_SECONDS") {
            self.debounce.window_seconds = parse_env_u64("DEBOUNCE_WINDOW_SECONDS", &v)?;
        }
        if let Ok(v) = std::env::var("PIPELINE_BUDGET_SECONDS") {
            self.pipeline.budget_seconds = parse_env_u64("PIPELINE_BUDGET_SECONDS", &v)?;
        }
        if let Ok(v) = std::env::var("SCHEDULER_INTERVAL_SECONDS") {
            self.scheduler.interval_seconds = parse_env_u64("SCHEDULER_INTERVAL_SECONDS", &v)?;
        }
        if let Ok(v) = std::env::var("FOLLOWUP_BUCKETS") {
            self.scheduler.followup_buckets =
                FollowupBucket::parse_list(&v).map_err(crate::error::FunnelError::Config)?;
        }
        Ok(())
    }

    /// Fatal checks for the worker binary: queue, RPC secret, LLM key.
    pub fn validate_for_worker(&self) -> crate::error::Result<()> {
        let mut missing = Vec::new();
        if self.queue.url.is_none() {
            missing.push("QUEUE_URL");
        }
        if self.rpc.internal_secret.is_none() {
            missing.push("INTERNAL_SECRET");
        }
        if self.llm.api_key.is_none() {
            missing.push("LLM_API_KEY");
        }
        fail_if_missing(missing)
    }

    /// Fatal checks for the gateway binary: queue + webhook secret.
    pub fn validate_for_gateway(&self) -> crate::error::Result<()> {
        let mut missing = Vec::new();
        if self.queue.url.is_none() {
            missing.push("QUEUE_URL");
        }
        if self.gateway.app_secret.is_none() {
            missing.push("gateway.app_secret");
        }
        fail_if_missing(missing)
    }

    /// Fatal checks for the state-store binary.
    pub fn validate_for_state(&self) -> crate::error::Result<()> {
        let mut missing = Vec::new();
        if self.rpc.internal_secret.is_none() {
            missing.push("INTERNAL_SECRET");
        }
        fail_if_missing(missing)
    }

    pub fn embedding_base_url(&self) -> &str {
        self.embedding
            .base_url
            .as_deref()
            .unwrap_or(&self.llm.base_url)
    }

    pub fn embedding_api_key(&self) -> Option<&str> {
        self.embedding
            .api_key
            .as_deref()
            .or(self.llm.api_key.as_deref())
    }
}

fn fail_if_missing(missing: Vec<&str>) -> crate::error::Result<()> {
    if missing.is_empty() {
        Ok(())
    } else {
        Err(crate::error::FunnelError::Config(format!(
            "missing required configuration: {}",
            missing.join(", ")
        )))
    }
}

fn parse_env_u64(key: &str, raw: &str) -> crate::error::Result<u64> {
    raw.parse()
        .map_err(|_| crate::error::FunnelError::Config(format!("{key} is not an integer: {raw}")))
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.funnel/funnel.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_list_parses() {
        let buckets = FollowupBucket::parse_list("10-20:0,180-200:1,360-400:2").unwrap();
        assert_eq!(buckets.len(), 3);
        assert_eq!(buckets[1].min_minutes, 180);
        assert_eq!(buckets[1].required_prior, 1);
    }

    #[test]
    fn bucket_list_rejects_inverted_window() {
        assert!(FollowupBucket::parse_list("20-10:0").is_err());
    }

    #[test]
    fn bucket_list_rejects_empty() {
        assert!(FollowupBucket::parse_list("  ").is_err());
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = FunnelConfig::default();
        assert_eq!(cfg.debounce.window_seconds, 5);
        assert_eq!(cfg.pipeline.budget_seconds, 30);
        assert_eq!(cfg.scheduler.interval_seconds, 60);
        assert_eq!(cfg.pipeline.retrieval.top_k, 5);
        assert!((cfg.pipeline.retrieval.vector_threshold - 0.65).abs() < 1e-9);
        assert_eq!(cfg.scheduler.followup_buckets.len(), 3);
    }

    #[test]
    fn worker_validation_reports_missing_keys() {
        let cfg = FunnelConfig::default();
        let err = cfg.validate_for_worker().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("QUEUE_URL"));
        assert!(msg.contains("INTERNAL_SECRET"));
    }
}
