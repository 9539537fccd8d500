//! Configuration management for the message router service.
//!
//! The service reads a single config file at `~/.relaycx/config.yaml` (or
//! `.json`/`.json5`, whichever is present) merged with environment variable
//! overrides, merged with built-in defaults.
//!
//! # Configuration Priority
//!
//! 1. Environment variables (`RELAYCX_*` prefix)
//! 2. Explicit config file values
//! 3. Built-in defaults
//!
//! # Environment Variable Mapping
//!
//! - `RELAYCX_BIND` → network bind address
//! - `RELAYCX_REDIS_URL` → redis.url
//! - `RELAYCX_DEBOUNCE_WINDOW_SECS` → router.debounce_window_secs
//! - `RELAYCX_ROUTER_LOCK_TTL_SECS` → router.lock_ttl_secs
//! - `RELAYCX_LLM_PROXY_URL` → pipeline.llm_proxy_url
//! - `RELAYCX_LOG_FORMAT` → observability.log_format (`pretty` | `json`)
//! - `RELAYCX_LOG_LEVEL` → observability.log_level

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new()
        .map_or_else(|| PathBuf::from(".relaycx"), |dirs| dirs.home_dir().join(".relaycx"))
}

/// Get the configuration file path, preferring YAML.
pub fn config_path() -> PathBuf {
    config_dir().join("config.yaml")
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl AppConfig {
    /// Load configuration: defaults, overlaid by the config file (if any),
    /// overlaid by environment variables.
    pub fn load() -> Result<Self> {
        let mut cfg = Self::from_file().unwrap_or_default();
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    fn from_file() -> Option<Self> {
        let path = config_path();
        let raw = std::fs::read_to_string(&path).ok()?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&raw).ok(),
            Some("json5") => json5::from_str(&raw).ok(),
            _ => serde_yaml::from_str(&raw).ok(),
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("RELAYCX_BIND") {
            self.network.bind = v;
        }
        if let Ok(v) = std::env::var("RELAYCX_REDIS_URL") {
            self.redis.url = v;
        }
        if let Ok(v) = std::env::var("RELAYCX_DEBOUNCE_WINDOW_SECS") {
            if let Ok(n) = v.parse() {
                self.router.debounce_window_secs = n;
            }
        }
        if let Ok(v) = std::env::var("RELAYCX_ROUTER_LOCK_TTL_SECS") {
            if let Ok(n) = v.parse() {
                self.router.lock_ttl_secs = n;
            }
        }
        if let Ok(v) = std::env::var("RELAYCX_LLM_PROXY_URL") {
            self.pipeline.llm_proxy_url = v;
        }
        if let Ok(v) = std::env::var("RELAYCX_LOG_FORMAT") {
            self.observability.log_format = v;
        }
        if let Ok(v) = std::env::var("RELAYCX_LOG_LEVEL") {
            self.observability.log_level = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.router.lock_max_wait_secs == 0 {
            return Err(Error::Config("router.lock_max_wait_secs must be > 0".into()));
        }
        if self.pipeline.tool_loop_max_turns == 0 {
            return Err(Error::Config("pipeline.tool_loop_max_turns must be > 0".into()));
        }
        Ok(())
    }
}

/// Global network configuration for the HTTP/WS server binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Bind address for the HTTP/WebSocket server.
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self { bind: default_bind(), port: default_port() }
    }
}

fn default_bind() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    8080
}

/// Redis connection settings backing the lock service (C1), the debounce
/// KV state (C7), and the WebSocket pub/sub bridge (C5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// Base backoff (ms) for the pub/sub reconnect loop; doubles per retry, capped.
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
    #[serde(default = "default_reconnect_backoff_cap_ms")]
    pub reconnect_backoff_cap_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            reconnect_backoff_cap_ms: default_reconnect_backoff_cap_ms(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".into()
}
fn default_reconnect_backoff_ms() -> u64 {
    200
}
fn default_reconnect_backoff_cap_ms() -> u64 {
    5_000
}

/// Router (C6) and lock (C1) / debounce (C7) timing knobs.
///
/// See spec §6 "Environment / configuration knobs" and §9's resolution of
/// the debounce-window ambiguity (fixed at 5s).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Per-contact lock TTL in C6's `route()`.
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    /// Max time C6 waits to acquire the per-contact lock before rejecting
    /// with `LockTimeout`.
    #[serde(default = "default_lock_max_wait_secs")]
    pub lock_max_wait_secs: u64,
    /// Debounce quiescence window `W`.
    #[serde(default = "default_debounce_window_secs")]
    pub debounce_window_secs: u64,
    /// TTL of `worker:active:{chat_id}`; also the heartbeat interval ceiling.
    #[serde(default = "default_worker_ttl_secs")]
    pub worker_ttl_secs: u64,
    /// Upper bound on the worker loop's sleep granularity.
    #[serde(default = "default_worker_poll_cap_secs")]
    pub worker_poll_cap_secs: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: default_lock_ttl_secs(),
            lock_max_wait_secs: default_lock_max_wait_secs(),
            debounce_window_secs: default_debounce_window_secs(),
            worker_ttl_secs: default_worker_ttl_secs(),
            worker_poll_cap_secs: default_worker_poll_cap_secs(),
        }
    }
}

fn default_lock_ttl_secs() -> u64 {
    20
}
fn default_lock_max_wait_secs() -> u64 {
    5
}
fn default_debounce_window_secs() -> u64 {
    5
}
fn default_worker_ttl_secs() -> u64 {
    60
}
fn default_worker_poll_cap_secs() -> u64 {
    5
}

/// Hybrid retrieval (C3) knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Candidates taken from each of the keyword/vector retrievers before fusion.
    #[serde(default = "default_candidate_pool_size")]
    pub candidate_pool_size: usize,
    /// Batch size for cross-encoder rerank scoring.
    #[serde(default = "default_rerank_batch_size")]
    pub rerank_batch_size: usize,
    /// Final number of chunks returned after rerank + healing.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Max candidate text length fed to the reranker.
    #[serde(default = "default_rerank_max_chars")]
    pub rerank_max_chars: usize,
    /// Whether the cross-encoder rerank stage is enabled; a model load
    /// failure at runtime forces this off for the process lifetime rather
    /// than failing requests (spec §4.3 "Model loading").
    #[serde(default = "default_true")]
    pub rerank_enabled: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            candidate_pool_size: default_candidate_pool_size(),
            rerank_batch_size: default_rerank_batch_size(),
            top_k: default_top_k(),
            rerank_max_chars: default_rerank_max_chars(),
            rerank_enabled: true,
        }
    }
}

fn default_candidate_pool_size() -> usize {
    100
}
fn default_rerank_batch_size() -> usize {
    16
}
fn default_top_k() -> usize {
    5
}
fn default_rerank_max_chars() -> usize {
    512
}
fn default_true() -> bool {
    true
}

/// AI Response Pipeline (C8) and Ticket Guard (C9) knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Default `history_limit` when an agent's `advanced_config` doesn't set one.
    #[serde(default = "default_history_limit")]
    pub default_history_limit: usize,
    /// Max LLM tool-loop turns before giving up (spec §4.8 step 8).
    #[serde(default = "default_tool_loop_max_turns")]
    pub tool_loop_max_turns: u32,
    /// Total timeout for a single LLM proxy HTTP call.
    #[serde(default = "default_llm_timeout_secs")]
    pub llm_timeout_secs: u64,
    /// Sliding-window suppression for repeated system-error apologies, per chat.
    #[serde(default = "default_alert_cooldown_secs")]
    pub alert_cooldown_secs: u64,
    /// Fixed per-token credit rate (see spec §9 ambiguity resolution).
    #[serde(default = "default_credit_rate_per_token")]
    pub credit_rate_per_token: f64,
    /// Max number of sticky images carried across the last two history turns.
    #[serde(default = "default_max_images")]
    pub max_images: usize,
    /// URL of the LLM proxy endpoint (§6 "LLM proxy").
    #[serde(default = "default_llm_proxy_url")]
    pub llm_proxy_url: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_history_limit: default_history_limit(),
            tool_loop_max_turns: default_tool_loop_max_turns(),
            llm_timeout_secs: default_llm_timeout_secs(),
            alert_cooldown_secs: default_alert_cooldown_secs(),
            credit_rate_per_token: default_credit_rate_per_token(),
            max_images: default_max_images(),
            llm_proxy_url: default_llm_proxy_url(),
        }
    }
}

fn default_history_limit() -> usize {
    5
}
fn default_tool_loop_max_turns() -> u32 {
    5
}
fn default_llm_timeout_secs() -> u64 {
    300
}
fn default_alert_cooldown_secs() -> u64 {
    15
}
fn default_credit_rate_per_token() -> f64 {
    0.000_002
}
fn default_max_images() -> usize {
    4
}
fn default_llm_proxy_url() -> String {
    "http://127.0.0.1:9100/v1/chat".into()
}

/// Outbound channel adapter endpoints (C4). Credential values themselves
/// (`x-api-key`, `X-Service-Key`) are read from environment at startup and
/// never stored here or logged.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub whatsapp: WhatsAppChannelConfig,
    #[serde(default)]
    pub telegram: TelegramChannelConfig,
    #[serde(default)]
    pub email: EmailChannelConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhatsAppChannelConfig {
    /// Base URL of the WhatsApp sender gateway; `sendMessage/{agent_id}` is appended.
    #[serde(default = "default_whatsapp_base_url")]
    pub base_url: String,
}

impl Default for WhatsAppChannelConfig {
    fn default() -> Self {
        Self { base_url: default_whatsapp_base_url() }
    }
}

fn default_whatsapp_base_url() -> String {
    "http://127.0.0.1:9200".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramChannelConfig {
    /// Base URL of the Telegram userbot worker.
    #[serde(default = "default_telegram_base_url")]
    pub base_url: String,
}

impl Default for TelegramChannelConfig {
    fn default() -> Self {
        Self { base_url: default_telegram_base_url() }
    }
}

fn default_telegram_base_url() -> String {
    "http://127.0.0.1:9300".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailChannelConfig {
    /// Webhook URL to deliver outbound email payloads to.
    #[serde(default = "default_email_webhook_url")]
    pub webhook_url: String,
}

impl Default for EmailChannelConfig {
    fn default() -> Self {
        Self { webhook_url: default_email_webhook_url() }
    }
}

fn default_email_webhook_url() -> String {
    "http://127.0.0.1:9400/webhook".into()
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// `pretty` for human-readable console output, `json` for structured logs.
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// `tracing_subscriber::EnvFilter` directive, e.g. `info` or `relaycx=debug,info`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { log_format: default_log_format(), log_level: default_log_level() }
    }
}

fn default_log_format() -> String {
    "pretty".into()
}
fn default_log_level() -> String {
    "info".into()
}

/// Storage backends for the state store (C2) and knowledge index (C3).
/// `qdrant_url`/embedding fields are `None` by default: the knowledge
/// index then runs keyword-only with rerank degraded off, per spec §4.3's
/// degrade-safe design rather than failing to start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_state_db_path")]
    pub state_db_path: String,
    #[serde(default = "default_knowledge_db_path")]
    pub knowledge_db_path: String,
    pub qdrant_url: Option<String>,
    pub embedding_base_url: Option<String>,
    pub embedding_api_key: Option<String>,
    pub embedding_model: Option<String>,
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: usize,
    pub reranker_url: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_db_path: default_state_db_path(),
            knowledge_db_path: default_knowledge_db_path(),
            qdrant_url: None,
            embedding_base_url: None,
            embedding_api_key: None,
            embedding_model: None,
            embedding_dimensions: default_embedding_dimensions(),
            reranker_url: None,
        }
    }
}

fn default_state_db_path() -> String {
    config_dir().join("state.db").to_string_lossy().into_owned()
}
fn default_knowledge_db_path() -> String {
    config_dir().join("knowledge.db").to_string_lossy().into_owned()
}
fn default_embedding_dimensions() -> usize {
    1536
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.router.debounce_window_secs, 5);
        assert_eq!(cfg.pipeline.credit_rate_per_token, 0.000_002);
    }

    #[test]
    fn env_override_applies() {
        std::env::set_var("RELAYCX_DEBOUNCE_WINDOW_SECS", "7");
        let mut cfg = AppConfig::default();
        cfg.apply_env_overrides();
        assert_eq!(cfg.router.debounce_window_secs, 7);
        std::env::remove_var("RELAYCX_DEBOUNCE_WINDOW_SECS");
    }

    #[test]
    fn rejects_zero_max_wait() {
        let mut cfg = AppConfig::default();
        cfg.router.lock_max_wait_secs = 0;
        assert!(cfg.validate().is_err());
    }
}
