use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::errors::CoreError;

// ============================================================
// Typed Configuration
// ============================================================
//
// Load order:
//   1. Built-in defaults
//   2. Optional JSON file at $FINGATE_CONFIG (unknown keys rejected)
//   3. Environment variable overrides (connection endpoints only)
// ============================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Redis-compatible store with vector search (RediSearch).
    pub redis_url: String,
    /// "redis" or "memory". Memory is an in-process fallback for dev/tests.
    pub store_backend: String,
    pub listen_addr: String,
    pub llm: LlmConfig,
    pub semantic_cache: SemanticCacheConfig,
    pub router_cache: RouterCacheConfig,
    pub tool_cache: ToolCacheConfig,
    pub memory: MemoryConfig,
    pub dispatcher: DispatcherConfig,
    pub orchestration: OrchestrationConfig,
    pub targets: TargetConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LlmConfig {
    /// OpenAI-compatible base URL (chat + embeddings).
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub chat_model: String,
    pub embedding_model: String,
    /// Market-data HTTP service backing the quote/news/fundamentals tools.
    pub market_data_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SemanticCacheConfig {
    pub similarity_threshold: f32,
    pub ttl_seconds: u64,
    /// Must match the embedding provider's output dimension.
    pub embedding_dim: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RouterCacheConfig {
    pub similarity_threshold: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ToolCacheConfig {
    pub default_ttl_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MemoryConfig {
    pub max_turns_per_user: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DispatcherConfig {
    pub request_deadline_ms: u64,
    pub concurrency_cap: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct OrchestrationConfig {
    pub agent_timeout_ms: u64,
    pub concurrent_cap_ms: u64,
    pub handoff_max_hops: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TargetConfig {
    pub latency_ms: u64,
    pub cost_usd: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            store_backend: "redis".to_string(),
            listen_addr: "0.0.0.0:3000".to_string(),
            llm: LlmConfig::default(),
            semantic_cache: SemanticCacheConfig::default(),
            router_cache: RouterCacheConfig::default(),
            tool_cache: ToolCacheConfig::default(),
            memory: MemoryConfig::default(),
            dispatcher: DispatcherConfig::default(),
            orchestration: OrchestrationConfig::default(),
            targets: TargetConfig::default(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/v1".to_string(),
            api_key: None,
            chat_model: "gpt-4o-mini".to_string(),
            embedding_model: "text-embedding-3-large".to_string(),
            market_data_url: "http://localhost:8100".to_string(),
        }
    }
}

impl Default for SemanticCacheConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.92,
            ttl_seconds: 3600,
            embedding_dim: 3072,
        }
    }
}

impl Default for RouterCacheConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.90,
        }
    }
}

impl Default for ToolCacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 300,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_turns_per_user: 50,
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            request_deadline_ms: 60_000,
            concurrency_cap: 128,
        }
    }
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            agent_timeout_ms: 20_000,
            concurrent_cap_ms: 45_000,
            handoff_max_hops: 6,
        }
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            latency_ms: 2000,
            cost_usd: 0.02,
        }
    }
}

impl Config {
    /// Load config: defaults, then optional $FINGATE_CONFIG file, then env.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var("FINGATE_CONFIG") {
            Ok(path) => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("could not read config file {}", path))?;
                serde_json::from_str::<Config>(&raw)
                    .with_context(|| format!("invalid config file {}", path))?
            }
            Err(_) => Config::default(),
        };
        config.apply_env();
        config.validate().map_err(|e| anyhow::anyhow!(e))?;
        Ok(config)
    }

    /// Connection endpoints come from the environment when present.
    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("REDIS_URL") {
            self.redis_url = url;
        }
        if let Ok(backend) = std::env::var("STORE_BACKEND") {
            self.store_backend = backend;
        }
        if let Ok(addr) = std::env::var("LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Ok(url) = std::env::var("LLM_BASE_URL") {
            self.llm.base_url = url;
        }
        if let Ok(key) = std::env::var("LLM_API_KEY") {
            self.llm.api_key = Some(key);
        }
        if let Ok(model) = std::env::var("LLM_CHAT_MODEL") {
            self.llm.chat_model = model;
        }
        if let Ok(model) = std::env::var("LLM_EMBEDDING_MODEL") {
            self.llm.embedding_model = model;
        }
        if let Ok(url) = std::env::var("MARKET_DATA_URL") {
            self.llm.market_data_url = url;
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        let in_unit = |v: f32| (0.0..=1.0).contains(&v);
        if !in_unit(self.semantic_cache.similarity_threshold) {
            return Err(CoreError::InvalidRequest(format!(
                "semantic_cache.similarity_threshold {} outside [0,1]",
                self.semantic_cache.similarity_threshold
            )));
        }
        if !in_unit(self.router_cache.similarity_threshold) {
            return Err(CoreError::InvalidRequest(format!(
                "router_cache.similarity_threshold {} outside [0,1]",
                self.router_cache.similarity_threshold
            )));
        }
        if self.semantic_cache.embedding_dim == 0 {
            return Err(CoreError::InvalidRequest(
                "semantic_cache.embedding_dim must be positive".to_string(),
            ));
        }
        if self.dispatcher.concurrency_cap == 0 {
            return Err(CoreError::InvalidRequest(
                "dispatcher.concurrency_cap must be positive".to_string(),
            ));
        }
        match self.store_backend.as_str() {
            "redis" | "memory" => {}
            other => {
                return Err(CoreError::InvalidRequest(format!(
                    "store_backend '{}' is not one of redis, memory",
                    other
                )))
            }
        }
        Ok(())
    }
}
