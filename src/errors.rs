use serde::{Deserialize, Serialize};

// ============================================================
// Error Taxonomy
// ============================================================
//
// Domain errors are typed; infrastructure plumbing stays on
// anyhow at the edges (config load, startup). Agent-level
// faults are captured into execution records and never pass
// through here unless the agent is required.
// ============================================================

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Malformed client input. Maps to 400; no side effects occurred.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The vector store is unreachable or timed out. Cache layers degrade
    /// to misses; the dispatcher continues.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// An index already exists with an incompatible schema.
    #[error("index schema conflict for '{0}'")]
    IndexSchemaConflict(String),

    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// The LLM or embedding provider failed.
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("agent '{agent_id}' timed out after {timeout_ms}ms")]
    AgentTimeout { agent_id: String, timeout_ms: u64 },

    #[error("agent '{agent_id}' failed: {message}")]
    AgentError { agent_id: String, message: String },

    #[error("orchestration exceeded {0}ms cap")]
    OrchestrationTimeout(u64),

    #[error("unknown workflow '{0}'")]
    UnknownWorkflow(String),

    /// Pending-request count exceeded the concurrency cap.
    #[error("overloaded: concurrency cap reached")]
    Overloaded,

    /// The per-request deadline elapsed.
    #[error("request deadline of {0}ms exceeded")]
    DeadlineExceeded(u64),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    /// Stable machine-readable code for the structured error body.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::InvalidRequest(_) => "invalid_request",
            CoreError::StoreUnavailable(_) => "store_unavailable",
            CoreError::IndexSchemaConflict(_) => "index_schema_conflict",
            CoreError::KeyNotFound(_) => "key_not_found",
            CoreError::ProviderUnavailable(_) => "provider_unavailable",
            CoreError::AgentTimeout { .. } => "agent_timeout",
            CoreError::AgentError { .. } => "agent_error",
            CoreError::OrchestrationTimeout(_) => "orchestration_timeout",
            CoreError::UnknownWorkflow(_) => "unknown_workflow",
            CoreError::Overloaded => "overloaded",
            CoreError::DeadlineExceeded(_) => "deadline_exceeded",
            CoreError::Internal(_) => "internal",
        }
    }
}

impl From<redis::RedisError> for CoreError {
    fn from(e: redis::RedisError) -> Self {
        CoreError::StoreUnavailable(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Internal(anyhow::anyhow!("serialization failed: {}", e))
    }
}

/// Structured failure object returned to callers so they can correlate
/// against logs. `partial_metrics` carries whatever the collector had
/// recorded before the failure.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial_metrics: Option<serde_json::Value>,
}

impl ErrorBody {
    pub fn new(err: &CoreError, query_id: Option<String>) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            query_id,
            partial_metrics: None,
        }
    }

    pub fn with_partial_metrics(mut self, metrics: serde_json::Value) -> Self {
        self.partial_metrics = Some(metrics);
        self
    }
}
