use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::errors::CoreError;

// ============================================================
// Core Domain Models
// ============================================================

/// Incoming query from a client.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct QueryRequest {
    pub query: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticker: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub params: HashMap<String, serde_json::Value>,
}

/// Queries above this size are rejected outright.
pub const MAX_QUERY_BYTES: usize = 8 * 1024;

impl QueryRequest {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.query.trim().is_empty() {
            return Err(CoreError::InvalidRequest("query must not be empty".into()));
        }
        if self.query.len() > MAX_QUERY_BYTES {
            return Err(CoreError::InvalidRequest(format!(
                "query exceeds {} bytes",
                MAX_QUERY_BYTES
            )));
        }
        if self.user_id.trim().is_empty() {
            return Err(CoreError::InvalidRequest("user_id must not be empty".into()));
        }
        Ok(())
    }
}

/// Message on the LLM wire (chat completion input).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChatMessage {
    pub role: String, // "system", "user", "assistant"
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

// ============================================================
// User Memory
// ============================================================

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

/// One exchange half in a user's conversation tail.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ConversationTurn {
    pub timestamp: DateTime<Utc>,
    pub role: TurnRole,
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RiskTolerance {
    Conservative,
    Moderate,
    Aggressive,
}

/// A single portfolio position.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Position {
    pub ticker: String,
    pub shares: f64,
    pub avg_cost: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UserProfile {
    pub user_id: String,
    #[serde(default)]
    pub preferences: HashMap<String, serde_json::Value>,
    pub risk_tolerance: RiskTolerance,
    #[serde(default)]
    pub portfolio: Vec<Position>,
    #[serde(default)]
    pub watchlist: BTreeSet<String>,
}

impl UserProfile {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            preferences: HashMap::new(),
            risk_tolerance: RiskTolerance::Moderate,
            portfolio: Vec::new(),
            watchlist: BTreeSet::new(),
        }
    }

    /// Positions must never carry negative shares and priced lots need a
    /// positive average cost.
    pub fn check_invariants(&self) -> Result<(), CoreError> {
        for pos in &self.portfolio {
            if pos.shares < 0.0 {
                return Err(CoreError::InvalidRequest(format!(
                    "negative shares for {}",
                    pos.ticker
                )));
            }
            if pos.shares > 0.0 && pos.avg_cost <= 0.0 {
                return Err(CoreError::InvalidRequest(format!(
                    "non-positive avg_cost for {}",
                    pos.ticker
                )));
            }
        }
        Ok(())
    }
}

/// Everything an agent sees about the requesting user.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UserContext {
    pub profile: UserProfile,
    pub recent_turns: Vec<ConversationTurn>,
}

/// One portfolio mutation: positive delta buys, negative sells.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PortfolioDelta {
    pub ticker: String,
    pub delta_shares: f64,
    pub price: f64,
}

// ============================================================
// Workflows
// ============================================================

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrchestrationPattern {
    Sequential,
    Concurrent,
    Handoff,
}

impl std::fmt::Display for OrchestrationPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrchestrationPattern::Sequential => write!(f, "sequential"),
            OrchestrationPattern::Concurrent => write!(f, "concurrent"),
            OrchestrationPattern::Handoff => write!(f, "handoff"),
        }
    }
}

fn default_true() -> bool {
    true
}

/// One agent task inside a workflow.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AgentTaskSpec {
    pub agent_id: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub inputs: HashMap<String, serde_json::Value>,
    pub outputs_key: String,
    /// A failing required task terminates the workflow.
    #[serde(default = "default_true")]
    pub required: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Workflow {
    pub name: String,
    pub pattern: OrchestrationPattern,
    pub tasks: Vec<AgentTaskSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synthesis: Option<String>,
    pub baseline_cost_usd: f64,
    #[serde(default)]
    pub route_patterns: Vec<String>,
}

impl Workflow {
    /// Structural invariants: unique task ids, dependency edges resolve,
    /// the dependency graph is a DAG, concurrent tasks carry no edges,
    /// handoff declares an entry agent (the first task).
    pub fn validate(&self) -> Result<(), CoreError> {
        let mut ids = HashSet::new();
        for task in &self.tasks {
            if !ids.insert(task.agent_id.as_str()) {
                return Err(CoreError::InvalidRequest(format!(
                    "workflow '{}' repeats task '{}'",
                    self.name, task.agent_id
                )));
            }
        }
        for task in &self.tasks {
            for dep in &task.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(CoreError::InvalidRequest(format!(
                        "workflow '{}' task '{}' depends on unknown '{}'",
                        self.name, task.agent_id, dep
                    )));
                }
            }
        }
        if self.has_cycle() {
            return Err(CoreError::InvalidRequest(format!(
                "workflow '{}' dependency graph has a cycle",
                self.name
            )));
        }
        match self.pattern {
            OrchestrationPattern::Concurrent => {
                if self.tasks.iter().any(|t| !t.depends_on.is_empty()) {
                    return Err(CoreError::InvalidRequest(format!(
                        "concurrent workflow '{}' must not declare depends_on edges",
                        self.name
                    )));
                }
            }
            OrchestrationPattern::Handoff => {
                if self.tasks.is_empty() {
                    return Err(CoreError::InvalidRequest(format!(
                        "handoff workflow '{}' needs an entry agent",
                        self.name
                    )));
                }
            }
            OrchestrationPattern::Sequential => {}
        }
        Ok(())
    }

    fn has_cycle(&self) -> bool {
        // Kahn's algorithm over depends_on edges.
        let mut indegree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for task in &self.tasks {
            indegree.entry(task.agent_id.as_str()).or_insert(0);
            for dep in &task.depends_on {
                *indegree.entry(task.agent_id.as_str()).or_insert(0) += 1;
                dependents
                    .entry(dep.as_str())
                    .or_default()
                    .push(task.agent_id.as_str());
            }
        }
        let mut queue: Vec<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0usize;
        while let Some(id) = queue.pop() {
            visited += 1;
            if let Some(children) = dependents.get(id) {
                for child in children {
                    let d = indegree.get_mut(child).expect("child counted");
                    *d -= 1;
                    if *d == 0 {
                        queue.push(child);
                    }
                }
            }
        }
        visited != self.tasks.len()
    }
}

// ============================================================
// Agent Output
// ============================================================

/// Dynamic routing directive emitted by a handoff entry agent.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum HandoffDirective {
    Next { next_agent: String },
    Done { done: bool },
}

impl HandoffDirective {
    pub fn is_done(&self) -> bool {
        matches!(self, HandoffDirective::Done { done: true })
    }
}

/// Typed payloads agents can return alongside free text.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StructuredPayload {
    MarketQuote {
        ticker: String,
        price: f64,
        change_percent: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        volume: Option<u64>,
        #[serde(default)]
        synthetic: bool,
    },
    SentimentScore {
        #[serde(skip_serializing_if = "Option::is_none")]
        ticker: Option<String>,
        score: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        headline_count: Option<u64>,
    },
    RiskReport {
        risk_level: String,
        factors: Vec<String>,
    },
    Handoff(HandoffDirective),
    FreeText {
        text: String,
    },
}

/// Token usage as surfaced by the provider, when it is.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// What an agent invocation produced.
#[derive(Debug, Clone, Default)]
pub struct AgentOutput {
    pub text: String,
    pub structured: Option<StructuredPayload>,
    pub raw_token_usage: Option<TokenUsage>,
    /// Tool calls the agent performed, for the execution record.
    pub tools: Vec<ToolInvocation>,
}

// ============================================================
// Execution Records & Metrics
// ============================================================

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Success,
    Error,
    Timeout,
}

/// One tool call made by an agent.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ToolInvocation {
    pub tool_name: String,
    pub parameters: serde_json::Value,
    pub duration_ms: f64,
    pub cache_hit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,
    pub result_size_bytes: u64,
    pub status: String, // "success" | "error"
}

/// Full record of one agent invocation.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AgentExecutionRecord {
    pub agent_id: String,
    pub started_at: i64, // unix ms
    pub ended_at: i64,
    pub status: AgentStatus,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub model: String,
    #[serde(default)]
    pub tools: Vec<ToolInvocation>,
    pub cost_usd: f64,
    pub response_preview: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Outcome of one cache layer for one request.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CacheLayerMetrics {
    pub name: String, // "semantic" | "router" | "tool"
    pub checked: bool,
    pub hit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,
    pub query_time_ms: f64,
    pub cost_saved_usd: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_query: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Active,
    Success,
    Error,
    Warning,
    Unknown,
}

/// One interval in the request timeline. Events nest by interval.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TimelineEvent {
    pub id: u64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub name: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub duration_ms: f64,
    pub status: EventStatus,
    #[serde(skip_serializing_if = "serde_json::Value::is_null", default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct CostBreakdown {
    pub total_cost_usd: f64,
    pub llm_cost_usd: f64,
    pub embedding_cost_usd: f64,
    pub baseline_cost_usd: f64,
    pub cost_savings_usd: f64,
    pub cost_savings_percent: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PerformanceMetrics {
    pub total_time_ms: f64,
    pub routing_time_ms: f64,
    pub meets_latency_target: bool,
    pub meets_cost_target: bool,
    pub latency_target_ms: u64,
    pub cost_target_usd: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SessionMetrics {
    pub session_id: String,
    pub user_id: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WorkflowSummary {
    pub name: String,
    pub pattern: String,
    pub routing_time_ms: f64,
    pub routing_source: String, // "vector" | "pattern" | "fallback" | "cache"
    pub agents_invoked: usize,
    pub agents_available: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Timeline {
    pub total_duration_ms: f64,
    pub events: Vec<TimelineEvent>,
}

/// The full instrumented answer.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EnhancedResponse {
    pub query: String,
    pub response: String,
    pub query_id: String,
    pub timestamp: DateTime<Utc>,
    pub workflow: WorkflowSummary,
    pub agents: Vec<AgentExecutionRecord>,
    pub cache_layers: Vec<CacheLayerMetrics>,
    pub overall_cache_hit: bool,
    pub cost: CostBreakdown,
    pub performance: PerformanceMetrics,
    pub session: SessionMetrics,
    pub timeline: Timeline,
}

/// Trimmed response for the legacy endpoint.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LegacyResponse {
    pub query: String,
    pub response: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_name: Option<String>,
    pub agents_used: Vec<String>,
    pub cache_hit: bool,
    pub processing_time_ms: f64,
    pub metadata: serde_json::Value,
}

impl LegacyResponse {
    pub fn from_enhanced(full: &EnhancedResponse) -> Self {
        Self {
            query: full.query.clone(),
            response: full.response.clone(),
            workflow_name: if full.workflow.name.is_empty() {
                None
            } else {
                Some(full.workflow.name.clone())
            },
            agents_used: full.agents.iter().map(|a| a.agent_id.clone()).collect(),
            cache_hit: full.overall_cache_hit,
            processing_time_ms: full.performance.total_time_ms,
            metadata: serde_json::json!({
                "query_id": full.query_id,
                "routing_source": full.workflow.routing_source,
                "total_cost_usd": full.cost.total_cost_usd,
            }),
        }
    }
}

// ============================================================
// Tests
// ============================================================
