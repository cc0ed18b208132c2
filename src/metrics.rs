use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::errors::CoreError;
use crate::models::{
    AgentExecutionRecord, CacheLayerMetrics, CostBreakdown, EnhancedResponse, EventStatus,
    PerformanceMetrics, SessionMetrics, Timeline, TimelineEvent, ToolInvocation, WorkflowSummary,
};

// ============================================================
// Metrics Collector
// ============================================================
//
// Request-scoped. The dispatcher owns it; orchestration
// sub-tasks record through the thread-safe append-only
// interface. get_summary is deterministic: agents in invocation
// order, cache layers semantic/router/tool, events by start
// time with ties broken by id.
// ============================================================

struct EventFrame {
    id: u64,
    event_type: String,
    name: String,
    start_ms: i64,
    start_offset: std::time::Duration,
    end_ms: Option<i64>,
    duration_ms: f64,
    status: EventStatus,
    metadata: serde_json::Value,
}

#[derive(Default)]
struct CollectorInner {
    next_event_id: u64,
    events: Vec<EventFrame>,
    agents: Vec<AgentExecutionRecord>,
    cache_layers: Vec<CacheLayerMetrics>,
    tool_invocations: Vec<ToolInvocation>,
    embedding_cost_usd: f64,
    embedding_tokens: u64,
    store_errors: u64,
}

pub struct MetricsCollector {
    query_id: String,
    session_id: String,
    user_id: String,
    started: Instant,
    started_at_ms: i64,
    inner: Mutex<CollectorInner>,
}

/// Everything the collector cannot know by itself at finalize time.
pub struct SummaryArgs {
    pub query: String,
    pub response: String,
    pub workflow_name: String,
    pub workflow_pattern: String,
    pub routing_source: String,
    pub routing_time_ms: f64,
    pub agents_available: usize,
    pub overall_cache_hit: bool,
    pub baseline_cost_usd: f64,
    pub latency_target_ms: u64,
    pub cost_target_usd: f64,
}

impl MetricsCollector {
    pub fn new(
        query_id: impl Into<String>,
        session_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            query_id: query_id.into(),
            session_id: session_id.into(),
            user_id: user_id.into(),
            started: Instant::now(),
            started_at_ms: Utc::now().timestamp_millis(),
            inner: Mutex::new(CollectorInner::default()),
        }
    }

    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    fn now_pair(&self) -> (i64, std::time::Duration) {
        let offset = self.started.elapsed();
        (self.started_at_ms + offset.as_millis() as i64, offset)
    }

    /// Push an event frame; returns its id for end_event.
    pub fn start_event(
        &self,
        event_type: &str,
        name: &str,
        metadata: Option<serde_json::Value>,
    ) -> u64 {
        let (start_ms, start_offset) = self.now_pair();
        let mut inner = self.inner.lock().expect("collector lock");
        inner.next_event_id += 1;
        let id = inner.next_event_id;
        inner.events.push(EventFrame {
            id,
            event_type: event_type.to_string(),
            name: name.to_string(),
            start_ms,
            start_offset,
            end_ms: None,
            duration_ms: 0.0,
            status: EventStatus::Active,
            metadata: metadata.unwrap_or(serde_json::Value::Null),
        });
        id
    }

    /// Close an event. Closing an id that was never opened is an error.
    pub fn end_event(
        &self,
        event_id: u64,
        status: EventStatus,
        metadata: Option<serde_json::Value>,
    ) -> Result<(), CoreError> {
        let (end_ms, end_offset) = self.now_pair();
        let mut inner = self.inner.lock().expect("collector lock");
        let frame = inner
            .events
            .iter_mut()
            .find(|f| f.id == event_id)
            .ok_or_else(|| {
                CoreError::Internal(anyhow::anyhow!("closing unknown event {}", event_id))
            })?;
        if frame.end_ms.is_some() {
            return Err(CoreError::Internal(anyhow::anyhow!(
                "event {} already closed",
                event_id
            )));
        }
        frame.end_ms = Some(end_ms);
        frame.duration_ms = (end_offset - frame.start_offset).as_secs_f64() * 1000.0;
        frame.status = status;
        if let Some(extra) = metadata {
            frame.metadata = merge_metadata(std::mem::take(&mut frame.metadata), extra);
        }
        Ok(())
    }

    /// Instantaneous event, mostly for warnings and degradations.
    pub fn record_event(
        &self,
        event_type: &str,
        name: &str,
        status: EventStatus,
        metadata: Option<serde_json::Value>,
    ) {
        let id = self.start_event(event_type, name, metadata);
        let _ = self.end_event(id, status, None);
    }

    pub fn record_agent_execution(&self, record: AgentExecutionRecord) {
        let mut inner = self.inner.lock().expect("collector lock");
        for invocation in &record.tools {
            inner.tool_invocations.push(invocation.clone());
        }
        inner.agents.push(record);
    }

    pub fn record_cache_check(&self, layer: CacheLayerMetrics) {
        let mut inner = self.inner.lock().expect("collector lock");
        inner.cache_layers.push(layer);
    }

    pub fn record_tool_invocation(&self, invocation: ToolInvocation) {
        let mut inner = self.inner.lock().expect("collector lock");
        inner.tool_invocations.push(invocation);
    }

    pub fn record_embedding(&self, tokens: u64, cost_usd: f64) {
        let mut inner = self.inner.lock().expect("collector lock");
        inner.embedding_tokens += tokens;
        inner.embedding_cost_usd += cost_usd;
    }

    pub fn record_store_error(&self) {
        let mut inner = self.inner.lock().expect("collector lock");
        inner.store_errors += 1;
    }

    pub fn agents_invoked(&self) -> usize {
        self.inner.lock().expect("collector lock").agents.len()
    }

    /// Deterministic serialization of everything recorded so far.
    pub fn get_summary(&self, args: SummaryArgs) -> EnhancedResponse {
        let total_time_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        let (now_ms, now_offset) = self.now_pair();
        let mut inner = self.inner.lock().expect("collector lock");

        // Unclosed events close as unknown with duration now - start.
        for frame in inner.events.iter_mut() {
            if frame.end_ms.is_none() {
                frame.end_ms = Some(now_ms);
                frame.duration_ms = (now_offset - frame.start_offset).as_secs_f64() * 1000.0;
                frame.status = EventStatus::Unknown;
            }
        }

        let mut events: Vec<TimelineEvent> = inner
            .events
            .iter()
            .map(|f| TimelineEvent {
                id: f.id,
                event_type: f.event_type.clone(),
                name: f.name.clone(),
                start_ms: f.start_ms,
                end_ms: f.end_ms.unwrap_or(f.start_ms),
                duration_ms: f.duration_ms,
                status: f.status,
                metadata: f.metadata.clone(),
            })
            .collect();
        events.sort_by(|a, b| a.start_ms.cmp(&b.start_ms).then(a.id.cmp(&b.id)));

        let cache_layers = ordered_cache_layers(&inner);
        // Invariant: overall hit iff at least one layer hit.
        let overall_cache_hit = args.overall_cache_hit || cache_layers.iter().any(|l| l.hit);

        let llm_cost_usd: f64 = inner.agents.iter().map(|a| a.cost_usd).sum();
        let total_cost_usd = llm_cost_usd + inner.embedding_cost_usd;
        let cost_savings_usd = (args.baseline_cost_usd - total_cost_usd).max(0.0);
        let cost_savings_percent = if args.baseline_cost_usd > 0.0 {
            (100.0 * cost_savings_usd / args.baseline_cost_usd).round()
        } else {
            0.0
        };

        EnhancedResponse {
            query: args.query,
            response: args.response,
            query_id: self.query_id.clone(),
            timestamp: Utc::now(),
            workflow: WorkflowSummary {
                name: args.workflow_name,
                pattern: args.workflow_pattern,
                routing_time_ms: args.routing_time_ms,
                routing_source: args.routing_source,
                agents_invoked: inner.agents.len(),
                agents_available: args.agents_available,
            },
            agents: inner.agents.clone(),
            cache_layers,
            overall_cache_hit,
            cost: CostBreakdown {
                total_cost_usd,
                llm_cost_usd,
                embedding_cost_usd: inner.embedding_cost_usd,
                baseline_cost_usd: args.baseline_cost_usd,
                cost_savings_usd,
                cost_savings_percent,
            },
            performance: PerformanceMetrics {
                total_time_ms,
                routing_time_ms: args.routing_time_ms,
                meets_latency_target: total_time_ms <= args.latency_target_ms as f64,
                meets_cost_target: total_cost_usd <= args.cost_target_usd,
                latency_target_ms: args.latency_target_ms,
                cost_target_usd: args.cost_target_usd,
            },
            session: SessionMetrics {
                session_id: self.session_id.clone(),
                user_id: self.user_id.clone(),
            },
            timeline: Timeline {
                total_duration_ms: total_time_ms,
                events,
            },
        }
    }
}

fn merge_metadata(base: serde_json::Value, extra: serde_json::Value) -> serde_json::Value {
    match (base, extra) {
        (serde_json::Value::Object(mut a), serde_json::Value::Object(b)) => {
            for (k, v) in b {
                a.insert(k, v);
            }
            serde_json::Value::Object(a)
        }
        (serde_json::Value::Null, extra) => extra,
        (base, serde_json::Value::Null) => base,
        (_, extra) => extra,
    }
}

/// Fixed layer order: semantic, router, tool. Unchecked layers appear
/// with checked=false; the tool line aggregates individual invocations.
fn ordered_cache_layers(inner: &CollectorInner) -> Vec<CacheLayerMetrics> {
    let mut layers = Vec::with_capacity(3);
    for name in ["semantic", "router"] {
        match inner.cache_layers.iter().find(|l| l.name == name) {
            Some(layer) => layers.push(layer.clone()),
            None => layers.push(CacheLayerMetrics {
                name: name.to_string(),
                checked: false,
                hit: false,
                similarity: None,
                query_time_ms: 0.0,
                cost_saved_usd: 0.0,
                matched_query: None,
            }),
        }
    }

    let checked = !inner.tool_invocations.is_empty();
    let hit = inner.tool_invocations.iter().any(|t| t.cache_hit);
    layers.push(CacheLayerMetrics {
        name: "tool".to_string(),
        checked,
        hit,
        similarity: None,
        query_time_ms: inner
            .tool_invocations
            .iter()
            .filter(|t| t.cache_hit)
            .map(|t| t.duration_ms)
            .sum(),
        cost_saved_usd: 0.0,
        matched_query: None,
    });
    layers
}

// ============================================================
// Process-Wide Counters
// ============================================================
//
// Updated once per request at finalize; read by the /metrics
// endpoints. Soft state like everything else here.
// ============================================================

pub struct ProcessMetrics {
    started: Instant,
    queries: AtomicU64,
    cache_hits: AtomicU64,
    semantic_checked: AtomicU64,
    semantic_hits: AtomicU64,
    router_checked: AtomicU64,
    router_hits: AtomicU64,
    tool_checked: AtomicU64,
    tool_hits: AtomicU64,
    /// Micro-USD so atomics suffice.
    total_cost_micro: AtomicU64,
    saved_cost_micro: AtomicU64,
    latency_ms_sum: AtomicU64,
    latency_ms_max: AtomicU64,
    latency_target_met: AtomicU64,
    store_errors: AtomicU64,
    provider_errors: AtomicU64,
}

impl ProcessMetrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            queries: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            semantic_checked: AtomicU64::new(0),
            semantic_hits: AtomicU64::new(0),
            router_checked: AtomicU64::new(0),
            router_hits: AtomicU64::new(0),
            tool_checked: AtomicU64::new(0),
            tool_hits: AtomicU64::new(0),
            total_cost_micro: AtomicU64::new(0),
            saved_cost_micro: AtomicU64::new(0),
            latency_ms_sum: AtomicU64::new(0),
            latency_ms_max: AtomicU64::new(0),
            latency_target_met: AtomicU64::new(0),
            store_errors: AtomicU64::new(0),
            provider_errors: AtomicU64::new(0),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn record_store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_provider_error(&self) {
        self.provider_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold one finished request into the counters.
    pub fn observe(&self, response: &EnhancedResponse) {
        self.queries.fetch_add(1, Ordering::Relaxed);
        if response.overall_cache_hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
        for layer in &response.cache_layers {
            let (checked, hits) = match layer.name.as_str() {
                "semantic" => (&self.semantic_checked, &self.semantic_hits),
                "router" => (&self.router_checked, &self.router_hits),
                "tool" => (&self.tool_checked, &self.tool_hits),
                _ => continue,
            };
            if layer.checked {
                checked.fetch_add(1, Ordering::Relaxed);
            }
            if layer.hit {
                hits.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.total_cost_micro.fetch_add(
            (response.cost.total_cost_usd * 1e6) as u64,
            Ordering::Relaxed,
        );
        self.saved_cost_micro.fetch_add(
            (response.cost.cost_savings_usd * 1e6) as u64,
            Ordering::Relaxed,
        );
        let latency = response.performance.total_time_ms as u64;
        self.latency_ms_sum.fetch_add(latency, Ordering::Relaxed);
        self.latency_ms_max.fetch_max(latency, Ordering::Relaxed);
        if response.performance.meets_latency_target {
            self.latency_target_met.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn cache_snapshot(&self) -> serde_json::Value {
        let queries = self.queries.load(Ordering::Relaxed);
        let hits = self.cache_hits.load(Ordering::Relaxed);
        serde_json::json!({
            "queries": queries,
            "overall_hits": hits,
            "overall_hit_rate": rate(hits, queries),
            "layers": {
                "semantic": layer_snapshot(&self.semantic_checked, &self.semantic_hits),
                "router": layer_snapshot(&self.router_checked, &self.router_hits),
                "tool": layer_snapshot(&self.tool_checked, &self.tool_hits),
            },
            "cost_saved_usd": self.saved_cost_micro.load(Ordering::Relaxed) as f64 / 1e6,
        })
    }

    pub fn performance_snapshot(&self) -> serde_json::Value {
        let queries = self.queries.load(Ordering::Relaxed);
        let sum = self.latency_ms_sum.load(Ordering::Relaxed);
        serde_json::json!({
            "queries": queries,
            "average_latency_ms": if queries > 0 { sum as f64 / queries as f64 } else { 0.0 },
            "max_latency_ms": self.latency_ms_max.load(Ordering::Relaxed),
            "latency_target_rate": rate(self.latency_target_met.load(Ordering::Relaxed), queries),
            "total_cost_usd": self.total_cost_micro.load(Ordering::Relaxed) as f64 / 1e6,
            "store_errors": self.store_errors.load(Ordering::Relaxed),
            "provider_errors": self.provider_errors.load(Ordering::Relaxed),
        })
    }

    pub fn summary_snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "uptime_seconds": self.uptime_seconds(),
            "cache": self.cache_snapshot(),
            "performance": self.performance_snapshot(),
        })
    }
}

impl Default for ProcessMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn rate(hits: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

fn layer_snapshot(checked: &AtomicU64, hits: &AtomicU64) -> serde_json::Value {
    let checked = checked.load(Ordering::Relaxed);
    let hits = hits.load(Ordering::Relaxed);
    serde_json::json!({
        "checked": checked,
        "hits": hits,
        "hit_rate": rate(hits, checked),
    })
}

// ============================================================
// Tests
// ============================================================
