use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::agents::{AgentContext, AgentFactory, ToolSet};
use crate::config::Config;
use crate::errors::CoreError;
use crate::llm::{stable_hash, EmbeddingService, HttpLlmClient, LlmClient};
use crate::memory::MemoryService;
use crate::metrics::{MetricsCollector, ProcessMetrics, SummaryArgs};
use crate::models::{
    CacheLayerMetrics, EnhancedResponse, EventStatus, QueryRequest, TurnRole,
};
use crate::orchestrator::Orchestrator;
use crate::pricing;
use crate::routing::{QueryRouter, RouteSource};
use crate::semantic_cache::SemanticCache;
use crate::tool_cache::ToolCache;
use crate::tools::{
    DocumentSearchTool, FundamentalsTool, MarketDataClient, MarketQuoteTool, NewsSearchTool,
    ToolRunner, DOCS_INDEX, DOCS_PREFIX,
};
use crate::vector::{IndexSchema, MemoryVectorStore, RedisVectorStore, VectorStore};
use crate::workflows::WorkflowRegistry;

// ============================================================
// Dispatcher
// ============================================================
//
// CoreServices is the explicit context everything hangs off:
// no process-wide mutable state. handle() is the end-to-end
// flow: cache -> memory -> route -> execute -> synthesize ->
// cache-back, all instrumented.
// ============================================================

pub struct CoreServices {
    pub config: Config,
    pub store: Arc<dyn VectorStore>,
    pub embedder: Arc<EmbeddingService>,
    pub semantic_cache: Arc<SemanticCache>,
    pub router: Arc<QueryRouter>,
    pub memory: Arc<MemoryService>,
    pub registry: Arc<WorkflowRegistry>,
    pub orchestrator: Orchestrator,
    pub process_metrics: Arc<ProcessMetrics>,
    limiter: Arc<Semaphore>,
}

/// A failed dispatch, with enough context for the caller to correlate
/// against logs.
#[derive(Debug)]
pub struct DispatchFailure {
    pub error: CoreError,
    pub query_id: Option<String>,
    pub partial_metrics: Option<serde_json::Value>,
}

impl DispatchFailure {
    fn bare(error: CoreError) -> Self {
        Self {
            error,
            query_id: None,
            partial_metrics: None,
        }
    }
}

/// One-hour session windows.
fn session_id(user_id: &str) -> String {
    let hour_bucket = chrono::Utc::now().timestamp() / 3600;
    stable_hash(&format!("{}:{}", user_id, hour_bucket))
}

fn docs_schema(dim: usize) -> IndexSchema {
    IndexSchema {
        name: DOCS_INDEX.to_string(),
        prefix: DOCS_PREFIX.to_string(),
        dim,
        text_fields: vec!["content".to_string()],
        tag_fields: vec!["ticker".to_string()],
        numeric_fields: vec!["created_at".to_string()],
    }
}

impl CoreServices {
    /// Production init: connect the store (falling back to the in-process
    /// backend when Redis is unreachable), build the provider client, wire
    /// everything together.
    pub async fn init(config: Config) -> anyhow::Result<Arc<Self>> {
        config.validate()?;

        let store: Arc<dyn VectorStore> = if config.store_backend == "memory" {
            tracing::info!("using in-memory vector store");
            Arc::new(MemoryVectorStore::new())
        } else {
            match Self::connect_redis(&config.redis_url).await {
                Ok(conn) => {
                    tracing::info!("connected to vector store at {}", config.redis_url);
                    Arc::new(RedisVectorStore::new(conn))
                }
                Err(e) => {
                    tracing::warn!(
                        "vector store unreachable ({}), degrading to in-memory backend",
                        e
                    );
                    Arc::new(MemoryVectorStore::new())
                }
            }
        };

        let llm: Arc<dyn LlmClient> = Arc::new(HttpLlmClient::new(&config.llm));
        Ok(Self::from_parts(config, store, llm).await)
    }

    async fn connect_redis(url: &str) -> anyhow::Result<redis::aio::ConnectionManager> {
        let client = redis::Client::open(url)?;
        Ok(client.get_connection_manager().await?)
    }

    /// Assemble services over explicit store/provider implementations.
    /// Index bootstrap is idempotent; failures degrade with a warning the
    /// same way a mid-request outage does.
    pub async fn from_parts(
        config: Config,
        store: Arc<dyn VectorStore>,
        llm: Arc<dyn LlmClient>,
    ) -> Arc<Self> {
        let dim = config.semantic_cache.embedding_dim;
        for schema in [
            SemanticCache::index_schema(dim),
            QueryRouter::index_schema(dim),
            docs_schema(dim),
        ] {
            if let Err(e) = store.ensure_index(&schema).await {
                tracing::warn!("could not ensure index '{}': {}", schema.name, e);
            }
        }

        let embedder = Arc::new(EmbeddingService::new(
            llm.clone(),
            store.clone(),
            config.llm.embedding_model.clone(),
            dim,
        ));
        let semantic_cache = Arc::new(SemanticCache::new(
            store.clone(),
            config.semantic_cache.similarity_threshold,
            config.semantic_cache.ttl_seconds,
        ));
        let registry = Arc::new(WorkflowRegistry::builtin());
        let router = Arc::new(QueryRouter::new(
            store.clone(),
            registry.clone(),
            config.router_cache.similarity_threshold,
        ));
        let memory = Arc::new(MemoryService::new(
            store.clone(),
            config.memory.max_turns_per_user,
        ));

        let tool_cache = Arc::new(ToolCache::new(
            store.clone(),
            config.tool_cache.default_ttl_seconds,
        ));
        let runner = Arc::new(ToolRunner::new(tool_cache));
        let market = Arc::new(MarketDataClient::new(config.llm.market_data_url.clone()));
        let tools = ToolSet {
            market_quote: Arc::new(MarketQuoteTool::new(market.clone())),
            news_search: Arc::new(NewsSearchTool::new(market.clone())),
            fundamentals: Arc::new(FundamentalsTool::new(market)),
            document_search: Arc::new(DocumentSearchTool::new(store.clone(), embedder.clone())),
        };
        let factory = Arc::new(AgentFactory::new(
            llm,
            runner,
            config.llm.chat_model.clone(),
            tools,
        ));
        let orchestrator = Orchestrator::new(factory, &config.orchestration);
        let limiter = Arc::new(Semaphore::new(config.dispatcher.concurrency_cap));

        Arc::new(Self {
            store,
            embedder,
            semantic_cache,
            router,
            memory,
            registry,
            orchestrator,
            process_metrics: Arc::new(ProcessMetrics::new()),
            limiter,
            config,
        })
    }

    pub async fn close(&self) {
        tracing::info!("core services shutting down");
    }

    /// End-to-end flow for one query.
    pub async fn handle(
        &self,
        req: QueryRequest,
    ) -> Result<EnhancedResponse, DispatchFailure> {
        if let Err(e) = req.validate() {
            return Err(DispatchFailure::bare(e));
        }

        // Backpressure: no queueing beyond the cap.
        let _permit = match self.limiter.try_acquire() {
            Ok(permit) => permit,
            Err(_) => return Err(DispatchFailure::bare(CoreError::Overloaded)),
        };

        let query_id = uuid::Uuid::new_v4().to_string();
        let collector = Arc::new(MetricsCollector::new(
            &query_id,
            session_id(&req.user_id),
            &req.user_id,
        ));
        tracing::info!("💬 query {} from {}", query_id, req.user_id);

        let deadline =
            std::time::Duration::from_millis(self.config.dispatcher.request_deadline_ms);
        match tokio::time::timeout(deadline, self.execute(&req, &collector)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(error)) => Err(DispatchFailure {
                query_id: Some(query_id),
                partial_metrics: self.partial_metrics(&req, &collector),
                error,
            }),
            Err(_) => Err(DispatchFailure {
                query_id: Some(query_id),
                partial_metrics: self.partial_metrics(&req, &collector),
                error: CoreError::DeadlineExceeded(self.config.dispatcher.request_deadline_ms),
            }),
        }
    }

    fn partial_metrics(
        &self,
        req: &QueryRequest,
        collector: &MetricsCollector,
    ) -> Option<serde_json::Value> {
        let summary = collector.get_summary(SummaryArgs {
            query: req.query.clone(),
            response: String::new(),
            workflow_name: String::new(),
            workflow_pattern: String::new(),
            routing_source: String::new(),
            routing_time_ms: 0.0,
            agents_available: 0,
            overall_cache_hit: false,
            baseline_cost_usd: 0.0,
            latency_target_ms: self.config.targets.latency_ms,
            cost_target_usd: self.config.targets.cost_usd,
        });
        serde_json::to_value(summary).ok()
    }

    async fn execute(
        &self,
        req: &QueryRequest,
        collector: &Arc<MetricsCollector>,
    ) -> Result<EnhancedResponse, CoreError> {
        // ── Embed the query ───────────────────────────────
        let embed_event = collector.start_event("embedding", "embed_query", None);
        let embedding = match self.embedder.embed_fresh(&req.query).await {
            Ok(result) => {
                collector.record_embedding(result.tokens, result.cost_usd);
                let _ = collector.end_event(
                    embed_event,
                    EventStatus::Success,
                    Some(serde_json::json!({ "tokens": result.tokens })),
                );
                Some(result.vector)
            }
            Err(e) => {
                // No embedding: no semantic short-circuit, router degrades
                // to patterns. The request keeps going.
                let _ = collector.end_event(
                    embed_event,
                    EventStatus::Error,
                    Some(serde_json::json!({ "error": e.to_string() })),
                );
                collector.record_event(
                    "provider",
                    "embedding_unavailable",
                    EventStatus::Warning,
                    None,
                );
                self.process_metrics.record_provider_error();
                tracing::warn!("embedding degraded: {}", e);
                None
            }
        };

        // ── Semantic cache ────────────────────────────────
        if let Some(vec) = &embedding {
            let lookup_event = collector.start_event("cache_lookup:semantic", "semantic", None);
            match self.semantic_cache.lookup(vec).await {
                Ok(lookup) => {
                    let _ = collector.end_event(lookup_event, EventStatus::Success, None);
                    if lookup.hit {
                        let record = lookup.record.expect("hit carries its record");
                        return Ok(self.finish_from_cache(req, collector, lookup.similarity, lookup.query_time_ms, record));
                    }
                    collector.record_cache_check(CacheLayerMetrics {
                        name: "semantic".to_string(),
                        checked: true,
                        hit: false,
                        similarity: Some(lookup.similarity),
                        query_time_ms: lookup.query_time_ms,
                        cost_saved_usd: 0.0,
                        matched_query: None,
                    });
                }
                Err(e) => {
                    let _ = collector.end_event(
                        lookup_event,
                        EventStatus::Error,
                        Some(serde_json::json!({ "error": e.to_string() })),
                    );
                    self.note_store_outage(collector);
                    collector.record_cache_check(CacheLayerMetrics {
                        name: "semantic".to_string(),
                        checked: true,
                        hit: false,
                        similarity: None,
                        query_time_ms: 0.0,
                        cost_saved_usd: 0.0,
                        matched_query: None,
                    });
                }
            }
        }

        // ── Load user memory ──────────────────────────────
        let memory_event = collector.start_event("memory", "load", None);
        let user_context = self.memory.load(&req.user_id).await;
        let _ = collector.end_event(memory_event, EventStatus::Success, None);

        // ── Route ─────────────────────────────────────────
        let decision = self.router.route(&req.query, embedding.as_deref()).await;
        if decision.store_degraded {
            self.note_store_outage(collector);
        }
        collector.record_event(
            &format!("routing:{}", decision.source.as_str()),
            &decision.workflow_name,
            EventStatus::Success,
            Some(serde_json::json!({ "query_time_ms": decision.query_time_ms })),
        );
        let router_hit = decision.source == RouteSource::Vector;
        collector.record_cache_check(CacheLayerMetrics {
            name: "router".to_string(),
            checked: embedding.is_some(),
            hit: router_hit,
            similarity: decision.similarity,
            query_time_ms: decision.query_time_ms,
            cost_saved_usd: if router_hit {
                pricing::cache_savings("router", &self.config.llm.chat_model, 0.0)
            } else {
                0.0
            },
            matched_query: if router_hit {
                decision.matched_query.clone()
            } else {
                None
            },
        });

        // ── Execute the workflow ──────────────────────────
        let workflow = self.registry.get_or_default(&decision.workflow_name);
        let ctx = AgentContext {
            query: req.query.clone(),
            ticker: req.ticker.clone(),
            params: req.params.clone(),
            user: Some(user_context),
            task_outputs: Vec::new(),
        };
        let outcome = self.orchestrator.run(&workflow, &ctx, collector).await?;
        let response_text = outcome.response_text;

        // From here on, failures degrade: the answer is already in hand.

        // ── Store back ────────────────────────────────────
        if let Some(vec) = &embedding {
            let store_event = collector.start_event("cache_store:semantic", "store", None);
            match self
                .semantic_cache
                .store(&req.query, &response_text, vec, &workflow.name)
                .await
            {
                Ok(_) => {
                    let _ = collector.end_event(store_event, EventStatus::Success, None);
                }
                Err(e) => {
                    let _ = collector.end_event(
                        store_event,
                        EventStatus::Error,
                        Some(serde_json::json!({ "error": e.to_string() })),
                    );
                    self.note_store_outage(collector);
                }
            }

            if decision.source != RouteSource::Fallback {
                self.router.learn(&req.query, vec, &workflow.name);
            }
        }

        // ── Conversation tail ─────────────────────────────
        for (role, text) in [
            (TurnRole::User, req.query.as_str()),
            (TurnRole::Assistant, response_text.as_str()),
        ] {
            if let Err(e) = self.memory.append_turn(&req.user_id, role, text).await {
                collector.record_event(
                    "memory",
                    "append_failed",
                    EventStatus::Warning,
                    Some(serde_json::json!({ "error": e.to_string() })),
                );
            }
        }

        // ── Finalize ──────────────────────────────────────
        let agents_available = workflow.tasks.len() + workflow.synthesis.is_some() as usize;
        let summary = collector.get_summary(SummaryArgs {
            query: req.query.clone(),
            response: response_text,
            workflow_name: workflow.name.clone(),
            workflow_pattern: workflow.pattern.to_string(),
            routing_source: decision.source.as_str().to_string(),
            routing_time_ms: decision.query_time_ms,
            agents_available,
            overall_cache_hit: false,
            baseline_cost_usd: workflow.baseline_cost_usd,
            latency_target_ms: self.config.targets.latency_ms,
            cost_target_usd: self.config.targets.cost_usd,
        });
        self.process_metrics.observe(&summary);
        Ok(summary)
    }

    /// Assemble the response for a semantic cache hit: no agents ran, the
    /// only spend is the embedding call.
    fn finish_from_cache(
        &self,
        req: &QueryRequest,
        collector: &Arc<MetricsCollector>,
        similarity: f32,
        query_time_ms: f64,
        record: crate::semantic_cache::CachedAnswer,
    ) -> EnhancedResponse {
        let baseline = pricing::baseline_cost(&record.workflow_name);
        collector.record_cache_check(CacheLayerMetrics {
            name: "semantic".to_string(),
            checked: true,
            hit: true,
            similarity: Some(similarity),
            query_time_ms,
            cost_saved_usd: baseline,
            matched_query: Some(record.query_text.clone()),
        });

        // Advisory counters, off the request path.
        let cache = self.semantic_cache.clone();
        let key = record.cache_key.clone();
        let tokens = pricing::count_tokens(&self.config.llm.chat_model, &record.response_text);
        tokio::spawn(async move {
            if let Err(e) = cache.record_hit(&key, tokens).await {
                tracing::debug!("hit counter update skipped: {}", e);
            }
        });

        let (pattern, agents_available) = match self.registry.get(&record.workflow_name) {
            Ok(wf) => (
                wf.pattern.to_string(),
                wf.tasks.len() + wf.synthesis.is_some() as usize,
            ),
            Err(_) => (String::new(), 0),
        };

        let summary = collector.get_summary(SummaryArgs {
            query: req.query.clone(),
            response: record.response_text,
            workflow_name: record.workflow_name,
            workflow_pattern: pattern,
            routing_source: "cache".to_string(),
            routing_time_ms: 0.0,
            agents_available,
            overall_cache_hit: true,
            baseline_cost_usd: baseline,
            latency_target_ms: self.config.targets.latency_ms,
            cost_target_usd: self.config.targets.cost_usd,
        });
        self.process_metrics.observe(&summary);
        summary
    }

    fn note_store_outage(&self, collector: &MetricsCollector) {
        collector.record_event("store", "store_unavailable", EventStatus::Warning, None);
        collector.record_store_error();
        self.process_metrics.record_store_error();
    }
}

// ============================================================
// Tests — end-to-end over the in-memory store and the mock
// provider: cold/warm cache, degradations, backpressure.
// ============================================================
