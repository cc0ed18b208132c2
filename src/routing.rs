use std::sync::Arc;

use crate::llm::stable_hash;
use crate::vector::{
    embedding_to_bytes, field_i64, field_str, field_u64, FieldValue, IndexSchema, VectorStore,
    EMBEDDING_FIELD,
};
use crate::workflows::WorkflowRegistry;

// ============================================================
// Routing (Router Cache + Pattern Fallback)
// ============================================================
//
// Two-stage lookup: vector similarity over learned routes, then
// regex patterns declared by the workflows, then Default. Every
// successful non-fallback route is learned back into the cache.
// ============================================================

pub const ROUTER_INDEX: &str = "router_cache";
pub const ROUTER_PREFIX: &str = "route:";

/// Candidates fetched per vector lookup; ties resolve by usage then age.
const ROUTE_CANDIDATES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteSource {
    Vector,
    Pattern,
    Fallback,
}

impl RouteSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteSource::Vector => "vector",
            RouteSource::Pattern => "pattern",
            RouteSource::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub workflow_name: String,
    pub source: RouteSource,
    pub similarity: Option<f32>,
    /// The stored query (vector stage) or pattern text (pattern stage).
    pub matched_query: Option<String>,
    pub query_time_ms: f64,
    /// True when the vector stage failed and we degraded to patterns.
    pub store_degraded: bool,
}

pub struct QueryRouter {
    store: Arc<dyn VectorStore>,
    registry: Arc<WorkflowRegistry>,
    similarity_threshold: f32,
}

impl QueryRouter {
    pub fn new(
        store: Arc<dyn VectorStore>,
        registry: Arc<WorkflowRegistry>,
        similarity_threshold: f32,
    ) -> Self {
        Self {
            store,
            registry,
            similarity_threshold,
        }
    }

    pub fn index_schema(dim: usize) -> IndexSchema {
        IndexSchema {
            name: ROUTER_INDEX.to_string(),
            prefix: ROUTER_PREFIX.to_string(),
            dim,
            text_fields: vec!["pattern_text".to_string()],
            tag_fields: vec!["workflow".to_string()],
            numeric_fields: vec!["created_at".to_string(), "usage_count".to_string()],
        }
    }

    /// Full two-stage route. Never fails: a broken store degrades to the
    /// pattern stage with `store_degraded` set so the caller can record a
    /// warning event.
    pub async fn route(&self, query: &str, embedding: Option<&[f32]>) -> RouteDecision {
        let started = std::time::Instant::now();
        let mut best_similarity = None;
        let mut store_degraded = false;

        // Stage 1: learned routes by embedding similarity.
        if let Some(vec) = embedding {
            match self
                .store
                .knn(ROUTER_INDEX, vec, ROUTE_CANDIDATES, None)
                .await
            {
                Ok(matches) => {
                    if let Some(best) = self.pick_candidate(&matches) {
                        best_similarity = Some(best.1);
                        if best.1 >= self.similarity_threshold {
                            return RouteDecision {
                                workflow_name: best.0,
                                source: RouteSource::Vector,
                                similarity: Some(best.1),
                                matched_query: best.2,
                                query_time_ms: started.elapsed().as_secs_f64() * 1000.0,
                                store_degraded: false,
                            };
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("router cache lookup degraded: {}", e);
                    store_degraded = true;
                }
            }
        }

        // Stage 2: declared regex patterns.
        if let Some((workflow_name, pattern)) = self.registry.match_pattern(query) {
            return RouteDecision {
                workflow_name,
                source: RouteSource::Pattern,
                similarity: best_similarity,
                matched_query: Some(pattern),
                query_time_ms: started.elapsed().as_secs_f64() * 1000.0,
                store_degraded,
            };
        }

        RouteDecision {
            workflow_name: "Default".to_string(),
            source: RouteSource::Fallback,
            similarity: best_similarity,
            matched_query: None,
            query_time_ms: started.elapsed().as_secs_f64() * 1000.0,
            store_degraded,
        }
    }

    /// Best valid candidate: highest similarity, ties broken by higher
    /// usage_count, then most recent created_at. Entries pointing at
    /// unregistered workflows are skipped.
    fn pick_candidate(
        &self,
        matches: &[crate::vector::KnnMatch],
    ) -> Option<(String, f32, Option<String>)> {
        let mut candidates: Vec<(&crate::vector::KnnMatch, String, u64, i64)> = matches
            .iter()
            .filter_map(|m| {
                let workflow = field_str(&m.fields, "workflow")?;
                if !self.registry.contains(&workflow) {
                    tracing::debug!("route entry {} targets unknown workflow, skipped", m.id);
                    return None;
                }
                let usage = field_u64(&m.fields, "usage_count").unwrap_or(0);
                let created = field_i64(&m.fields, "created_at").unwrap_or(0);
                Some((m, workflow, usage, created))
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.0.similarity
                .partial_cmp(&a.0.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.2.cmp(&a.2))
                .then(b.3.cmp(&a.3))
        });

        candidates.into_iter().next().map(|(m, workflow, _, _)| {
            (
                workflow,
                m.similarity,
                field_str(&m.fields, "pattern_text"),
            )
        })
    }

    /// Learn a successful non-fallback route, fire-and-forget. The store
    /// must tolerate high key churn; usage_count updates may race (last
    /// writer wins, accepted).
    pub fn learn(&self, query: &str, embedding: &[f32], workflow_name: &str) {
        let store = self.store.clone();
        let key = stable_hash(query);
        let query = query.to_string();
        let workflow_name = workflow_name.to_string();
        let embedding = embedding.to_vec();
        tokio::spawn(async move {
            let usage = match store.get(ROUTER_PREFIX, &key).await {
                Ok(Some(fields)) => field_u64(&fields, "usage_count").unwrap_or(0) + 1,
                _ => 1,
            };
            let fields = vec![
                ("pattern_text".to_string(), FieldValue::Text(query)),
                ("workflow".to_string(), FieldValue::Text(workflow_name)),
                (
                    "created_at".to_string(),
                    FieldValue::Number(chrono::Utc::now().timestamp_millis() as f64),
                ),
                ("usage_count".to_string(), FieldValue::Number(usage as f64)),
                (
                    EMBEDDING_FIELD.to_string(),
                    FieldValue::Blob(embedding_to_bytes(&embedding)),
                ),
            ];
            if let Err(e) = store.upsert(ROUTER_PREFIX, &key, fields).await {
                tracing::debug!("route learning write skipped: {}", e);
            }
        });
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::MemoryVectorStore;

    async fn router_with_store(threshold: f32) -> (QueryRouter, Arc<MemoryVectorStore>) {
        let store = Arc::new(MemoryVectorStore::new());
        store
            .ensure_index(&QueryRouter::index_schema(3))
            .await
            .unwrap();
        let registry = Arc::new(WorkflowRegistry::builtin());
        (QueryRouter::new(store.clone(), registry, threshold), store)
    }

    async fn seed_route(
        store: &MemoryVectorStore,
        id: &str,
        text: &str,
        workflow: &str,
        embedding: &[f32],
        usage: u64,
        created_at: i64,
    ) {
        store
            .upsert(
                ROUTER_PREFIX,
                id,
                vec![
                    ("pattern_text".to_string(), FieldValue::Text(text.to_string())),
                    ("workflow".to_string(), FieldValue::Text(workflow.to_string())),
                    ("created_at".to_string(), FieldValue::Number(created_at as f64)),
                    ("usage_count".to_string(), FieldValue::Number(usage as f64)),
                    (
                        EMBEDDING_FIELD.to_string(),
                        FieldValue::Blob(embedding_to_bytes(embedding)),
                    ),
                ],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn vector_stage_wins_over_threshold() {
        let (router, store) = router_with_store(0.90).await;
        let v = vec![1.0, 0.0, 0.0];
        seed_route(&store, "r1", "price of AAPL", "QuickQuoteWorkflow", &v, 3, 100).await;

        let decision = router.route("totally novel phrasing", Some(&v)).await;
        assert_eq!(decision.source, RouteSource::Vector);
        assert_eq!(decision.workflow_name, "QuickQuoteWorkflow");
        assert_eq!(decision.matched_query.as_deref(), Some("price of AAPL"));
        assert!(decision.similarity.unwrap() >= 0.999);
    }

    #[tokio::test]
    async fn below_threshold_falls_to_pattern() {
        let (router, store) = router_with_store(0.90).await;
        seed_route(
            &store,
            "r1",
            "something else",
            "MarketResearchWorkflow",
            &[0.0, 1.0, 0.0],
            1,
            100,
        )
        .await;

        let decision = router
            .route("should i buy TSLA", Some(&[1.0, 0.0, 0.0]))
            .await;
        assert_eq!(decision.source, RouteSource::Pattern);
        assert_eq!(decision.workflow_name, "InvestmentAnalysisWorkflow");
        // Near-miss similarity still observable.
        assert!(decision.similarity.is_some());
    }

    #[tokio::test]
    async fn nothing_matches_falls_back_to_default() {
        let (router, _) = router_with_store(0.90).await;
        let decision = router.route("good morning", Some(&[1.0, 0.0, 0.0])).await;
        assert_eq!(decision.source, RouteSource::Fallback);
        assert_eq!(decision.workflow_name, "Default");
        assert!(decision.matched_query.is_none());
    }

    #[tokio::test]
    async fn no_embedding_skips_vector_stage() {
        let (router, store) = router_with_store(0.90).await;
        let v = vec![1.0, 0.0, 0.0];
        seed_route(&store, "r1", "price of AAPL", "QuickQuoteWorkflow", &v, 3, 100).await;

        let decision = router.route("quote for MSFT", None).await;
        assert_eq!(decision.source, RouteSource::Pattern);
        assert_eq!(decision.workflow_name, "QuickQuoteWorkflow");
    }

    #[tokio::test]
    async fn unknown_workflow_entries_are_skipped() {
        let (router, store) = router_with_store(0.90).await;
        let v = vec![1.0, 0.0, 0.0];
        seed_route(&store, "bad", "old route", "RetiredWorkflow", &v, 9, 200).await;

        let decision = router.route("good morning", Some(&v)).await;
        assert_eq!(decision.source, RouteSource::Fallback);
    }

    #[tokio::test]
    async fn equal_similarity_prefers_higher_usage() {
        let (router, store) = router_with_store(0.90).await;
        let v = vec![1.0, 0.0, 0.0];
        seed_route(&store, "cold", "price of MSFT", "QuickQuoteWorkflow", &v, 1, 100).await;
        seed_route(
            &store,
            "hot",
            "research NVDA",
            "MarketResearchWorkflow",
            &v,
            8,
            50,
        )
        .await;

        let decision = router.route("anything", Some(&v)).await;
        assert_eq!(decision.workflow_name, "MarketResearchWorkflow");
        assert_eq!(decision.matched_query.as_deref(), Some("research NVDA"));
    }

    #[tokio::test]
    async fn learn_writes_route_entry() {
        let (router, store) = router_with_store(0.90).await;
        let v = vec![0.0, 1.0, 0.0];
        router.learn("should i buy TSLA", &v, "InvestmentAnalysisWorkflow");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let key = stable_hash("should i buy TSLA");
        let fields = store.get(ROUTER_PREFIX, &key).await.unwrap().unwrap();
        assert_eq!(
            field_str(&fields, "workflow").as_deref(),
            Some("InvestmentAnalysisWorkflow")
        );
        assert_eq!(field_u64(&fields, "usage_count"), Some(1));

        // Learning again bumps usage.
        router.learn("should i buy TSLA", &v, "InvestmentAnalysisWorkflow");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let fields = store.get(ROUTER_PREFIX, &key).await.unwrap().unwrap();
        assert_eq!(field_u64(&fields, "usage_count"), Some(2));
    }
}
