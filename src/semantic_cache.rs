use std::sync::Arc;

use crate::errors::CoreError;
use crate::llm::stable_hash;
use crate::vector::{
    embedding_to_bytes, field_str, field_u64, FieldValue, IndexSchema, VectorStore,
    EMBEDDING_FIELD,
};

// ============================================================
// Semantic Response Cache
// ============================================================
//
// One authoritative answer per semantic intent. Matching is by
// embedding cosine similarity against the semantic_cache index;
// the stable key only makes writes idempotent.
// ============================================================

pub const SEMANTIC_INDEX: &str = "semantic_cache";
pub const SEMANTIC_PREFIX: &str = "semcache:";

/// lowercase, trim, collapse interior whitespace.
pub fn normalize_query(query: &str) -> String {
    query
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn cache_key(query: &str) -> String {
    stable_hash(&normalize_query(query))
}

/// A stored answer, parsed back out of the hash.
#[derive(Debug, Clone)]
pub struct CachedAnswer {
    pub cache_key: String,
    pub query_text: String,
    pub response_text: String,
    pub workflow_name: String,
    pub created_at: i64, // unix ms
    pub ttl_seconds: u64,
    pub usage_count: u64,
    pub tokens_saved: u64,
}

impl CachedAnswer {
    pub fn is_fresh(&self, now_ms: i64) -> bool {
        now_ms < self.created_at + (self.ttl_seconds as i64) * 1000
    }
}

/// Lookup outcome. Similarity is reported even on a miss so near-hits
/// are observable.
#[derive(Debug, Clone)]
pub struct SemanticLookup {
    pub hit: bool,
    pub similarity: f32,
    pub query_time_ms: f64,
    pub record: Option<CachedAnswer>,
}

pub struct SemanticCache {
    store: Arc<dyn VectorStore>,
    similarity_threshold: f32,
    ttl_seconds: u64,
}

impl SemanticCache {
    pub fn new(store: Arc<dyn VectorStore>, similarity_threshold: f32, ttl_seconds: u64) -> Self {
        Self {
            store,
            similarity_threshold,
            ttl_seconds,
        }
    }

    pub fn index_schema(dim: usize) -> IndexSchema {
        IndexSchema {
            name: SEMANTIC_INDEX.to_string(),
            prefix: SEMANTIC_PREFIX.to_string(),
            dim,
            text_fields: vec!["query".to_string()],
            tag_fields: vec!["workflow".to_string()],
            numeric_fields: vec!["created_at".to_string()],
        }
    }

    /// KNN(k=1) against the index; a hit needs similarity at or above the
    /// threshold AND an unexpired record.
    pub async fn lookup(&self, embedding: &[f32]) -> Result<SemanticLookup, CoreError> {
        let started = std::time::Instant::now();
        let matches = self.store.knn(SEMANTIC_INDEX, embedding, 1, None).await?;
        let query_time_ms = started.elapsed().as_secs_f64() * 1000.0;

        let best = match matches.into_iter().next() {
            Some(m) => m,
            None => {
                return Ok(SemanticLookup {
                    hit: false,
                    similarity: 0.0,
                    query_time_ms,
                    record: None,
                })
            }
        };

        let similarity = best.similarity;
        let record = parse_record(&best.id, &best.fields);
        let fresh = record
            .as_ref()
            .map(|r| r.is_fresh(chrono::Utc::now().timestamp_millis()))
            .unwrap_or(false);

        if similarity >= self.similarity_threshold && fresh {
            Ok(SemanticLookup {
                hit: true,
                similarity,
                query_time_ms,
                record,
            })
        } else {
            Ok(SemanticLookup {
                hit: false,
                similarity,
                query_time_ms,
                record: None,
            })
        }
    }

    /// Write-through after a successful execution. Overwriting an existing
    /// key is a refresh.
    pub async fn store(
        &self,
        query: &str,
        response: &str,
        embedding: &[f32],
        workflow_name: &str,
    ) -> Result<String, CoreError> {
        let key = cache_key(query);
        let fields = vec![
            ("query".to_string(), FieldValue::Text(query.to_string())),
            (
                "response".to_string(),
                FieldValue::Text(response.to_string()),
            ),
            (
                "workflow".to_string(),
                FieldValue::Text(workflow_name.to_string()),
            ),
            (
                "created_at".to_string(),
                FieldValue::Number(chrono::Utc::now().timestamp_millis() as f64),
            ),
            (
                "ttl_seconds".to_string(),
                FieldValue::Number(self.ttl_seconds as f64),
            ),
            ("usage_count".to_string(), FieldValue::Number(0.0)),
            ("tokens_saved".to_string(), FieldValue::Number(0.0)),
            (
                EMBEDDING_FIELD.to_string(),
                FieldValue::Blob(embedding_to_bytes(embedding)),
            ),
        ];
        self.store.upsert(SEMANTIC_PREFIX, &key, fields).await?;
        tracing::debug!("💾 cached answer under {}", key);
        Ok(key)
    }

    /// Bump usage_count and tokens_saved. Read-modify-write: concurrent
    /// bumps may lose updates, which is tolerated (counters are advisory).
    pub async fn record_hit(&self, key: &str, tokens_in_response: u64) -> Result<(), CoreError> {
        let fields = self
            .store
            .get(SEMANTIC_PREFIX, key)
            .await?
            .ok_or_else(|| CoreError::KeyNotFound(key.to_string()))?;
        let usage = field_u64(&fields, "usage_count").unwrap_or(0) + 1;
        let saved = field_u64(&fields, "tokens_saved").unwrap_or(0) + tokens_in_response;
        self.store
            .upsert(
                SEMANTIC_PREFIX,
                key,
                vec![
                    ("usage_count".to_string(), FieldValue::Number(usage as f64)),
                    ("tokens_saved".to_string(), FieldValue::Number(saved as f64)),
                ],
            )
            .await
    }
}

fn parse_record(
    id: &str,
    fields: &std::collections::HashMap<String, Vec<u8>>,
) -> Option<CachedAnswer> {
    Some(CachedAnswer {
        cache_key: id.to_string(),
        query_text: field_str(fields, "query")?,
        response_text: field_str(fields, "response")?,
        workflow_name: field_str(fields, "workflow").unwrap_or_default(),
        created_at: crate::vector::field_i64(fields, "created_at")?,
        ttl_seconds: field_u64(fields, "ttl_seconds").unwrap_or(3600),
        usage_count: field_u64(fields, "usage_count").unwrap_or(0),
        tokens_saved: field_u64(fields, "tokens_saved").unwrap_or(0),
    })
}

// ============================================================
// Tests
// ============================================================
