use async_trait::async_trait;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::errors::CoreError;

// ============================================================
// Vector Store Adapter
// ============================================================
//
// Wraps a Redis-compatible store with vector indices (FT.*).
// All writes are single-key; no multi-key transactions. Every
// failure other than a missing key surfaces as StoreUnavailable.
// Distances stay inside this module: callers only ever see
// cosine similarity (1 - distance).
// ============================================================

/// Hash field that carries the f32-LE embedding blob.
pub const EMBEDDING_FIELD: &str = "embedding";

const RETRY_BACKOFF_MS: u64 = 50;

/// Declarative index description used by `ensure_index`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexSchema {
    pub name: String,
    pub prefix: String,
    pub dim: usize,
    #[serde(default)]
    pub text_fields: Vec<String>,
    #[serde(default)]
    pub tag_fields: Vec<String>,
    #[serde(default)]
    pub numeric_fields: Vec<String>,
}

/// A value written into a hash field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Number(f64),
    Blob(Vec<u8>),
}

impl FieldValue {
    fn into_bytes(self) -> Vec<u8> {
        match self {
            FieldValue::Text(s) => s.into_bytes(),
            FieldValue::Number(n) => format_number(n).into_bytes(),
            FieldValue::Blob(b) => b,
        }
    }
}

/// Numbers are written without a trailing `.0` when integral.
fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// One KNN result. `similarity` is cosine similarity in [0, 1]-ish
/// (negative values are possible for opposed vectors and mean "no match").
#[derive(Debug, Clone)]
pub struct KnnMatch {
    pub id: String,
    pub similarity: f32,
    pub fields: HashMap<String, Vec<u8>>,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Idempotently create an index. An existing index with the same
    /// dimension is a no-op; a different dimension is `IndexSchemaConflict`.
    async fn ensure_index(&self, schema: &IndexSchema) -> Result<(), CoreError>;

    /// Write a hash under `prefix + id`.
    async fn upsert(
        &self,
        prefix: &str,
        id: &str,
        fields: Vec<(String, FieldValue)>,
    ) -> Result<(), CoreError>;

    /// Read a hash; missing key is `None`, not an error.
    async fn get(&self, prefix: &str, id: &str)
        -> Result<Option<HashMap<String, Vec<u8>>>, CoreError>;

    async fn delete(&self, prefix: &str, id: &str) -> Result<(), CoreError>;

    /// Top-k cosine neighbors, best first. `filter` is a conjunction of
    /// tag-field equalities.
    async fn knn(
        &self,
        index: &str,
        query_vec: &[f32],
        k: usize,
        filter: Option<&[(String, String)]>,
    ) -> Result<Vec<KnnMatch>, CoreError>;

    /// Ids (without prefix) of every hash under the prefix.
    async fn scan(&self, prefix: &str) -> Result<Vec<String>, CoreError>;
}

// ── Field helpers ─────────────────────────────────────────

pub fn field_str(fields: &HashMap<String, Vec<u8>>, name: &str) -> Option<String> {
    fields
        .get(name)
        .map(|b| String::from_utf8_lossy(b).into_owned())
}

pub fn field_f64(fields: &HashMap<String, Vec<u8>>, name: &str) -> Option<f64> {
    field_str(fields, name)?.parse().ok()
}

pub fn field_u64(fields: &HashMap<String, Vec<u8>>, name: &str) -> Option<u64> {
    field_str(fields, name)?.parse().ok()
}

pub fn field_i64(fields: &HashMap<String, Vec<u8>>, name: &str) -> Option<i64> {
    field_str(fields, name)?.parse().ok()
}

/// f32 slice -> little-endian bytes (4 per component).
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

pub fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

// ============================================================
// Redis Implementation (RediSearch FT.*)
// ============================================================

pub struct RedisVectorStore {
    conn: ConnectionManager,
    /// index name -> key prefix, learned at ensure_index; lets knn return
    /// bare ids the way the in-memory backend does.
    prefixes: std::sync::RwLock<HashMap<String, String>>,
}

/// Sidecar key recording the schema an index was created with,
/// so `ensure_index` can detect conflicts across restarts.
fn meta_key(index: &str) -> String {
    format!("idxmeta:{}", index)
}

impl RedisVectorStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            prefixes: std::sync::RwLock::new(HashMap::new()),
        }
    }

    /// Run a command, retrying once with a fixed backoff.
    async fn query_with_retry<T: redis::FromRedisValue>(
        &self,
        cmd: &redis::Cmd,
    ) -> Result<T, CoreError> {
        let mut con = self.conn.clone();
        match cmd.query_async::<_, T>(&mut con).await {
            Ok(v) => Ok(v),
            Err(first) => {
                tokio::time::sleep(std::time::Duration::from_millis(RETRY_BACKOFF_MS)).await;
                let mut con = self.conn.clone();
                cmd.query_async::<_, T>(&mut con).await.map_err(|second| {
                    tracing::warn!("store command failed twice: {} / {}", first, second);
                    CoreError::StoreUnavailable(second.to_string())
                })
            }
        }
    }

    fn build_create_cmd(schema: &IndexSchema) -> redis::Cmd {
        let mut cmd = redis::cmd("FT.CREATE");
        cmd.arg(&schema.name)
            .arg("ON")
            .arg("HASH")
            .arg("PREFIX")
            .arg(1)
            .arg(&schema.prefix)
            .arg("SCHEMA");
        for field in &schema.text_fields {
            cmd.arg(field).arg("TEXT");
        }
        for field in &schema.tag_fields {
            cmd.arg(field).arg("TAG");
        }
        for field in &schema.numeric_fields {
            cmd.arg(field).arg("NUMERIC");
        }
        cmd.arg(EMBEDDING_FIELD)
            .arg("VECTOR")
            .arg("HNSW")
            .arg(6)
            .arg("TYPE")
            .arg("FLOAT32")
            .arg("DIM")
            .arg(schema.dim)
            .arg("DISTANCE_METRIC")
            .arg("COSINE");
        cmd
    }
}

#[async_trait]
impl VectorStore for RedisVectorStore {
    async fn ensure_index(&self, schema: &IndexSchema) -> Result<(), CoreError> {
        let mut con = self.conn.clone();
        let info: Result<redis::Value, redis::RedisError> = redis::cmd("FT.INFO")
            .arg(&schema.name)
            .query_async(&mut con)
            .await;

        if let Ok(mut map) = self.prefixes.write() {
            map.insert(schema.name.clone(), schema.prefix.clone());
        }

        match info {
            Ok(_) => {
                // Index exists; compare against the recorded schema.
                let meta: Option<String> = self
                    .query_with_retry(redis::cmd("GET").arg(meta_key(&schema.name)))
                    .await?;
                match meta {
                    Some(raw) => {
                        let existing: IndexSchema = serde_json::from_str(&raw)?;
                        if existing.dim != schema.dim {
                            return Err(CoreError::IndexSchemaConflict(schema.name.clone()));
                        }
                        Ok(())
                    }
                    None => {
                        // Index created out-of-band; record what we expect.
                        let raw = serde_json::to_string(schema)?;
                        self.query_with_retry::<()>(
                            redis::cmd("SET").arg(meta_key(&schema.name)).arg(raw),
                        )
                        .await?;
                        Ok(())
                    }
                }
            }
            Err(e) if e.to_string().to_lowercase().contains("unknown index") => {
                tracing::info!("creating vector index '{}'", schema.name);
                self.query_with_retry::<()>(&Self::build_create_cmd(schema))
                    .await?;
                let raw = serde_json::to_string(schema)?;
                self.query_with_retry::<()>(redis::cmd("SET").arg(meta_key(&schema.name)).arg(raw))
                    .await?;
                Ok(())
            }
            Err(e) => Err(CoreError::StoreUnavailable(e.to_string())),
        }
    }

    async fn upsert(
        &self,
        prefix: &str,
        id: &str,
        fields: Vec<(String, FieldValue)>,
    ) -> Result<(), CoreError> {
        let mut cmd = redis::cmd("HSET");
        cmd.arg(format!("{}{}", prefix, id));
        for (name, value) in fields {
            cmd.arg(name).arg(value.into_bytes());
        }
        self.query_with_retry::<()>(&cmd).await
    }

    async fn get(
        &self,
        prefix: &str,
        id: &str,
    ) -> Result<Option<HashMap<String, Vec<u8>>>, CoreError> {
        let fields: HashMap<String, Vec<u8>> = self
            .query_with_retry(redis::cmd("HGETALL").arg(format!("{}{}", prefix, id)))
            .await?;
        if fields.is_empty() {
            Ok(None)
        } else {
            Ok(Some(fields))
        }
    }

    async fn delete(&self, prefix: &str, id: &str) -> Result<(), CoreError> {
        self.query_with_retry::<()>(redis::cmd("DEL").arg(format!("{}{}", prefix, id)))
            .await
    }

    async fn knn(
        &self,
        index: &str,
        query_vec: &[f32],
        k: usize,
        filter: Option<&[(String, String)]>,
    ) -> Result<Vec<KnnMatch>, CoreError> {
        let pre = match filter {
            Some(tags) if !tags.is_empty() => tags
                .iter()
                .map(|(field, value)| format!("@{}:{{{}}}", field, escape_tag(value)))
                .collect::<Vec<_>>()
                .join(" "),
            _ => "*".to_string(),
        };
        let query = format!("({})=>[KNN {} @{} $vec AS dist]", pre, k, EMBEDDING_FIELD);

        let mut cmd = redis::cmd("FT.SEARCH");
        cmd.arg(index)
            .arg(query)
            .arg("PARAMS")
            .arg(2)
            .arg("vec")
            .arg(embedding_to_bytes(query_vec))
            .arg("SORTBY")
            .arg("dist")
            .arg("ASC")
            .arg("LIMIT")
            .arg(0)
            .arg(k)
            .arg("DIALECT")
            .arg(2);

        let reply: redis::Value = self.query_with_retry(&cmd).await?;
        let mut matches = parse_search_reply(reply)?;
        if let Some(prefix) = self
            .prefixes
            .read()
            .ok()
            .and_then(|map| map.get(index).cloned())
        {
            for m in &mut matches {
                if let Some(bare) = m.id.strip_prefix(&prefix) {
                    m.id = bare.to_string();
                }
            }
        }
        Ok(matches)
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, CoreError> {
        let mut ids = Vec::new();
        let mut cursor = 0u64;
        loop {
            let (next, keys): (u64, Vec<String>) = self
                .query_with_retry(
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(format!("{}*", prefix))
                        .arg("COUNT")
                        .arg(100),
                )
                .await?;
            for key in keys {
                if let Some(id) = key.strip_prefix(prefix) {
                    ids.push(id.to_string());
                }
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(ids)
    }
}

/// Tag values need `-`, `.` and spaces escaped inside `{}` queries.
fn escape_tag(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if c.is_alphanumeric() || c == '_' {
            out.push(c);
        } else {
            out.push('\\');
            out.push(c);
        }
    }
    out
}

/// FT.SEARCH replies as `[total, id, [field, value, ...], id, ...]`.
fn parse_search_reply(reply: redis::Value) -> Result<Vec<KnnMatch>, CoreError> {
    let items = match reply {
        redis::Value::Bulk(items) => items,
        other => {
            return Err(CoreError::StoreUnavailable(format!(
                "unexpected FT.SEARCH reply: {:?}",
                other
            )))
        }
    };

    let mut matches = Vec::new();
    let mut iter = items.into_iter();
    let _total = iter.next(); // leading count

    while let Some(id_value) = iter.next() {
        let id = match value_to_string(&id_value) {
            Some(s) => s,
            None => continue,
        };
        let fields = match iter.next() {
            Some(redis::Value::Bulk(pairs)) => {
                let mut map = HashMap::new();
                let mut pair_iter = pairs.into_iter();
                while let (Some(name), Some(value)) = (pair_iter.next(), pair_iter.next()) {
                    if let (Some(name), Some(bytes)) =
                        (value_to_string(&name), value_to_bytes(value))
                    {
                        map.insert(name, bytes);
                    }
                }
                map
            }
            _ => HashMap::new(),
        };
        let distance: f32 = field_f64(&fields, "dist").unwrap_or(1.0) as f32;
        matches.push(KnnMatch {
            id,
            similarity: 1.0 - distance,
            fields,
        });
    }
    // Best similarity first (FT.SEARCH already sorts by distance; keep it stable).
    matches.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    Ok(matches)
}

fn value_to_string(value: &redis::Value) -> Option<String> {
    match value {
        redis::Value::Data(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        redis::Value::Status(s) => Some(s.clone()),
        _ => None,
    }
}

fn value_to_bytes(value: redis::Value) -> Option<Vec<u8>> {
    match value {
        redis::Value::Data(bytes) => Some(bytes),
        redis::Value::Status(s) => Some(s.into_bytes()),
        _ => None,
    }
}

// ============================================================
// In-Memory Implementation
// ============================================================
//
// Exact cosine scan over process memory. Used when the store
// backend is "memory" (dev boxes without Redis) and by tests.
// ============================================================

#[derive(Default)]
pub struct MemoryVectorStore {
    inner: tokio::sync::RwLock<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    indices: HashMap<String, IndexSchema>,
    hashes: HashMap<String, HashMap<String, Vec<u8>>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn ensure_index(&self, schema: &IndexSchema) -> Result<(), CoreError> {
        let mut inner = self.inner.write().await;
        match inner.indices.get(&schema.name) {
            Some(existing) if existing.dim != schema.dim => {
                Err(CoreError::IndexSchemaConflict(schema.name.clone()))
            }
            Some(_) => Ok(()),
            None => {
                inner.indices.insert(schema.name.clone(), schema.clone());
                Ok(())
            }
        }
    }

    async fn upsert(
        &self,
        prefix: &str,
        id: &str,
        fields: Vec<(String, FieldValue)>,
    ) -> Result<(), CoreError> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .hashes
            .entry(format!("{}{}", prefix, id))
            .or_default();
        for (name, value) in fields {
            entry.insert(name, value.into_bytes());
        }
        Ok(())
    }

    async fn get(
        &self,
        prefix: &str,
        id: &str,
    ) -> Result<Option<HashMap<String, Vec<u8>>>, CoreError> {
        let inner = self.inner.read().await;
        Ok(inner.hashes.get(&format!("{}{}", prefix, id)).cloned())
    }

    async fn delete(&self, prefix: &str, id: &str) -> Result<(), CoreError> {
        let mut inner = self.inner.write().await;
        inner.hashes.remove(&format!("{}{}", prefix, id));
        Ok(())
    }

    async fn knn(
        &self,
        index: &str,
        query_vec: &[f32],
        k: usize,
        filter: Option<&[(String, String)]>,
    ) -> Result<Vec<KnnMatch>, CoreError> {
        let inner = self.inner.read().await;
        let schema = inner
            .indices
            .get(index)
            .ok_or_else(|| CoreError::StoreUnavailable(format!("unknown index '{}'", index)))?;

        let mut matches: Vec<KnnMatch> = inner
            .hashes
            .iter()
            .filter(|(key, _)| key.starts_with(&schema.prefix))
            .filter_map(|(key, fields)| {
                if let Some(tags) = filter {
                    for (field, expected) in tags {
                        if field_str(fields, field).as_deref() != Some(expected.as_str()) {
                            return None;
                        }
                    }
                }
                let embedding = bytes_to_embedding(fields.get(EMBEDDING_FIELD)?);
                Some(KnnMatch {
                    id: key[schema.prefix.len()..].to_string(),
                    similarity: cosine_similarity(query_vec, &embedding),
                    fields: fields.clone(),
                })
            })
            .collect();

        matches.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.truncate(k);
        Ok(matches)
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, CoreError> {
        let inner = self.inner.read().await;
        let mut ids: Vec<String> = inner
            .hashes
            .keys()
            .filter_map(|key| key.strip_prefix(prefix).map(|s| s.to_string()))
            .collect();
        ids.sort();
        Ok(ids)
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    mod math_tests {
        use super::*;

        #[test]
        fn identical_vectors_have_unit_similarity() {
            let v = vec![0.3, -0.2, 0.9];
            assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        }

        #[test]
        fn orthogonal_vectors_have_zero_similarity() {
            let a = vec![1.0, 0.0];
            let b = vec![0.0, 1.0];
            assert!(cosine_similarity(&a, &b).abs() < 1e-6);
        }

        #[test]
        fn zero_vector_yields_zero() {
            assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
        }

        #[test]
        fn embedding_bytes_round_trip() {
            let v = vec![1.5f32, -0.25, 3.125, 0.0];
            assert_eq!(bytes_to_embedding(&embedding_to_bytes(&v)), v);
        }

        #[test]
        fn integral_numbers_drop_fraction() {
            assert_eq!(format_number(3.0), "3");
            assert_eq!(format_number(3.5), "3.5");
        }
    }

    mod memory_store_tests {
        use super::*;

        fn schema(dim: usize) -> IndexSchema {
            IndexSchema {
                name: "test_idx".to_string(),
                prefix: "t:".to_string(),
                dim,
                text_fields: vec!["query".to_string()],
                tag_fields: vec!["workflow".to_string()],
                numeric_fields: vec!["created_at".to_string()],
            }
        }

        #[tokio::test]
        async fn upsert_then_get_returns_fields_verbatim() {
            let store = MemoryVectorStore::new();
            store
                .upsert(
                    "t:",
                    "1",
                    vec![
                        ("query".to_string(), FieldValue::Text("hello".to_string())),
                        ("created_at".to_string(), FieldValue::Number(42.0)),
                    ],
                )
                .await
                .unwrap();
            let fields = store.get("t:", "1").await.unwrap().unwrap();
            assert_eq!(field_str(&fields, "query").as_deref(), Some("hello"));
            assert_eq!(field_i64(&fields, "created_at"), Some(42));
        }

        #[tokio::test]
        async fn missing_key_is_none() {
            let store = MemoryVectorStore::new();
            assert!(store.get("t:", "nope").await.unwrap().is_none());
        }

        #[tokio::test]
        async fn ensure_index_is_idempotent() {
            let store = MemoryVectorStore::new();
            store.ensure_index(&schema(4)).await.unwrap();
            store.ensure_index(&schema(4)).await.unwrap();
        }

        #[tokio::test]
        async fn dimension_mismatch_conflicts() {
            let store = MemoryVectorStore::new();
            store.ensure_index(&schema(4)).await.unwrap();
            let err = store.ensure_index(&schema(8)).await.unwrap_err();
            assert!(matches!(err, CoreError::IndexSchemaConflict(_)));
        }

        #[tokio::test]
        async fn knn_finds_exact_match_with_unit_similarity() {
            let store = MemoryVectorStore::new();
            store.ensure_index(&schema(3)).await.unwrap();
            let v = vec![0.6f32, 0.8, 0.0];
            store
                .upsert(
                    "t:",
                    "a",
                    vec![(
                        EMBEDDING_FIELD.to_string(),
                        FieldValue::Blob(embedding_to_bytes(&v)),
                    )],
                )
                .await
                .unwrap();
            let matches = store.knn("test_idx", &v, 1, None).await.unwrap();
            assert_eq!(matches.len(), 1);
            assert_eq!(matches[0].id, "a");
            assert!(matches[0].similarity >= 1.0 - 1e-6);
        }

        #[tokio::test]
        async fn knn_orders_by_similarity() {
            let store = MemoryVectorStore::new();
            store.ensure_index(&schema(2)).await.unwrap();
            for (id, v) in [("near", vec![1.0f32, 0.1]), ("far", vec![0.0, 1.0])] {
                store
                    .upsert(
                        "t:",
                        id,
                        vec![(
                            EMBEDDING_FIELD.to_string(),
                            FieldValue::Blob(embedding_to_bytes(&v)),
                        )],
                    )
                    .await
                    .unwrap();
            }
            let matches = store.knn("test_idx", &[1.0, 0.0], 2, None).await.unwrap();
            assert_eq!(matches[0].id, "near");
            assert_eq!(matches[1].id, "far");
        }

        #[tokio::test]
        async fn knn_tag_filter_is_conjunctive() {
            let store = MemoryVectorStore::new();
            store.ensure_index(&schema(2)).await.unwrap();
            let v = vec![1.0f32, 0.0];
            for (id, workflow) in [("a", "QuickQuoteWorkflow"), ("b", "Default")] {
                store
                    .upsert(
                        "t:",
                        id,
                        vec![
                            (
                                EMBEDDING_FIELD.to_string(),
                                FieldValue::Blob(embedding_to_bytes(&v)),
                            ),
                            (
                                "workflow".to_string(),
                                FieldValue::Text(workflow.to_string()),
                            ),
                        ],
                    )
                    .await
                    .unwrap();
            }
            let filter = vec![("workflow".to_string(), "Default".to_string())];
            let matches = store
                .knn("test_idx", &v, 5, Some(&filter))
                .await
                .unwrap();
            assert_eq!(matches.len(), 1);
            assert_eq!(matches[0].id, "b");
        }

        #[tokio::test]
        async fn scan_lists_ids_under_prefix() {
            let store = MemoryVectorStore::new();
            for id in ["x", "y"] {
                store
                    .upsert(
                        "t:",
                        id,
                        vec![("f".to_string(), FieldValue::Text("v".to_string()))],
                    )
                    .await
                    .unwrap();
            }
            store
                .upsert(
                    "other:",
                    "z",
                    vec![("f".to_string(), FieldValue::Text("v".to_string()))],
                )
                .await
                .unwrap();
            let ids = store.scan("t:").await.unwrap();
            assert_eq!(ids, vec!["x".to_string(), "y".to_string()]);
        }

        #[tokio::test]
        async fn delete_removes_key() {
            let store = MemoryVectorStore::new();
            store
                .upsert(
                    "t:",
                    "1",
                    vec![("f".to_string(), FieldValue::Text("v".to_string()))],
                )
                .await
                .unwrap();
            store.delete("t:", "1").await.unwrap();
            assert!(store.get("t:", "1").await.unwrap().is_none());
        }
    }

    mod reply_parse_tests {
        use super::*;

        #[test]
        fn parses_ft_search_shape() {
            let reply = redis::Value::Bulk(vec![
                redis::Value::Int(1),
                redis::Value::Data(b"semcache:abc".to_vec()),
                redis::Value::Bulk(vec![
                    redis::Value::Data(b"dist".to_vec()),
                    redis::Value::Data(b"0.08".to_vec()),
                    redis::Value::Data(b"query".to_vec()),
                    redis::Value::Data(b"price of AAPL".to_vec()),
                ]),
            ]);
            let matches = parse_search_reply(reply).unwrap();
            assert_eq!(matches.len(), 1);
            assert_eq!(matches[0].id, "semcache:abc");
            assert!((matches[0].similarity - 0.92).abs() < 1e-6);
            assert_eq!(
                field_str(&matches[0].fields, "query").as_deref(),
                Some("price of AAPL")
            );
        }

        #[test]
        fn empty_reply_is_empty() {
            let reply = redis::Value::Bulk(vec![redis::Value::Int(0)]);
            assert!(parse_search_reply(reply).unwrap().is_empty());
        }

        #[test]
        fn tag_escaping_covers_specials() {
            assert_eq!(escape_tag("BRK.B"), "BRK\\.B");
            assert_eq!(escape_tag("plain_tag1"), "plain_tag1");
        }
    }
}
