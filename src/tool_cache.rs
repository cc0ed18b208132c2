use std::sync::Arc;

use crate::errors::CoreError;
use crate::llm::stable_hash;
use crate::vector::{field_i64, field_str, FieldValue, VectorStore};

// ============================================================
// Tool Result Cache
// ============================================================
//
// Exact-key only: stable hash of (tool_name, canonical params).
// TTLs are chosen per tool class; reads past expiry are misses
// and physical eviction is the store's problem.
// ============================================================

pub const TOOL_PREFIX: &str = "toolcache:";

/// TTL per tool class, seconds.
const TOOL_TTLS: &[(&str, u64)] = &[
    ("market_quote", 300),
    ("news_search", 3600),
    ("fundamentals", 86_400),
    ("document_search", 3600),
];

pub fn ttl_for_tool(tool_name: &str, default_ttl: u64) -> u64 {
    TOOL_TTLS
        .iter()
        .find(|(name, _)| *name == tool_name)
        .map(|(_, ttl)| *ttl)
        .unwrap_or(default_ttl)
}

/// Canonical JSON: object keys sorted recursively, integral floats
/// written as integers. Key stability is the whole point.
pub fn canonical_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        serde_json::Value::Number(n) => {
            // 1.0 and 1 must hash identically.
            if let Some(f) = n.as_f64() {
                if f.fract() == 0.0 && f.abs() < 9.0e15 {
                    out.push_str(&format!("{}", f as i64));
                    return;
                }
            }
            out.push_str(&n.to_string());
        }
        other => out.push_str(&other.to_string()),
    }
}

pub fn cache_key(tool_name: &str, parameters: &serde_json::Value) -> String {
    stable_hash(&format!("{}:{}", tool_name, canonical_json(parameters)))
}

pub struct ToolCache {
    store: Arc<dyn VectorStore>,
    default_ttl_seconds: u64,
}

impl ToolCache {
    pub fn new(store: Arc<dyn VectorStore>, default_ttl_seconds: u64) -> Self {
        Self {
            store,
            default_ttl_seconds,
        }
    }

    /// Exact-key read; expired entries behave as misses.
    pub async fn get(
        &self,
        tool_name: &str,
        parameters: &serde_json::Value,
    ) -> Result<Option<String>, CoreError> {
        let key = cache_key(tool_name, parameters);
        let fields = match self.store.get(TOOL_PREFIX, &key).await? {
            Some(fields) => fields,
            None => return Ok(None),
        };
        let expires_at = field_i64(&fields, "expires_at").unwrap_or(0);
        if chrono::Utc::now().timestamp_millis() >= expires_at {
            return Ok(None);
        }
        Ok(field_str(&fields, "value"))
    }

    pub async fn put(
        &self,
        tool_name: &str,
        parameters: &serde_json::Value,
        value: &str,
    ) -> Result<(), CoreError> {
        let ttl = ttl_for_tool(tool_name, self.default_ttl_seconds);
        self.put_with_ttl(tool_name, parameters, value, ttl).await
    }

    pub async fn put_with_ttl(
        &self,
        tool_name: &str,
        parameters: &serde_json::Value,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<(), CoreError> {
        let key = cache_key(tool_name, parameters);
        let expires_at = chrono::Utc::now().timestamp_millis() + (ttl_seconds as i64) * 1000;
        self.store
            .upsert(
                TOOL_PREFIX,
                &key,
                vec![
                    ("value".to_string(), FieldValue::Text(value.to_string())),
                    (
                        "expires_at".to_string(),
                        FieldValue::Number(expires_at as f64),
                    ),
                    ("tool".to_string(), FieldValue::Text(tool_name.to_string())),
                ],
            )
            .await
    }
}

// ============================================================
// Tests
// ============================================================
