use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::config::LlmConfig;
use crate::errors::CoreError;
use crate::models::ChatMessage;
use crate::pricing;
use crate::vector::{
    bytes_to_embedding, embedding_to_bytes, field_i64, field_str, FieldValue, VectorStore,
};

// ============================================================
// LLM Provider Surface
// ============================================================
//
// Chat + embeddings behind one trait. Transport details (keys,
// endpoints) live here; retries do not — the dispatcher never
// retries provider calls.
// ============================================================

/// First 16 hex chars of sha256. All store keys derive from this.
pub fn stable_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let hash = hex::encode(hasher.finalize());
    hash[..16].to_string()
}

#[derive(Debug, Clone, Default)]
pub struct ChatParams {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ChatCompletion {
    pub text: String,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat_complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        params: &ChatParams,
    ) -> Result<ChatCompletion, CoreError>;

    async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>, CoreError>;
}

/// OpenAI-compatible HTTP client (chat + embeddings).
pub struct HttpLlmClient {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpLlmClient {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(120))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.post(format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn chat_complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        params: &ChatParams,
    ) -> Result<ChatCompletion, CoreError> {
        let mut body = serde_json::json!({
            "model": model,
            "messages": messages,
        });
        if let Some(t) = params.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        if let Some(n) = params.max_tokens {
            body["max_tokens"] = serde_json::json!(n);
        }

        let response = self
            .request("/chat/completions")
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::ProviderUnavailable(format!("chat request: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(CoreError::ProviderUnavailable(format!(
                "chat endpoint {}: {}",
                status, error_text
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CoreError::ProviderUnavailable(format!("chat response: {}", e)))?;

        let text = json["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        Ok(ChatCompletion {
            text,
            input_tokens: json["usage"]["prompt_tokens"].as_u64(),
            output_tokens: json["usage"]["completion_tokens"].as_u64(),
        })
    }

    async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>, CoreError> {
        let body = serde_json::json!({
            "model": model,
            "input": text,
        });

        let response = self
            .request("/embeddings")
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::ProviderUnavailable(format!("embedding request: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(CoreError::ProviderUnavailable(format!(
                "embedding endpoint {}: {}",
                status, error_text
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CoreError::ProviderUnavailable(format!("embedding response: {}", e)))?;

        let embedding: Vec<f32> = json["data"][0]["embedding"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_f64().map(|f| f as f32))
                    .collect()
            })
            .unwrap_or_default();

        if embedding.is_empty() {
            return Err(CoreError::ProviderUnavailable(
                "embedding response carried no vector".to_string(),
            ));
        }
        Ok(embedding)
    }
}

// ============================================================
// Embedding Service (hash-keyed KV cache in front of embed)
// ============================================================

const EMB_PREFIX: &str = "emb:";
const EMB_TTL_SECONDS: i64 = 7 * 24 * 3600;

#[derive(Debug, Clone)]
pub struct EmbeddingResult {
    pub vector: Vec<f32>,
    pub cache_hit: bool,
    pub tokens: u64,
    pub cost_usd: f64,
}

pub struct EmbeddingService {
    llm: Arc<dyn LlmClient>,
    store: Arc<dyn VectorStore>,
    model: String,
    expected_dim: usize,
}

impl EmbeddingService {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        store: Arc<dyn VectorStore>,
        model: impl Into<String>,
        expected_dim: usize,
    ) -> Self {
        Self {
            llm,
            store,
            model: model.into(),
            expected_dim,
        }
    }

    /// Embed without consulting the KV cache. The request path uses this:
    /// every query embedding is billed, so cost reports stay honest even
    /// on exact repeats.
    pub async fn embed_fresh(&self, text: &str) -> Result<EmbeddingResult, CoreError> {
        let vector = self.llm.embed(&self.model, text).await?;
        if vector.len() != self.expected_dim {
            return Err(CoreError::ProviderUnavailable(format!(
                "embedding dimension {} does not match configured {}",
                vector.len(),
                self.expected_dim
            )));
        }
        let tokens = pricing::count_tokens(&self.model, text);
        Ok(EmbeddingResult {
            vector,
            cache_hit: false,
            tokens,
            cost_usd: pricing::embedding_cost(&self.model, tokens),
        })
    }

    /// Embed with the KV cache in front. Hits cost nothing; misses bill the
    /// provider call and write back fire-and-forget. Tool-side embeddings
    /// (document search) come through here.
    pub async fn embed_cached(&self, text: &str) -> Result<EmbeddingResult, CoreError> {
        let key = stable_hash(text);

        if let Ok(Some(fields)) = self.store.get(EMB_PREFIX, &key).await {
            let fresh = field_i64(&fields, "created_at")
                .map(|ms| chrono::Utc::now().timestamp_millis() - ms < EMB_TTL_SECONDS * 1000)
                .unwrap_or(false);
            if fresh {
                if let Some(encoded) = field_str(&fields, "vector") {
                    use base64::Engine;
                    if let Ok(bytes) =
                        base64::engine::general_purpose::STANDARD.decode(encoded.as_bytes())
                    {
                        let vector = bytes_to_embedding(&bytes);
                        if vector.len() == self.expected_dim {
                            tracing::debug!("⚡ embedding cache hit for {}", key);
                            return Ok(EmbeddingResult {
                                vector,
                                cache_hit: true,
                                tokens: 0,
                                cost_usd: 0.0,
                            });
                        }
                    }
                }
            }
        }

        let vector = self.llm.embed(&self.model, text).await?;
        if vector.len() != self.expected_dim {
            return Err(CoreError::ProviderUnavailable(format!(
                "embedding dimension {} does not match configured {}",
                vector.len(),
                self.expected_dim
            )));
        }

        let tokens = pricing::count_tokens(&self.model, text);
        let cost_usd = pricing::embedding_cost(&self.model, tokens);

        // Write back without blocking the request.
        let store = self.store.clone();
        let vector_clone = vector.clone();
        tokio::spawn(async move {
            use base64::Engine;
            let encoded = base64::engine::general_purpose::STANDARD
                .encode(embedding_to_bytes(&vector_clone));
            let fields = vec![
                ("vector".to_string(), FieldValue::Text(encoded)),
                (
                    "created_at".to_string(),
                    FieldValue::Number(chrono::Utc::now().timestamp_millis() as f64),
                ),
            ];
            if let Err(e) = store.upsert(EMB_PREFIX, &key, fields).await {
                tracing::debug!("embedding cache write skipped: {}", e);
            }
        });

        Ok(EmbeddingResult {
            vector,
            cache_hit: false,
            tokens,
            cost_usd,
        })
    }
}

// ============================================================
// Test Support
// ============================================================

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex;

    /// Scriptable LLM for tests: queued replies, per-text embeddings,
    /// optional failure and latency injection.
    pub struct MockLlm {
        replies: Mutex<VecDeque<String>>,
        default_reply: String,
        embeddings: Mutex<HashMap<String, Vec<f32>>>,
        pub fail_chat: AtomicBool,
        pub fail_embed: AtomicBool,
        pub chat_delay_ms: AtomicU64,
        /// When set, only chats whose messages mention this marker sleep.
        pub slow_on: Mutex<Option<String>>,
        pub chat_calls: AtomicU64,
        pub embed_calls: AtomicU64,
    }

    impl MockLlm {
        pub fn new() -> Self {
            Self {
                replies: Mutex::new(VecDeque::new()),
                default_reply: "mock reply".to_string(),
                embeddings: Mutex::new(HashMap::new()),
                fail_chat: AtomicBool::new(false),
                fail_embed: AtomicBool::new(false),
                chat_delay_ms: AtomicU64::new(0),
                slow_on: Mutex::new(None),
                chat_calls: AtomicU64::new(0),
                embed_calls: AtomicU64::new(0),
            }
        }

        pub fn with_default_reply(reply: impl Into<String>) -> Self {
            let mut mock = Self::new();
            mock.default_reply = reply.into();
            mock
        }

        pub fn push_reply(&self, reply: impl Into<String>) {
            self.replies.lock().unwrap().push_back(reply.into());
        }

        pub fn set_embedding(&self, text: impl Into<String>, vector: Vec<f32>) {
            self.embeddings.lock().unwrap().insert(text.into(), vector);
        }

        /// Deterministic pseudo-embedding: 8 dims from sha256 of the text.
        fn hash_embedding(text: &str) -> Vec<f32> {
            let mut hasher = Sha256::new();
            hasher.update(text.as_bytes());
            let digest = hasher.finalize();
            digest[..8]
                .iter()
                .map(|b| (*b as f32 / 255.0) * 2.0 - 1.0)
                .collect()
        }
    }

    #[async_trait]
    impl LlmClient for MockLlm {
        async fn chat_complete(
            &self,
            _model: &str,
            messages: &[ChatMessage],
            _params: &ChatParams,
        ) -> Result<ChatCompletion, CoreError> {
            self.chat_calls.fetch_add(1, Ordering::SeqCst);
            let delay = self.chat_delay_ms.load(Ordering::SeqCst);
            let applies = match self.slow_on.lock().unwrap().as_ref() {
                Some(marker) => messages.iter().any(|m| m.content.contains(marker)),
                None => true,
            };
            if delay > 0 && applies {
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            }
            if self.fail_chat.load(Ordering::SeqCst) {
                return Err(CoreError::ProviderUnavailable("mock chat down".to_string()));
            }
            let text = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.default_reply.clone());
            Ok(ChatCompletion {
                text,
                input_tokens: None,
                output_tokens: None,
            })
        }

        async fn embed(&self, _model: &str, text: &str) -> Result<Vec<f32>, CoreError> {
            self.embed_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_embed.load(Ordering::SeqCst) {
                return Err(CoreError::ProviderUnavailable(
                    "mock embeddings down".to_string(),
                ));
            }
            if let Some(v) = self.embeddings.lock().unwrap().get(text) {
                return Ok(v.clone());
            }
            Ok(Self::hash_embedding(text))
        }
    }
}
