use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::errors::CoreError;
use crate::llm::EmbeddingService;
use crate::models::ToolInvocation;
use crate::tool_cache::ToolCache;
use crate::vector::{field_str, VectorStore};

// ============================================================
// Agent Tools
// ============================================================
//
// Data fetchers the agents call. Live data comes from the
// market-data HTTP service; when it is unreachable each tool
// degrades to a deterministic synthetic answer flagged
// "synthetic": true, so the pipeline keeps moving. Tools never
// charge LLM cost; the runner records size and timing.
// ============================================================

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    async fn run(&self, params: &serde_json::Value) -> Result<serde_json::Value, CoreError>;
}

/// Shared HTTP client for the market-data service.
pub struct MarketDataClient {
    base_url: String,
    client: reqwest::Client,
}

impl MarketDataClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    async fn get_json(&self, path: &str) -> Option<serde_json::Value> {
        let url = format!("{}{}", self.base_url, path);
        match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => response.json().await.ok(),
            Ok(response) => {
                tracing::warn!("market data {} returned {}", path, response.status());
                None
            }
            Err(e) => {
                tracing::warn!("market data {} unreachable: {}", path, e);
                None
            }
        }
    }
}

/// Deterministic per-(seed, UTC day) pseudo-random in [0, bound).
fn day_hash(seed: &str, bound: u64) -> u64 {
    let day = chrono::Utc::now().format("%Y-%m-%d").to_string();
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(day.as_bytes());
    let digest = hasher.finalize();
    let mut value = 0u64;
    for byte in &digest[..8] {
        value = (value << 8) | *byte as u64;
    }
    value % bound
}

fn ticker_param(params: &serde_json::Value) -> Result<String, CoreError> {
    params["ticker"]
        .as_str()
        .map(|t| t.to_uppercase())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| CoreError::InvalidRequest("tool requires a 'ticker' parameter".into()))
}

// ── market_quote ──────────────────────────────────────────

pub struct MarketQuoteTool {
    client: Arc<MarketDataClient>,
}

impl MarketQuoteTool {
    pub fn new(client: Arc<MarketDataClient>) -> Self {
        Self { client }
    }

    pub fn synthetic_quote(ticker: &str) -> serde_json::Value {
        let price = 20.0 + day_hash(ticker, 48_000) as f64 / 100.0;
        let change = day_hash(&format!("chg:{}", ticker), 1000) as f64 / 100.0 - 5.0;
        serde_json::json!({
            "ticker": ticker,
            "price": (price * 100.0).round() / 100.0,
            "change_percent": (change * 100.0).round() / 100.0,
            "volume": 100_000 + day_hash(&format!("vol:{}", ticker), 10_000_000),
            "synthetic": true,
        })
    }
}

#[async_trait]
impl Tool for MarketQuoteTool {
    fn name(&self) -> &str {
        "market_quote"
    }

    fn description(&self) -> &str {
        "Current price, change and volume for a ticker"
    }

    async fn run(&self, params: &serde_json::Value) -> Result<serde_json::Value, CoreError> {
        let ticker = ticker_param(params)?;
        if let Some(mut quote) = self.client.get_json(&format!("/quote/{}", ticker)).await {
            quote["synthetic"] = serde_json::json!(false);
            return Ok(quote);
        }
        Ok(Self::synthetic_quote(&ticker))
    }
}

// ── news_search ───────────────────────────────────────────

pub struct NewsSearchTool {
    client: Arc<MarketDataClient>,
}

impl NewsSearchTool {
    pub fn new(client: Arc<MarketDataClient>) -> Self {
        Self { client }
    }

    fn synthetic_news(topic: &str) -> serde_json::Value {
        // Sentiment in [-1, 1], stable for the day.
        let sentiment = day_hash(&format!("news:{}", topic), 2000) as f64 / 1000.0 - 1.0;
        serde_json::json!({
            "topic": topic,
            "headlines": [
                format!("{} in focus as traders weigh guidance", topic),
                format!("Analysts split on {} outlook", topic),
                format!("{} volume ticks up ahead of earnings", topic),
            ],
            "sentiment_score": (sentiment * 1000.0).round() / 1000.0,
            "synthetic": true,
        })
    }
}

#[async_trait]
impl Tool for NewsSearchTool {
    fn name(&self) -> &str {
        "news_search"
    }

    fn description(&self) -> &str {
        "Recent headlines and aggregate sentiment for a topic"
    }

    async fn run(&self, params: &serde_json::Value) -> Result<serde_json::Value, CoreError> {
        let topic = params["query"]
            .as_str()
            .or_else(|| params["ticker"].as_str())
            .unwrap_or_default()
            .to_string();
        if topic.is_empty() {
            return Err(CoreError::InvalidRequest(
                "news_search requires 'query' or 'ticker'".into(),
            ));
        }
        if let Some(mut news) = self
            .client
            .get_json(&format!("/news?q={}", topic.replace(' ', "+")))
            .await
        {
            news["synthetic"] = serde_json::json!(false);
            return Ok(news);
        }
        Ok(Self::synthetic_news(&topic))
    }
}

// ── fundamentals ──────────────────────────────────────────

pub struct FundamentalsTool {
    client: Arc<MarketDataClient>,
}

impl FundamentalsTool {
    pub fn new(client: Arc<MarketDataClient>) -> Self {
        Self { client }
    }

    fn synthetic_fundamentals(ticker: &str) -> serde_json::Value {
        serde_json::json!({
            "ticker": ticker,
            "pe_ratio": 8.0 + day_hash(&format!("pe:{}", ticker), 400) as f64 / 10.0,
            "market_cap_b": 1 + day_hash(&format!("cap:{}", ticker), 3000),
            "revenue_growth_percent": day_hash(&format!("rev:{}", ticker), 400) as f64 / 10.0 - 10.0,
            "synthetic": true,
        })
    }
}

#[async_trait]
impl Tool for FundamentalsTool {
    fn name(&self) -> &str {
        "fundamentals"
    }

    fn description(&self) -> &str {
        "Valuation and growth fundamentals for a ticker"
    }

    async fn run(&self, params: &serde_json::Value) -> Result<serde_json::Value, CoreError> {
        let ticker = ticker_param(params)?;
        if let Some(mut data) = self
            .client
            .get_json(&format!("/fundamentals/{}", ticker))
            .await
        {
            data["synthetic"] = serde_json::json!(false);
            return Ok(data);
        }
        Ok(Self::synthetic_fundamentals(&ticker))
    }
}

// ── document_search ───────────────────────────────────────

/// Semantic retrieval over the docs index. The index is populated by an
/// external ingestion pipeline; an empty or missing index yields no results
/// rather than an error.
pub struct DocumentSearchTool {
    store: Arc<dyn VectorStore>,
    embedder: Arc<EmbeddingService>,
}

pub const DOCS_INDEX: &str = "docs";
pub const DOCS_PREFIX: &str = "doc:";

impl DocumentSearchTool {
    pub fn new(store: Arc<dyn VectorStore>, embedder: Arc<EmbeddingService>) -> Self {
        Self { store, embedder }
    }
}

#[async_trait]
impl Tool for DocumentSearchTool {
    fn name(&self) -> &str {
        "document_search"
    }

    fn description(&self) -> &str {
        "Semantic search over ingested research documents"
    }

    async fn run(&self, params: &serde_json::Value) -> Result<serde_json::Value, CoreError> {
        let query = params["query"].as_str().unwrap_or_default();
        if query.is_empty() {
            return Err(CoreError::InvalidRequest(
                "document_search requires 'query'".into(),
            ));
        }
        let embedding = self.embedder.embed_cached(query).await?;
        let matches = match self.store.knn(DOCS_INDEX, &embedding.vector, 3, None).await {
            Ok(matches) => matches,
            Err(e) => {
                tracing::warn!("document search degraded: {}", e);
                Vec::new()
            }
        };
        let documents: Vec<serde_json::Value> = matches
            .iter()
            .map(|m| {
                serde_json::json!({
                    "id": m.id,
                    "similarity": m.similarity,
                    "content": field_str(&m.fields, "content").unwrap_or_default(),
                })
            })
            .collect();
        Ok(serde_json::json!({ "documents": documents }))
    }
}

// ============================================================
// Cached Tool Runner
// ============================================================

pub struct ToolRunner {
    cache: Arc<ToolCache>,
}

impl ToolRunner {
    pub fn new(cache: Arc<ToolCache>) -> Self {
        Self { cache }
    }

    /// Execute a tool through the result cache, producing the invocation
    /// record alongside the value. Cache failures degrade to a live call.
    pub async fn run(
        &self,
        tool: &dyn Tool,
        params: &serde_json::Value,
    ) -> (Result<serde_json::Value, CoreError>, ToolInvocation) {
        let started = std::time::Instant::now();

        match self.cache.get(tool.name(), params).await {
            Ok(Some(raw)) => {
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(&raw) {
                    let invocation = ToolInvocation {
                        tool_name: tool.name().to_string(),
                        parameters: params.clone(),
                        duration_ms: started.elapsed().as_secs_f64() * 1000.0,
                        cache_hit: true,
                        similarity: None,
                        result_size_bytes: raw.len() as u64,
                        status: "success".to_string(),
                    };
                    return (Ok(value), invocation);
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("tool cache read degraded: {}", e),
        }

        let result = tool.run(params).await;
        let (status, size) = match &result {
            Ok(value) => {
                let raw = value.to_string();
                if let Err(e) = self.cache.put(tool.name(), params, &raw).await {
                    tracing::warn!("tool cache write skipped: {}", e);
                }
                ("success".to_string(), raw.len() as u64)
            }
            Err(_) => ("error".to_string(), 0),
        };

        let invocation = ToolInvocation {
            tool_name: tool.name().to_string(),
            parameters: params.clone(),
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
            cache_hit: false,
            similarity: None,
            result_size_bytes: size,
            status,
        };
        (result, invocation)
    }
}

// ============================================================
// Tests
// ============================================================
