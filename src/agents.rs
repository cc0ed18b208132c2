use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::CoreError;
use crate::llm::{ChatParams, LlmClient};
use crate::metrics::MetricsCollector;
use crate::models::{
    AgentExecutionRecord, AgentOutput, AgentStatus, ChatMessage, EventStatus, HandoffDirective,
    StructuredPayload, TokenUsage, UserContext,
};
use crate::pricing;
use crate::tools::{Tool, ToolRunner};

// ============================================================
// Agent Runtime
// ============================================================
//
// Agents are polymorphic over {instructions, tools, invoke}.
// The runtime wraps every invocation: start event, per-agent
// timeout, end event, execution record. Agent faults are
// captured into the record, never raised past the runtime.
// ============================================================

/// What an agent sees when invoked: the query, the requesting user's
/// context, and prior task outputs keyed by outputs_key.
#[derive(Clone, Default)]
pub struct AgentContext {
    pub query: String,
    pub ticker: Option<String>,
    pub params: HashMap<String, serde_json::Value>,
    pub user: Option<UserContext>,
    pub task_outputs: Vec<(String, String)>,
}

impl AgentContext {
    pub fn with_output(&self, key: &str, text: &str) -> Self {
        let mut next = self.clone();
        next.task_outputs.push((key.to_string(), text.to_string()));
        next
    }

    /// Ticker from the request, or the first uppercase token in the query.
    pub fn resolve_ticker(&self) -> Option<String> {
        if let Some(t) = &self.ticker {
            if !t.is_empty() {
                return Some(t.to_uppercase());
            }
        }
        extract_ticker(&self.query)
    }

    /// Context block injected into every agent prompt.
    fn render(&self) -> String {
        let mut block = String::new();
        if let Some(user) = &self.user {
            block.push_str(&format!(
                "User risk tolerance: {:?}\n",
                user.profile.risk_tolerance
            ));
            if !user.profile.portfolio.is_empty() {
                let holdings: Vec<String> = user
                    .profile
                    .portfolio
                    .iter()
                    .map(|p| format!("{} x{}", p.ticker, p.shares))
                    .collect();
                block.push_str(&format!("Holdings: {}\n", holdings.join(", ")));
            }
            if !user.profile.watchlist.is_empty() {
                let watch: Vec<&str> =
                    user.profile.watchlist.iter().map(|s| s.as_str()).collect();
                block.push_str(&format!("Watchlist: {}\n", watch.join(", ")));
            }
            for turn in user.recent_turns.iter().rev().take(5).rev() {
                let role = match turn.role {
                    crate::models::TurnRole::User => "user",
                    crate::models::TurnRole::Assistant => "assistant",
                };
                block.push_str(&format!("[{}] {}\n", role, turn.text));
            }
        }
        for (key, text) in &self.task_outputs {
            block.push_str(&format!("Prior result ({}): {}\n", key, text));
        }
        block
    }
}

pub fn extract_ticker(query: &str) -> Option<String> {
    let re = regex::Regex::new(r"\b[A-Z]{2,5}\b").expect("ticker pattern compiles");
    re.find(query).map(|m| m.as_str().to_string())
}

#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;
    fn instructions(&self) -> &str;
    fn model(&self) -> &str;
    fn tools(&self) -> &[Arc<dyn Tool>];
    async fn invoke(&self, ctx: &AgentContext) -> Result<AgentOutput, CoreError>;
}

// ============================================================
// LLM-backed Agents
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentKind {
    MarketData,
    NewsSentiment,
    Fundamentals,
    Portfolio,
    Risk,
    Triage,
    Synthesis,
    General,
}

const MARKET_DATA_INSTRUCTIONS: &str = "You are a market data specialist. Report the current \
price, daily change and volume for the requested ticker from the tool results. Be precise and \
numeric; do not speculate beyond the data.";

const NEWS_SENTIMENT_INSTRUCTIONS: &str = "You are a financial news analyst. Summarize the \
supplied headlines and state the overall sentiment as bullish, bearish or neutral with a one-line \
justification.";

const FUNDAMENTALS_INSTRUCTIONS: &str = "You are a fundamentals analyst. Interpret valuation and \
growth figures from the tool results: P/E, market cap, revenue growth. Keep it to a short \
paragraph.";

const PORTFOLIO_INSTRUCTIONS: &str = "You are a portfolio analyst. Review the user's holdings \
from the context block: concentration, notable positions, anything that stands out. Do not invent \
holdings that are not listed.";

const RISK_INSTRUCTIONS: &str = "You are a risk analyst. Given the prior results and the user's \
risk tolerance, assess the risk level (low, moderate or high) and name the main risk factors.";

const TRIAGE_INSTRUCTIONS: &str = "You are a research coordinator. Decide which specialist should \
work next: NewsSentimentAgent, FundamentalsAgent or MarketDataAgent. Reply with JSON only: \
{\"next_agent\": \"<id>\"} to delegate, or {\"done\": true} when the gathered results answer the \
question.";

const SYNTHESIS_INSTRUCTIONS: &str = "You are the lead analyst. Combine the prior results from \
the context block into one clear, direct answer to the user's question. Lead with the conclusion.";

const GENERAL_INSTRUCTIONS: &str = "You are a helpful financial assistant. Answer the user's \
question directly and note when a question falls outside market data you can see.";

pub struct LlmAgent {
    id: String,
    kind: AgentKind,
    instructions: &'static str,
    model: String,
    tools: Vec<Arc<dyn Tool>>,
    llm: Arc<dyn LlmClient>,
    runner: Arc<ToolRunner>,
}

impl LlmAgent {
    fn params_for_tool(&self, tool_name: &str, ctx: &AgentContext) -> Option<serde_json::Value> {
        match tool_name {
            "market_quote" | "fundamentals" => ctx
                .resolve_ticker()
                .map(|t| serde_json::json!({ "ticker": t })),
            "news_search" => {
                let topic = ctx.resolve_ticker().unwrap_or_else(|| ctx.query.clone());
                Some(serde_json::json!({ "query": topic }))
            }
            "document_search" => Some(serde_json::json!({ "query": ctx.query })),
            _ => None,
        }
    }

    fn build_messages(
        &self,
        ctx: &AgentContext,
        tool_results: &[(String, serde_json::Value)],
    ) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(self.instructions)];
        let context_block = ctx.render();
        if !context_block.is_empty() {
            messages.push(ChatMessage::system(format!("Context:\n{}", context_block)));
        }
        if !tool_results.is_empty() {
            let rendered: Vec<String> = tool_results
                .iter()
                .map(|(name, value)| format!("{}: {}", name, value))
                .collect();
            messages.push(ChatMessage::system(format!(
                "Tool results:\n{}",
                rendered.join("\n")
            )));
        }
        messages.push(ChatMessage::user(ctx.query.clone()));
        messages
    }

    fn derive_structured(
        &self,
        reply: &str,
        tool_results: &[(String, serde_json::Value)],
        ctx: &AgentContext,
    ) -> Option<StructuredPayload> {
        match self.kind {
            AgentKind::MarketData => {
                let quote = tool_results
                    .iter()
                    .find(|(name, _)| name == "market_quote")
                    .map(|(_, v)| v)?;
                Some(StructuredPayload::MarketQuote {
                    ticker: quote["ticker"].as_str()?.to_string(),
                    price: quote["price"].as_f64()?,
                    change_percent: quote["change_percent"].as_f64().unwrap_or(0.0),
                    volume: quote["volume"].as_u64(),
                    synthetic: quote["synthetic"].as_bool().unwrap_or(false),
                })
            }
            AgentKind::NewsSentiment => {
                let news = tool_results
                    .iter()
                    .find(|(name, _)| name == "news_search")
                    .map(|(_, v)| v)?;
                Some(StructuredPayload::SentimentScore {
                    ticker: ctx.resolve_ticker(),
                    score: news["sentiment_score"].as_f64().unwrap_or(0.0),
                    headline_count: news["headlines"].as_array().map(|a| a.len() as u64),
                })
            }
            AgentKind::Risk => {
                let lowered = reply.to_lowercase();
                let risk_level = if lowered.contains("high") {
                    "high"
                } else if lowered.contains("low") {
                    "low"
                } else {
                    "moderate"
                };
                let mut factors: Vec<String> =
                    ctx.task_outputs.iter().map(|(k, _)| k.clone()).collect();
                if factors.is_empty() {
                    factors.push("market volatility".to_string());
                }
                Some(StructuredPayload::RiskReport {
                    risk_level: risk_level.to_string(),
                    factors,
                })
            }
            AgentKind::Triage => parse_handoff(reply).map(StructuredPayload::Handoff),
            _ => None,
        }
    }
}

/// Pull a handoff directive out of an LLM reply that may wrap the JSON in
/// prose or code fences.
pub fn parse_handoff(reply: &str) -> Option<HandoffDirective> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&reply[start..=end]).ok()
}

#[async_trait]
impl Agent for LlmAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn instructions(&self) -> &str {
        self.instructions
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn tools(&self) -> &[Arc<dyn Tool>] {
        &self.tools
    }

    async fn invoke(&self, ctx: &AgentContext) -> Result<AgentOutput, CoreError> {
        let mut tool_results = Vec::new();
        let mut invocations = Vec::new();
        for tool in &self.tools {
            let params = match self.params_for_tool(tool.name(), ctx) {
                Some(params) => params,
                None => continue,
            };
            let (result, invocation) = self.runner.run(tool.as_ref(), &params).await;
            invocations.push(invocation);
            if let Ok(value) = result {
                tool_results.push((tool.name().to_string(), value));
            }
        }

        let messages = self.build_messages(ctx, &tool_results);
        let params = ChatParams {
            temperature: Some(0.3),
            max_tokens: Some(600),
        };
        let completion = self.llm.chat_complete(&self.model, &messages, &params).await?;

        let structured = self.derive_structured(&completion.text, &tool_results, ctx);
        let raw_token_usage = match (completion.input_tokens, completion.output_tokens) {
            (Some(input_tokens), Some(output_tokens)) => Some(TokenUsage {
                input_tokens,
                output_tokens,
            }),
            _ => None,
        };

        Ok(AgentOutput {
            text: completion.text,
            structured,
            raw_token_usage,
            tools: invocations,
        })
    }
}

// ============================================================
// Agent Factory
// ============================================================

/// The tool instances agents share.
pub struct ToolSet {
    pub market_quote: Arc<dyn Tool>,
    pub news_search: Arc<dyn Tool>,
    pub fundamentals: Arc<dyn Tool>,
    pub document_search: Arc<dyn Tool>,
}

pub struct AgentFactory {
    llm: Arc<dyn LlmClient>,
    runner: Arc<ToolRunner>,
    chat_model: String,
    tools: ToolSet,
}

pub const KNOWN_AGENTS: &[&str] = &[
    "MarketDataAgent",
    "NewsSentimentAgent",
    "FundamentalsAgent",
    "PortfolioAgent",
    "RiskAssessmentAgent",
    "TriageAgent",
    "SynthesisAgent",
    "GeneralAssistantAgent",
];

impl AgentFactory {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        runner: Arc<ToolRunner>,
        chat_model: impl Into<String>,
        tools: ToolSet,
    ) -> Self {
        Self {
            llm,
            runner,
            chat_model: chat_model.into(),
            tools,
        }
    }

    pub fn build(&self, agent_id: &str) -> Option<Arc<dyn Agent>> {
        let (kind, instructions, tools): (AgentKind, &'static str, Vec<Arc<dyn Tool>>) =
            match agent_id {
                "MarketDataAgent" => (
                    AgentKind::MarketData,
                    MARKET_DATA_INSTRUCTIONS,
                    vec![self.tools.market_quote.clone()],
                ),
                "NewsSentimentAgent" => (
                    AgentKind::NewsSentiment,
                    NEWS_SENTIMENT_INSTRUCTIONS,
                    vec![self.tools.news_search.clone()],
                ),
                "FundamentalsAgent" => (
                    AgentKind::Fundamentals,
                    FUNDAMENTALS_INSTRUCTIONS,
                    vec![
                        self.tools.fundamentals.clone(),
                        self.tools.document_search.clone(),
                    ],
                ),
                "PortfolioAgent" => (
                    AgentKind::Portfolio,
                    PORTFOLIO_INSTRUCTIONS,
                    vec![self.tools.market_quote.clone()],
                ),
                "RiskAssessmentAgent" => (AgentKind::Risk, RISK_INSTRUCTIONS, vec![]),
                "TriageAgent" => (AgentKind::Triage, TRIAGE_INSTRUCTIONS, vec![]),
                "SynthesisAgent" => (AgentKind::Synthesis, SYNTHESIS_INSTRUCTIONS, vec![]),
                "GeneralAssistantAgent" => (AgentKind::General, GENERAL_INSTRUCTIONS, vec![]),
                _ => return None,
            };

        Some(Arc::new(LlmAgent {
            id: agent_id.to_string(),
            kind,
            instructions,
            model: self.chat_model.clone(),
            tools,
            llm: self.llm.clone(),
            runner: self.runner.clone(),
        }))
    }
}

// ============================================================
// Runtime
// ============================================================

pub struct AgentRuntime {
    pub agent_timeout_ms: u64,
}

impl AgentRuntime {
    pub fn new(agent_timeout_ms: u64) -> Self {
        Self { agent_timeout_ms }
    }

    /// Invoke one agent under the per-agent timeout, emitting start/end
    /// events and producing the execution record. The error (if any) is
    /// returned alongside so orchestrations can decide whether it is fatal.
    pub async fn run(
        &self,
        agent: &dyn Agent,
        ctx: &AgentContext,
        collector: &MetricsCollector,
    ) -> (AgentExecutionRecord, Result<AgentOutput, CoreError>) {
        let event_id =
            collector.start_event(&format!("agent:{}", agent.id()), agent.id(), None);
        let started_at = chrono::Utc::now().timestamp_millis();

        let outcome = tokio::time::timeout(
            std::time::Duration::from_millis(self.agent_timeout_ms),
            agent.invoke(ctx),
        )
        .await;

        let ended_at = chrono::Utc::now().timestamp_millis();
        let model = agent.model().to_string();

        // Estimated when the provider did not surface usage.
        let estimated_input = pricing::count_messages(
            &model,
            &[
                ChatMessage::system(agent.instructions()),
                ChatMessage::user(ctx.query.clone()),
            ],
        );

        let (record, result) = match outcome {
            Ok(Ok(output)) => {
                let (input_tokens, output_tokens) = match output.raw_token_usage {
                    Some(usage) => (usage.input_tokens, usage.output_tokens),
                    None => (estimated_input, pricing::count_tokens(&model, &output.text)),
                };
                let record = AgentExecutionRecord {
                    agent_id: agent.id().to_string(),
                    started_at,
                    ended_at,
                    status: AgentStatus::Success,
                    input_tokens,
                    output_tokens,
                    model: model.clone(),
                    tools: output.tools.clone(),
                    cost_usd: pricing::llm_cost(&model, input_tokens, output_tokens),
                    response_preview: preview(&output.text),
                    error_message: None,
                };
                (record, Ok(output))
            }
            Ok(Err(e)) => {
                let record = AgentExecutionRecord {
                    agent_id: agent.id().to_string(),
                    started_at,
                    ended_at,
                    status: AgentStatus::Error,
                    input_tokens: estimated_input,
                    output_tokens: 0,
                    model: model.clone(),
                    tools: vec![],
                    cost_usd: pricing::llm_cost(&model, estimated_input, 0),
                    response_preview: String::new(),
                    error_message: Some(e.to_string()),
                };
                (record, Err(e))
            }
            Err(_) => {
                let record = AgentExecutionRecord {
                    agent_id: agent.id().to_string(),
                    started_at,
                    ended_at,
                    status: AgentStatus::Timeout,
                    input_tokens: estimated_input,
                    output_tokens: 0,
                    model: model.clone(),
                    tools: vec![],
                    cost_usd: pricing::llm_cost(&model, estimated_input, 0),
                    response_preview: String::new(),
                    error_message: Some(format!("timed out after {}ms", self.agent_timeout_ms)),
                };
                (
                    record,
                    Err(CoreError::AgentTimeout {
                        agent_id: agent.id().to_string(),
                        timeout_ms: self.agent_timeout_ms,
                    }),
                )
            }
        };

        let event_status = match record.status {
            AgentStatus::Success => EventStatus::Success,
            _ => EventStatus::Error,
        };
        let _ = collector.end_event(
            event_id,
            event_status,
            Some(serde_json::json!({
                "status": record.status,
                "cost_usd": record.cost_usd,
            })),
        );

        (record, result)
    }
}

fn preview(text: &str) -> String {
    text.chars().take(120).collect()
}

// ============================================================
// Tests
// ============================================================


#[cfg(test)]
mod tests {
    use super::testkit::test_factory;
    use super::*;
    use crate::llm::mock::MockLlm;

    fn ctx(query: &str) -> AgentContext {
        AgentContext {
            query: query.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn ticker_extraction() {
        assert_eq!(
            extract_ticker("what is the price of AAPL").as_deref(),
            Some("AAPL")
        );
        assert_eq!(extract_ticker("how are markets today"), None);
        // Single letters are ignored.
        assert_eq!(extract_ticker("should I sell"), None);
    }

    #[test]
    fn handoff_parses_from_noisy_reply() {
        let d = parse_handoff("Sure — ```json\n{\"next_agent\": \"MarketDataAgent\"}\n```").unwrap();
        assert_eq!(
            d,
            HandoffDirective::Next {
                next_agent: "MarketDataAgent".to_string()
            }
        );
        assert!(parse_handoff("no json here").is_none());
    }

    #[tokio::test]
    async fn market_data_agent_returns_quote_payload() {
        let llm = Arc::new(MockLlm::with_default_reply("AAPL is trading around $231."));
        let factory = test_factory(llm);
        let agent = factory.build("MarketDataAgent").unwrap();

        let output = agent.invoke(&ctx("price of AAPL")).await.unwrap();
        assert!(!output.text.is_empty());
        assert_eq!(output.tools.len(), 1);
        assert_eq!(output.tools[0].tool_name, "market_quote");
        match output.structured {
            Some(StructuredPayload::MarketQuote { ticker, synthetic, .. }) => {
                assert_eq!(ticker, "AAPL");
                assert!(synthetic);
            }
            other => panic!("expected market quote payload, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn market_data_agent_without_ticker_skips_tool() {
        let llm = Arc::new(MockLlm::new());
        let factory = test_factory(llm);
        let agent = factory.build("MarketDataAgent").unwrap();
        let output = agent.invoke(&ctx("how are markets doing")).await.unwrap();
        assert!(output.tools.is_empty());
        assert!(output.structured.is_none());
    }

    #[tokio::test]
    async fn triage_agent_emits_handoff() {
        let llm = Arc::new(MockLlm::with_default_reply(
            r#"{"next_agent": "NewsSentimentAgent"}"#,
        ));
        let factory = test_factory(llm);
        let agent = factory.build("TriageAgent").unwrap();
        let output = agent.invoke(&ctx("research NVDA")).await.unwrap();
        assert_eq!(
            output.structured,
            Some(StructuredPayload::Handoff(HandoffDirective::Next {
                next_agent: "NewsSentimentAgent".to_string()
            }))
        );
    }

    #[tokio::test]
    async fn unknown_agent_id_builds_nothing() {
        let factory = test_factory(Arc::new(MockLlm::new()));
        assert!(factory.build("GhostAgent").is_none());
    }

    #[tokio::test]
    async fn runtime_records_success() {
        let llm = Arc::new(MockLlm::with_default_reply("fine."));
        let factory = test_factory(llm);
        let agent = factory.build("GeneralAssistantAgent").unwrap();
        let runtime = AgentRuntime::new(5000);
        let collector = MetricsCollector::new("q", "s", "u");

        let (record, result) = runtime.run(agent.as_ref(), &ctx("hello"), &collector).await;
        assert!(result.is_ok());
        assert_eq!(record.status, AgentStatus::Success);
        assert!(record.cost_usd > 0.0);
        assert!(record.input_tokens > 0);
        assert!(record.ended_at >= record.started_at);
    }

    #[tokio::test]
    async fn runtime_captures_provider_error() {
        let llm = Arc::new(MockLlm::new());
        llm.fail_chat.store(true, std::sync::atomic::Ordering::SeqCst);
        let factory = test_factory(llm);
        let agent = factory.build("GeneralAssistantAgent").unwrap();
        let runtime = AgentRuntime::new(5000);
        let collector = MetricsCollector::new("q", "s", "u");

        let (record, result) = runtime.run(agent.as_ref(), &ctx("hello"), &collector).await;
        assert!(matches!(result, Err(CoreError::ProviderUnavailable(_))));
        assert_eq!(record.status, AgentStatus::Error);
        assert!(record.error_message.is_some());
    }

    #[tokio::test]
    async fn runtime_times_out_slow_agent() {
        let llm = Arc::new(MockLlm::new());
        llm.chat_delay_ms
            .store(200, std::sync::atomic::Ordering::SeqCst);
        let factory = test_factory(llm);
        let agent = factory.build("GeneralAssistantAgent").unwrap();
        let runtime = AgentRuntime::new(20);
        let collector = MetricsCollector::new("q", "s", "u");

        let (record, result) = runtime.run(agent.as_ref(), &ctx("hello"), &collector).await;
        assert_eq!(record.status, AgentStatus::Timeout);
        assert!(matches!(result, Err(CoreError::AgentTimeout { .. })));
    }

    #[tokio::test]
    async fn risk_agent_reads_prior_outputs() {
        let llm = Arc::new(MockLlm::with_default_reply(
            "Overall this looks like a high risk setup.",
        ));
        let factory = test_factory(llm);
        let agent = factory.build("RiskAssessmentAgent").unwrap();
        let context = ctx("should i buy TSLA").with_output("market_data", "TSLA at $250, -2%");
        let output = agent.invoke(&context).await.unwrap();
        match output.structured {
            Some(StructuredPayload::RiskReport { risk_level, factors }) => {
                assert_eq!(risk_level, "high");
                assert_eq!(factors, vec!["market_data".to_string()]);
            }
            other => panic!("expected risk report, got {:?}", other),
        }
    }
}
