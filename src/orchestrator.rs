use std::sync::Arc;

use crate::agents::{AgentContext, AgentFactory, AgentRuntime};
use crate::config::OrchestrationConfig;
use crate::errors::CoreError;
use crate::metrics::MetricsCollector;
use crate::models::{
    AgentExecutionRecord, AgentOutput, AgentStatus, EventStatus, HandoffDirective,
    OrchestrationPattern, StructuredPayload, Workflow,
};

// ============================================================
// Orchestrations
// ============================================================
//
// Three scheduling disciplines over a workflow's tasks, all
// composing into a final synthesis step. Records land in the
// collector in declaration order (sequential/concurrent) or hop
// order (handoff); sub-task events interleave freely.
// ============================================================

pub struct Orchestrator {
    factory: Arc<AgentFactory>,
    agent_timeout_ms: u64,
    concurrent_cap_ms: u64,
    handoff_max_hops: usize,
}

#[derive(Debug)]
pub struct OrchestrationOutcome {
    pub records: Vec<AgentExecutionRecord>,
    /// Successful outputs in completion-relevant order, keyed by outputs_key.
    pub outputs: Vec<(String, AgentOutput)>,
    pub response_text: String,
}

impl Orchestrator {
    pub fn new(factory: Arc<AgentFactory>, config: &OrchestrationConfig) -> Self {
        Self {
            factory,
            agent_timeout_ms: config.agent_timeout_ms,
            concurrent_cap_ms: config.concurrent_cap_ms,
            handoff_max_hops: config.handoff_max_hops,
        }
    }

    fn runtime(&self) -> AgentRuntime {
        AgentRuntime::new(self.agent_timeout_ms)
    }

    pub async fn run(
        &self,
        workflow: &Workflow,
        base_ctx: &AgentContext,
        collector: &Arc<MetricsCollector>,
    ) -> Result<OrchestrationOutcome, CoreError> {
        let event_id = collector.start_event(
            "orchestration",
            &workflow.pattern.to_string(),
            Some(serde_json::json!({ "workflow": workflow.name })),
        );

        if workflow.tasks.is_empty() && workflow.synthesis.is_none() {
            collector.record_event(
                "orchestration",
                "empty_workflow",
                EventStatus::Warning,
                None,
            );
            let _ = collector.end_event(event_id, EventStatus::Warning, None);
            return Ok(OrchestrationOutcome {
                records: Vec::new(),
                outputs: Vec::new(),
                response_text: base_ctx.query.clone(),
            });
        }

        let run_result = match workflow.pattern {
            OrchestrationPattern::Sequential => {
                self.run_sequential(workflow, base_ctx, collector).await
            }
            OrchestrationPattern::Concurrent => {
                self.run_concurrent(workflow, base_ctx, collector).await
            }
            OrchestrationPattern::Handoff => self.run_handoff(workflow, base_ctx, collector).await,
        };

        let (mut records, outputs, skip_synthesis) = match run_result {
            Ok(parts) => parts,
            Err(e) => {
                let _ = collector.end_event(event_id, EventStatus::Error, None);
                return Err(e);
            }
        };

        let response_text = self
            .synthesize(workflow, base_ctx, &outputs, skip_synthesis, collector, &mut records)
            .await;

        let _ = collector.end_event(event_id, EventStatus::Success, None);
        Ok(OrchestrationOutcome {
            records,
            outputs,
            response_text,
        })
    }

    // ── Sequential ────────────────────────────────────────

    /// Declared order; every task sees prior outputs under their
    /// outputs_key. A failing required task terminates the workflow with
    /// its partial records already recorded.
    async fn run_sequential(
        &self,
        workflow: &Workflow,
        base_ctx: &AgentContext,
        collector: &Arc<MetricsCollector>,
    ) -> Result<(Vec<AgentExecutionRecord>, Vec<(String, AgentOutput)>, bool), CoreError> {
        let runtime = self.runtime();
        let mut records = Vec::new();
        let mut outputs: Vec<(String, AgentOutput)> = Vec::new();
        let mut ctx = base_ctx.clone();

        for task in &workflow.tasks {
            let agent = match self.factory.build(&task.agent_id) {
                Some(agent) => agent,
                None => {
                    let record = missing_agent_record(&task.agent_id);
                    collector.record_agent_execution(record.clone());
                    records.push(record);
                    if task.required {
                        return Err(CoreError::AgentError {
                            agent_id: task.agent_id.clone(),
                            message: "agent is not registered".to_string(),
                        });
                    }
                    continue;
                }
            };

            let (record, result) = runtime.run(agent.as_ref(), &ctx, collector).await;
            collector.record_agent_execution(record.clone());
            records.push(record);

            match result {
                Ok(output) => {
                    ctx = ctx.with_output(&task.outputs_key, &output.text);
                    outputs.push((task.outputs_key.clone(), output));
                }
                Err(e) => {
                    if task.required {
                        return Err(e);
                    }
                    collector.record_event(
                        "orchestration",
                        "optional_task_skipped",
                        EventStatus::Warning,
                        Some(serde_json::json!({ "agent": task.agent_id })),
                    );
                }
            }
        }

        Ok((records, outputs, false))
    }

    // ── Concurrent ────────────────────────────────────────

    /// True fan-out under the workflow-level cap. Tasks that do not finish
    /// before the cap are recorded with status timeout; whatever completed
    /// is returned.
    async fn run_concurrent(
        &self,
        workflow: &Workflow,
        base_ctx: &AgentContext,
        collector: &Arc<MetricsCollector>,
    ) -> Result<(Vec<AgentExecutionRecord>, Vec<(String, AgentOutput)>, bool), CoreError> {
        let task_count = workflow.tasks.len();
        let mut slots: Vec<Option<(AgentExecutionRecord, Option<AgentOutput>)>> =
            (0..task_count).map(|_| None).collect();
        let mut join_set = tokio::task::JoinSet::new();

        for (index, task) in workflow.tasks.iter().enumerate() {
            let agent = match self.factory.build(&task.agent_id) {
                Some(agent) => agent,
                None => {
                    slots[index] = Some((missing_agent_record(&task.agent_id), None));
                    continue;
                }
            };
            let ctx = base_ctx.clone();
            let collector = collector.clone();
            let runtime = self.runtime();
            join_set.spawn(async move {
                let (record, result) = runtime.run(agent.as_ref(), &ctx, &collector).await;
                (index, record, result.ok())
            });
        }

        let deadline =
            tokio::time::Instant::now() + std::time::Duration::from_millis(self.concurrent_cap_ms);
        let mut cap_hit = false;
        loop {
            match tokio::time::timeout_at(deadline, join_set.join_next()).await {
                Ok(Some(Ok((index, record, output)))) => {
                    slots[index] = Some((record, output));
                }
                Ok(Some(Err(join_error))) => {
                    tracing::warn!("concurrent task failed to join: {}", join_error);
                }
                Ok(None) => break,
                Err(_) => {
                    cap_hit = true;
                    join_set.abort_all();
                    collector.record_event(
                        "orchestration",
                        "concurrent_cap_reached",
                        EventStatus::Warning,
                        Some(serde_json::json!({ "cap_ms": self.concurrent_cap_ms })),
                    );
                    break;
                }
            }
        }

        // Declaration order: record everything, fabricate timeout records
        // for tasks the cap cut off.
        let mut records = Vec::with_capacity(task_count);
        let mut outputs = Vec::new();
        for (index, slot) in slots.into_iter().enumerate() {
            let task = &workflow.tasks[index];
            let (record, output) = match slot {
                Some(pair) => pair,
                None => {
                    let status = if cap_hit {
                        AgentStatus::Timeout
                    } else {
                        AgentStatus::Error
                    };
                    (unfinished_record(&task.agent_id, status), None)
                }
            };
            // Runtime already recorded completed agents' events; records go
            // into the collector here so ordering is deterministic.
            collector.record_agent_execution(record.clone());
            records.push(record);
            if let Some(output) = output {
                outputs.push((task.outputs_key.clone(), output));
            }
        }

        if records.iter().any(|r| r.status != AgentStatus::Success) {
            collector.record_event(
                "orchestration",
                "partial_results",
                EventStatus::Warning,
                None,
            );
        }

        Ok((records, outputs, false))
    }

    // ── Handoff ───────────────────────────────────────────

    /// Dynamic routing from a designated entry agent. Specialists hand
    /// control back to the entry agent; the entry agent's directives name
    /// the next agent or finish. Cycles are bounded by hop count only.
    async fn run_handoff(
        &self,
        workflow: &Workflow,
        base_ctx: &AgentContext,
        collector: &Arc<MetricsCollector>,
    ) -> Result<(Vec<AgentExecutionRecord>, Vec<(String, AgentOutput)>, bool), CoreError> {
        let runtime = self.runtime();
        let entry_id = workflow.tasks[0].agent_id.clone();
        let mut current_id = entry_id.clone();
        let mut records = Vec::new();
        let mut outputs: Vec<(String, AgentOutput)> = Vec::new();
        let mut ctx = base_ctx.clone();
        let mut hops = 0usize;
        let mut immediate_done = false;

        loop {
            hops += 1;
            let agent = match self.factory.build(&current_id) {
                Some(agent) => agent,
                None => {
                    let record = missing_agent_record(&current_id);
                    collector.record_agent_execution(record.clone());
                    records.push(record);
                    break;
                }
            };

            let (record, result) = runtime.run(agent.as_ref(), &ctx, collector).await;
            collector.record_agent_execution(record.clone());
            records.push(record);

            let output = match result {
                Ok(output) => output,
                Err(_) => {
                    collector.record_event(
                        "orchestration:handoff",
                        "agent_failed",
                        EventStatus::Warning,
                        Some(serde_json::json!({ "agent": current_id })),
                    );
                    break;
                }
            };

            let outputs_key = workflow
                .tasks
                .iter()
                .find(|t| t.agent_id == current_id)
                .map(|t| t.outputs_key.clone())
                .unwrap_or_else(|| current_id.clone());
            ctx = ctx.with_output(&outputs_key, &output.text);
            let directive = match &output.structured {
                Some(StructuredPayload::Handoff(directive)) => Some(directive.clone()),
                _ => None,
            };
            outputs.push((outputs_key, output));

            match directive {
                Some(HandoffDirective::Next { next_agent }) => {
                    if hops >= self.handoff_max_hops {
                        collector.record_event(
                            "orchestration:handoff",
                            "hop_cap_reached",
                            EventStatus::Warning,
                            Some(serde_json::json!({ "max_hops": self.handoff_max_hops })),
                        );
                        break;
                    }
                    if !workflow.tasks.iter().any(|t| t.agent_id == next_agent) {
                        collector.record_event(
                            "orchestration:handoff",
                            "unknown_next_agent",
                            EventStatus::Warning,
                            Some(serde_json::json!({ "next_agent": next_agent })),
                        );
                        break;
                    }
                    current_id = next_agent;
                }
                Some(directive) if directive.is_done() => {
                    if hops == 1 {
                        immediate_done = true;
                    }
                    break;
                }
                _ => {
                    // No directive. Specialists hand control back to the
                    // entry agent; the entry agent going silent ends the loop.
                    if current_id == entry_id {
                        collector.record_event(
                            "orchestration:handoff",
                            "missing_directive",
                            EventStatus::Warning,
                            Some(serde_json::json!({ "agent": current_id })),
                        );
                        break;
                    }
                    if hops >= self.handoff_max_hops {
                        collector.record_event(
                            "orchestration:handoff",
                            "hop_cap_reached",
                            EventStatus::Warning,
                            Some(serde_json::json!({ "max_hops": self.handoff_max_hops })),
                        );
                        break;
                    }
                    current_id = entry_id.clone();
                }
            }
        }

        Ok((records, outputs, immediate_done))
    }

    // ── Synthesis ─────────────────────────────────────────

    /// Condense the aggregated outputs into one answer. Without a declared
    /// synthesis agent (or after an immediately-done handoff) the last
    /// successful output is the response; with no outputs at all the query
    /// echoes back.
    async fn synthesize(
        &self,
        workflow: &Workflow,
        base_ctx: &AgentContext,
        outputs: &[(String, AgentOutput)],
        skip_synthesis: bool,
        collector: &Arc<MetricsCollector>,
        records: &mut Vec<AgentExecutionRecord>,
    ) -> String {
        let fallback = outputs
            .last()
            .map(|(_, output)| output.text.clone())
            .unwrap_or_else(|| base_ctx.query.clone());

        let synthesis_id = match (&workflow.synthesis, skip_synthesis) {
            (Some(id), false) => id.clone(),
            _ => return fallback,
        };

        let agent = match self.factory.build(&synthesis_id) {
            Some(agent) => agent,
            None => {
                collector.record_event(
                    "orchestration",
                    "synthesis_unavailable",
                    EventStatus::Warning,
                    Some(serde_json::json!({ "agent": synthesis_id })),
                );
                return fallback;
            }
        };

        let mut ctx = base_ctx.clone();
        for (key, output) in outputs {
            ctx = ctx.with_output(key, &output.text);
        }

        let (record, result) = self.runtime().run(agent.as_ref(), &ctx, collector).await;
        collector.record_agent_execution(record.clone());
        records.push(record);

        match result {
            Ok(output) => output.text,
            Err(e) => {
                collector.record_event(
                    "orchestration",
                    "synthesis_failed",
                    EventStatus::Warning,
                    Some(serde_json::json!({ "error": e.to_string() })),
                );
                fallback
            }
        }
    }
}

fn missing_agent_record(agent_id: &str) -> AgentExecutionRecord {
    let now = chrono::Utc::now().timestamp_millis();
    AgentExecutionRecord {
        agent_id: agent_id.to_string(),
        started_at: now,
        ended_at: now,
        status: AgentStatus::Error,
        input_tokens: 0,
        output_tokens: 0,
        model: String::new(),
        tools: vec![],
        cost_usd: 0.0,
        response_preview: String::new(),
        error_message: Some("agent is not registered".to_string()),
    }
}

fn unfinished_record(agent_id: &str, status: AgentStatus) -> AgentExecutionRecord {
    let now = chrono::Utc::now().timestamp_millis();
    AgentExecutionRecord {
        agent_id: agent_id.to_string(),
        started_at: now,
        ended_at: now,
        status,
        input_tokens: 0,
        output_tokens: 0,
        model: String::new(),
        tools: vec![],
        cost_usd: 0.0,
        response_preview: String::new(),
        error_message: Some("did not finish before the orchestration cap".to_string()),
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testkit::test_factory;
    use crate::llm::mock::MockLlm;
    use crate::models::AgentTaskSpec;
    use std::collections::HashMap;

    fn orchestrator(llm: Arc<MockLlm>, config: &OrchestrationConfig) -> Orchestrator {
        Orchestrator::new(Arc::new(test_factory(llm)), config)
    }

    fn config() -> OrchestrationConfig {
        OrchestrationConfig {
            agent_timeout_ms: 5000,
            concurrent_cap_ms: 5000,
            handoff_max_hops: 6,
        }
    }

    fn task(agent_id: &str, outputs_key: &str, required: bool) -> AgentTaskSpec {
        AgentTaskSpec {
            agent_id: agent_id.to_string(),
            depends_on: vec![],
            inputs: HashMap::new(),
            outputs_key: outputs_key.to_string(),
            required,
        }
    }

    fn workflow(
        pattern: OrchestrationPattern,
        tasks: Vec<AgentTaskSpec>,
        synthesis: Option<&str>,
    ) -> Workflow {
        Workflow {
            name: "TestWorkflow".to_string(),
            pattern,
            tasks,
            synthesis: synthesis.map(|s| s.to_string()),
            baseline_cost_usd: 0.05,
            route_patterns: vec![],
        }
    }

    fn ctx(query: &str) -> AgentContext {
        AgentContext {
            query: query.to_string(),
            ..Default::default()
        }
    }

    fn collector() -> Arc<MetricsCollector> {
        Arc::new(MetricsCollector::new("q", "s", "u"))
    }

    fn summary_event_names(collector: &MetricsCollector) -> Vec<String> {
        collector
            .get_summary(crate::metrics::SummaryArgs {
                query: String::new(),
                response: String::new(),
                workflow_name: String::new(),
                workflow_pattern: String::new(),
                routing_source: String::new(),
                routing_time_ms: 0.0,
                agents_available: 0,
                overall_cache_hit: false,
                baseline_cost_usd: 0.0,
                latency_target_ms: 2000,
                cost_target_usd: 0.02,
            })
            .timeline
            .events
            .iter()
            .map(|e| e.name.clone())
            .collect()
    }

    #[tokio::test]
    async fn sequential_single_task_returns_agent_text() {
        let llm = Arc::new(MockLlm::with_default_reply("AAPL trades at $231.50"));
        let orch = orchestrator(llm, &config());
        let wf = workflow(
            OrchestrationPattern::Sequential,
            vec![task("MarketDataAgent", "market_data", true)],
            None,
        );
        let collector = collector();
        let outcome = orch.run(&wf, &ctx("price of AAPL"), &collector).await.unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].status, AgentStatus::Success);
        assert_eq!(outcome.response_text, "AAPL trades at $231.50");
    }

    #[tokio::test]
    async fn sequential_required_failure_terminates_with_partial_records() {
        let llm = Arc::new(MockLlm::new());
        llm.fail_chat.store(true, std::sync::atomic::Ordering::SeqCst);
        let orch = orchestrator(llm, &config());
        let wf = workflow(
            OrchestrationPattern::Sequential,
            vec![
                task("GeneralAssistantAgent", "general", true),
                task("RiskAssessmentAgent", "risk", true),
            ],
            None,
        );
        let collector = collector();
        let err = orch.run(&wf, &ctx("hello"), &collector).await.unwrap_err();
        assert!(matches!(err, CoreError::ProviderUnavailable(_)));
        // Only the first agent ran; its record is already in the collector.
        assert_eq!(collector.agents_invoked(), 1);
    }

    #[tokio::test]
    async fn sequential_optional_failure_is_skipped() {
        let llm = Arc::new(MockLlm::with_default_reply("all good"));
        let orch = orchestrator(llm, &config());
        let wf = workflow(
            OrchestrationPattern::Sequential,
            vec![
                task("GhostAgent", "ghost", false),
                task("GeneralAssistantAgent", "general", true),
            ],
            None,
        );
        let collector = collector();
        let outcome = orch.run(&wf, &ctx("hello"), &collector).await.unwrap();
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.records[0].status, AgentStatus::Error);
        assert_eq!(outcome.records[1].status, AgentStatus::Success);
        assert_eq!(outcome.response_text, "all good");
    }

    #[tokio::test]
    async fn sequential_passes_outputs_forward() {
        let llm = Arc::new(MockLlm::new());
        llm.push_reply("portfolio looks concentrated");
        llm.push_reply("risk is high given concentration");
        let orch = orchestrator(llm, &config());
        let wf = workflow(
            OrchestrationPattern::Sequential,
            vec![
                task("PortfolioAgent", "portfolio", true),
                task("RiskAssessmentAgent", "risk_assessment", true),
            ],
            None,
        );
        let collector = collector();
        let outcome = orch.run(&wf, &ctx("how is my portfolio"), &collector).await.unwrap();
        assert_eq!(outcome.records.len(), 2);
        // Risk agent saw the portfolio output as a prior result.
        match &outcome.outputs[1].1.structured {
            Some(StructuredPayload::RiskReport { factors, .. }) => {
                assert_eq!(factors, &vec!["portfolio".to_string()]);
            }
            other => panic!("expected risk report, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn concurrent_runs_all_and_keeps_declaration_order() {
        let llm = Arc::new(MockLlm::with_default_reply("done"));
        let orch = orchestrator(llm, &config());
        let wf = workflow(
            OrchestrationPattern::Concurrent,
            vec![
                task("MarketDataAgent", "market_data", true),
                task("NewsSentimentAgent", "news_sentiment", false),
                task("RiskAssessmentAgent", "risk_assessment", true),
            ],
            None,
        );
        let collector = collector();
        let outcome = orch.run(&wf, &ctx("should i buy AAPL"), &collector).await.unwrap();
        assert_eq!(outcome.records.len(), 3);
        let ids: Vec<&str> = outcome.records.iter().map(|r| r.agent_id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["MarketDataAgent", "NewsSentimentAgent", "RiskAssessmentAgent"]
        );
        assert!(outcome.records.iter().all(|r| r.status == AgentStatus::Success));
    }

    #[tokio::test]
    async fn concurrent_with_one_agent_timeout_still_synthesizes() {
        let llm = Arc::new(MockLlm::with_default_reply("quick answer"));
        llm.chat_delay_ms.store(300, std::sync::atomic::Ordering::SeqCst);
        *llm.slow_on.lock().unwrap() = Some("risk analyst".to_string());
        let mut cfg = config();
        cfg.agent_timeout_ms = 60;
        let orch = orchestrator(llm, &cfg);
        let wf = workflow(
            OrchestrationPattern::Concurrent,
            vec![
                task("MarketDataAgent", "market_data", true),
                task("NewsSentimentAgent", "news_sentiment", false),
                task("RiskAssessmentAgent", "risk_assessment", true),
            ],
            None,
        );
        let collector = collector();
        let outcome = orch.run(&wf, &ctx("should i buy AAPL"), &collector).await.unwrap();
        assert_eq!(outcome.records.len(), 3);
        let statuses: Vec<AgentStatus> = outcome.records.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![AgentStatus::Success, AgentStatus::Success, AgentStatus::Timeout]
        );
        // Response still produced from the successful outputs.
        assert_eq!(outcome.response_text, "quick answer");
        assert!(summary_event_names(&collector).contains(&"partial_results".to_string()));
    }

    #[tokio::test]
    async fn concurrent_cap_marks_unfinished_as_timeout() {
        let llm = Arc::new(MockLlm::with_default_reply("late"));
        llm.chat_delay_ms.store(500, std::sync::atomic::Ordering::SeqCst);
        let mut cfg = config();
        cfg.concurrent_cap_ms = 40;
        let orch = orchestrator(llm, &cfg);
        let wf = workflow(
            OrchestrationPattern::Concurrent,
            vec![
                task("GeneralAssistantAgent", "a", true),
                task("RiskAssessmentAgent", "b", true),
            ],
            None,
        );
        let collector = collector();
        let outcome = orch.run(&wf, &ctx("hello"), &collector).await.unwrap();
        assert_eq!(outcome.records.len(), 2);
        assert!(outcome
            .records
            .iter()
            .all(|r| r.status == AgentStatus::Timeout));
        assert!(summary_event_names(&collector).contains(&"concurrent_cap_reached".to_string()));
    }

    #[tokio::test]
    async fn handoff_delegates_then_finishes() {
        let llm = Arc::new(MockLlm::new());
        llm.push_reply(r#"{"next_agent": "MarketDataAgent"}"#);
        llm.push_reply("MSFT is at $420");
        llm.push_reply(r#"{"done": true}"#);
        let orch = orchestrator(llm, &config());
        let wf = workflow(
            OrchestrationPattern::Handoff,
            vec![
                task("TriageAgent", "triage", true),
                task("MarketDataAgent", "market_data", false),
            ],
            None,
        );
        let collector = collector();
        let outcome = orch.run(&wf, &ctx("research MSFT"), &collector).await.unwrap();
        let ids: Vec<&str> = outcome.records.iter().map(|r| r.agent_id.as_str()).collect();
        assert_eq!(ids, vec!["TriageAgent", "MarketDataAgent", "TriageAgent"]);
    }

    #[tokio::test]
    async fn handoff_immediately_done_skips_synthesis() {
        let llm = Arc::new(MockLlm::with_default_reply(r#"{"done": true}"#));
        let orch = orchestrator(llm, &config());
        let wf = workflow(
            OrchestrationPattern::Handoff,
            vec![task("TriageAgent", "triage", true)],
            Some("SynthesisAgent"),
        );
        let collector = collector();
        let outcome = orch.run(&wf, &ctx("research MSFT"), &collector).await.unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].agent_id, "TriageAgent");
    }

    #[tokio::test]
    async fn handoff_self_loop_stops_at_hop_cap() {
        let llm = Arc::new(MockLlm::with_default_reply(
            r#"{"next_agent": "TriageAgent"}"#,
        ));
        let orch = orchestrator(llm, &config());
        let wf = workflow(
            OrchestrationPattern::Handoff,
            vec![task("TriageAgent", "triage", true)],
            None,
        );
        let collector = collector();
        let outcome = orch.run(&wf, &ctx("research MSFT"), &collector).await.unwrap();
        assert_eq!(outcome.records.len(), 6); // handoff_max_hops
        assert!(summary_event_names(&collector).contains(&"hop_cap_reached".to_string()));
    }

    #[tokio::test]
    async fn handoff_unknown_next_agent_stops_with_warning() {
        let llm = Arc::new(MockLlm::with_default_reply(
            r#"{"next_agent": "NotInWorkflow"}"#,
        ));
        let orch = orchestrator(llm, &config());
        let wf = workflow(
            OrchestrationPattern::Handoff,
            vec![task("TriageAgent", "triage", true)],
            None,
        );
        let collector = collector();
        let outcome = orch.run(&wf, &ctx("research MSFT"), &collector).await.unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert!(summary_event_names(&collector).contains(&"unknown_next_agent".to_string()));
    }

    #[tokio::test]
    async fn empty_workflow_echoes_query_with_warning() {
        let llm = Arc::new(MockLlm::new());
        let orch = orchestrator(llm, &config());
        let wf = workflow(OrchestrationPattern::Sequential, vec![], None);
        let collector = collector();
        let outcome = orch.run(&wf, &ctx("echo me"), &collector).await.unwrap();
        assert!(outcome.records.is_empty());
        assert_eq!(outcome.response_text, "echo me");
        assert!(summary_event_names(&collector).contains(&"empty_workflow".to_string()));
    }

    #[tokio::test]
    async fn synthesis_combines_outputs() {
        let llm = Arc::new(MockLlm::new());
        llm.push_reply("data point one");
        llm.push_reply("data point two");
        llm.push_reply("combined: buy carefully");
        let orch = orchestrator(llm, &config());
        let wf = workflow(
            OrchestrationPattern::Concurrent,
            vec![
                task("MarketDataAgent", "market_data", true),
                task("NewsSentimentAgent", "news_sentiment", false),
            ],
            Some("SynthesisAgent"),
        );
        let collector = collector();
        let outcome = orch.run(&wf, &ctx("should i buy AAPL"), &collector).await.unwrap();
        // Synthesis record appended after the task records.
        assert_eq!(outcome.records.len(), 3);
        assert_eq!(outcome.records[2].agent_id, "SynthesisAgent");
        assert_eq!(outcome.response_text, "combined: buy carefully");
    }
}
