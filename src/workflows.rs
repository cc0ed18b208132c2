use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::CoreError;
use crate::models::{AgentTaskSpec, OrchestrationPattern, Workflow};
use crate::pricing;

// ============================================================
// Workflow Registry
// ============================================================
//
// Static mapping from workflow name to definition, loaded at
// startup and read-only afterwards. A Default workflow always
// exists; unknown lookups demote to it at the dispatcher.
// ============================================================

pub struct WorkflowRegistry {
    workflows: HashMap<String, Arc<Workflow>>,
    /// (compiled pattern, workflow name) in registration order; matched
    /// against the lowercased query, first match wins.
    patterns: Vec<(Regex, String)>,
    order: Vec<String>,
}

impl WorkflowRegistry {
    pub fn from_workflows(workflows: Vec<Workflow>) -> Result<Self, CoreError> {
        let mut map = HashMap::new();
        let mut patterns = Vec::new();
        let mut order = Vec::new();

        for workflow in workflows {
            workflow.validate()?;
            for raw in &workflow.route_patterns {
                let compiled = Regex::new(raw).map_err(|e| {
                    CoreError::InvalidRequest(format!(
                        "workflow '{}' route pattern '{}': {}",
                        workflow.name, raw, e
                    ))
                })?;
                patterns.push((compiled, workflow.name.clone()));
            }
            order.push(workflow.name.clone());
            map.insert(workflow.name.clone(), Arc::new(workflow));
        }

        if !map.contains_key("Default") {
            return Err(CoreError::InvalidRequest(
                "registry must include a Default workflow".to_string(),
            ));
        }

        Ok(Self {
            workflows: map,
            patterns,
            order,
        })
    }

    /// The workflows this deployment serves.
    pub fn builtin() -> Self {
        Self::from_workflows(builtin_workflows()).expect("builtin workflows are valid")
    }

    pub fn get(&self, name: &str) -> Result<Arc<Workflow>, CoreError> {
        self.workflows
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::UnknownWorkflow(name.to_string()))
    }

    /// Unknown names demote to Default with a warning.
    pub fn get_or_default(&self, name: &str) -> Arc<Workflow> {
        match self.get(name) {
            Ok(workflow) => workflow,
            Err(_) => {
                tracing::warn!("unknown workflow '{}', using Default", name);
                self.workflows
                    .get("Default")
                    .cloned()
                    .expect("Default is always registered")
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.workflows.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.order.clone()
    }

    /// First route pattern matching the lowercased query.
    pub fn match_pattern(&self, query: &str) -> Option<(String, String)> {
        let lowered = query.to_lowercase();
        self.patterns
            .iter()
            .find(|(re, _)| re.is_match(&lowered))
            .map(|(re, name)| (name.clone(), re.as_str().to_string()))
    }
}

fn task(agent_id: &str, outputs_key: &str, deps: &[&str]) -> AgentTaskSpec {
    AgentTaskSpec {
        agent_id: agent_id.to_string(),
        depends_on: deps.iter().map(|d| d.to_string()).collect(),
        inputs: HashMap::new(),
        outputs_key: outputs_key.to_string(),
        required: true,
    }
}

fn optional_task(agent_id: &str, outputs_key: &str) -> AgentTaskSpec {
    AgentTaskSpec {
        required: false,
        ..task(agent_id, outputs_key, &[])
    }
}

fn builtin_workflows() -> Vec<Workflow> {
    vec![
        Workflow {
            name: "QuickQuoteWorkflow".to_string(),
            pattern: OrchestrationPattern::Sequential,
            tasks: vec![task("MarketDataAgent", "market_data", &[])],
            synthesis: None,
            baseline_cost_usd: pricing::baseline_cost("QuickQuoteWorkflow"),
            route_patterns: vec![
                r"(current )?price of [a-z.]+".to_string(),
                r"quote for".to_string(),
            ],
        },
        Workflow {
            name: "InvestmentAnalysisWorkflow".to_string(),
            pattern: OrchestrationPattern::Concurrent,
            tasks: vec![
                task("MarketDataAgent", "market_data", &[]),
                optional_task("NewsSentimentAgent", "news_sentiment"),
                task("RiskAssessmentAgent", "risk_assessment", &[]),
            ],
            synthesis: Some("SynthesisAgent".to_string()),
            baseline_cost_usd: pricing::baseline_cost("InvestmentAnalysisWorkflow"),
            route_patterns: vec![
                r"should i (buy|sell|invest in)".to_string(),
                r"worth (buying|investing)".to_string(),
            ],
        },
        Workflow {
            name: "PortfolioReviewWorkflow".to_string(),
            pattern: OrchestrationPattern::Sequential,
            tasks: vec![
                task("PortfolioAgent", "portfolio", &[]),
                task("RiskAssessmentAgent", "risk_assessment", &["PortfolioAgent"]),
            ],
            synthesis: Some("SynthesisAgent".to_string()),
            baseline_cost_usd: pricing::baseline_cost("PortfolioReviewWorkflow"),
            route_patterns: vec![
                r"my (portfolio|holdings|positions)".to_string(),
                r"how (is|are) my".to_string(),
            ],
        },
        Workflow {
            name: "MarketResearchWorkflow".to_string(),
            pattern: OrchestrationPattern::Handoff,
            tasks: vec![
                task("TriageAgent", "triage", &[]),
                optional_task("NewsSentimentAgent", "news_sentiment"),
                optional_task("FundamentalsAgent", "fundamentals"),
                optional_task("MarketDataAgent", "market_data"),
            ],
            synthesis: Some("SynthesisAgent".to_string()),
            baseline_cost_usd: pricing::baseline_cost("MarketResearchWorkflow"),
            route_patterns: vec![
                r"research".to_string(),
                r"deep dive".to_string(),
                r"tell me (about|more)".to_string(),
            ],
        },
        Workflow {
            name: "Default".to_string(),
            pattern: OrchestrationPattern::Sequential,
            tasks: vec![task("GeneralAssistantAgent", "general", &[])],
            synthesis: None,
            baseline_cost_usd: pricing::baseline_cost("Default"),
            route_patterns: vec![],
        },
    ]
}

// ============================================================
// Tests
// ============================================================
