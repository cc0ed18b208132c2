use crate::models::ChatMessage;

// ============================================================
// Cost Model
// ============================================================
//
// Pure functions only. Prices are USD per 1K tokens. Token
// counts are estimates (~4 chars/token) mirroring provider
// billing closely enough for savings accounting; exact counts
// come from the provider's usage block when it returns one.
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChatPricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmbeddingPricing {
    pub per_1k: f64,
}

/// Chat model pricing table. Keep sorted from cheap to expensive.
const CHAT_PRICING: &[(&str, ChatPricing)] = &[
    (
        "gpt-4o-mini",
        ChatPricing {
            input_per_1k: 0.000_15,
            output_per_1k: 0.000_60,
        },
    ),
    (
        "gpt-4.1-mini",
        ChatPricing {
            input_per_1k: 0.000_40,
            output_per_1k: 0.001_60,
        },
    ),
    (
        "gpt-4.1",
        ChatPricing {
            input_per_1k: 0.002_00,
            output_per_1k: 0.008_00,
        },
    ),
    (
        "gpt-4o",
        ChatPricing {
            input_per_1k: 0.002_50,
            output_per_1k: 0.010_00,
        },
    ),
];

const EMBEDDING_PRICING: &[(&str, EmbeddingPricing)] = &[
    ("text-embedding-3-small", EmbeddingPricing { per_1k: 0.000_02 }),
    ("text-embedding-3-large", EmbeddingPricing { per_1k: 0.000_13 }),
];

/// Uncached execution estimates per registered workflow.
pub const BASELINE_COSTS: &[(&str, f64)] = &[
    ("QuickQuoteWorkflow", 0.0315),
    ("InvestmentAnalysisWorkflow", 0.1240),
    ("PortfolioReviewWorkflow", 0.0980),
    ("MarketResearchWorkflow", 0.1520),
    ("Default", 0.0450),
];

pub fn chat_pricing(model: &str) -> Option<ChatPricing> {
    CHAT_PRICING
        .iter()
        .find(|(name, _)| *name == model)
        .map(|(_, p)| *p)
}

/// Pricing for a chat model; unknown models bill at the most expensive
/// known tier so cost reports err high rather than low.
pub fn chat_pricing_or_fallback(model: &str) -> ChatPricing {
    chat_pricing(model).unwrap_or_else(|| {
        let (name, fallback) = CHAT_PRICING[CHAT_PRICING.len() - 1];
        tracing::warn!("unknown chat model '{}', billing at '{}' rates", model, name);
        fallback
    })
}

pub fn embedding_pricing(model: &str) -> EmbeddingPricing {
    EMBEDDING_PRICING
        .iter()
        .find(|(name, _)| *name == model)
        .map(|(_, p)| *p)
        .unwrap_or_else(|| {
            let (name, fallback) = EMBEDDING_PRICING[EMBEDDING_PRICING.len() - 1];
            tracing::warn!(
                "unknown embedding model '{}', billing at '{}' rates",
                model,
                name
            );
            fallback
        })
}

/// Estimate the token count of a piece of text (~4 chars per token).
/// Non-empty text is never zero tokens.
pub fn count_tokens(_model: &str, text: &str) -> u64 {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return 0;
    }
    ((trimmed.chars().count() as u64) + 3) / 4
}

/// Token count for a message list with provider framing overhead:
/// 3 tokens per message plus 1 per role field.
pub fn count_messages(model: &str, messages: &[ChatMessage]) -> u64 {
    messages
        .iter()
        .map(|m| count_tokens(model, &m.content) + 3 + 1)
        .sum()
}

pub fn llm_cost(model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    let p = chat_pricing_or_fallback(model);
    (input_tokens as f64 / 1000.0) * p.input_per_1k
        + (output_tokens as f64 / 1000.0) * p.output_per_1k
}

pub fn embedding_cost(model: &str, tokens: u64) -> f64 {
    (tokens as f64 / 1000.0) * embedding_pricing(model).per_1k
}

/// Estimated uncached cost for a named workflow; 0.0 for unknown names.
pub fn baseline_cost(workflow_name: &str) -> f64 {
    BASELINE_COSTS
        .iter()
        .find(|(name, _)| *name == workflow_name)
        .map(|(_, c)| *c)
        .unwrap_or(0.0)
}

/// What a hit on a given layer avoided spending.
///
/// A semantic hit saves the whole baseline run; a router hit saves one
/// routing-decision LLM call; tool hits save nothing LLM-side (tools are
/// billed at zero LLM cost) so only the baseline-free value 0 applies.
pub fn cache_savings(hit_layer: &str, model: &str, baseline: f64) -> f64 {
    match hit_layer {
        "semantic" => baseline,
        // One small classification call: ~200 in / ~10 out tokens.
        "router" => llm_cost(model, 200, 10),
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod token_tests {
        use super::*;

        #[test]
        fn empty_text_is_zero() {
            assert_eq!(count_tokens("gpt-4o-mini", ""), 0);
            assert_eq!(count_tokens("gpt-4o-mini", "   "), 0);
        }

        #[test]
        fn short_text_is_at_least_one() {
            assert_eq!(count_tokens("gpt-4o-mini", "hi"), 1);
        }

        #[test]
        fn four_chars_per_token() {
            // 40 chars -> 10 tokens
            let text = "a".repeat(40);
            assert_eq!(count_tokens("gpt-4o-mini", &text), 10);
        }

        #[test]
        fn message_framing_overhead() {
            let messages = vec![
                ChatMessage::system("You are helpful."), // 16 chars -> 4 tokens
                ChatMessage::user("hello hello!"),       // 12 chars -> 3 tokens
            ];
            // 4 + 3 content, plus (3 + 1) * 2 framing
            assert_eq!(count_messages("gpt-4o-mini", &messages), 4 + 3 + 8);
        }
    }

    mod pricing_tests {
        use super::*;

        #[test]
        fn known_model_prices() {
            let p = chat_pricing("gpt-4o-mini").unwrap();
            assert_eq!(p.input_per_1k, 0.000_15);
            assert_eq!(p.output_per_1k, 0.000_60);
        }

        #[test]
        fn unknown_model_bills_at_top_tier() {
            let p = chat_pricing_or_fallback("some-future-model");
            let top = chat_pricing("gpt-4o").unwrap();
            assert_eq!(p, top);
        }

        #[test]
        fn llm_cost_scales_linearly() {
            let one = llm_cost("gpt-4o-mini", 1000, 1000);
            let two = llm_cost("gpt-4o-mini", 2000, 2000);
            assert!((two - 2.0 * one).abs() < 1e-12);
            assert!((one - (0.000_15 + 0.000_60)).abs() < 1e-12);
        }

        #[test]
        fn embedding_cost_for_large_model() {
            let cost = embedding_cost("text-embedding-3-large", 1000);
            assert!((cost - 0.000_13).abs() < 1e-12);
        }
    }

    mod baseline_tests {
        use super::*;

        #[test]
        fn quick_quote_baseline() {
            assert_eq!(baseline_cost("QuickQuoteWorkflow"), 0.0315);
        }

        #[test]
        fn unknown_workflow_is_free_baseline() {
            assert_eq!(baseline_cost("NoSuchWorkflow"), 0.0);
        }

        #[test]
        fn semantic_hit_saves_the_baseline() {
            assert_eq!(cache_savings("semantic", "gpt-4o-mini", 0.0315), 0.0315);
        }

        #[test]
        fn router_hit_saves_one_small_call() {
            let saved = cache_savings("router", "gpt-4o-mini", 0.0315);
            assert!(saved > 0.0);
            assert!(saved < 0.001);
        }

        #[test]
        fn tool_hit_saves_no_llm_cost() {
            assert_eq!(cache_savings("tool", "gpt-4o-mini", 0.0315), 0.0);
        }
    }
}
