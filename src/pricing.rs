//! Pricing table for session cost accounting
//!
//! The accumulator (`analytics`) needs a cost per token for whichever model a
//! turn reports, across both provider families the proxy can talk to
//! (Anthropic's own model names, and the OpenAI-shaped names Copilot reports
//! once translated back). Models are grouped into eight pricing families;
//! the longest matching prefix of the model string wins, and an unrecognized
//! model falls back to Sonnet pricing rather than erroring - cost accounting
//! should degrade gracefully, not break the dashboard.
//!
//! Pricing data sourced from published Anthropic and OpenAI list prices.
//! Last updated: 2025-11-24

/// Per-million-token pricing for one model family
#[derive(Debug, Clone, Copy)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
    pub cache_write_per_million: f64,
    pub cache_read_per_million: f64,
}

/// One (prefix, pricing) entry in the family table
struct FamilyEntry {
    prefix: &'static str,
    pricing: ModelPricing,
}

const SONNET_PRICING: ModelPricing = ModelPricing {
    input_per_million: 3.00,
    output_per_million: 15.00,
    cache_write_per_million: 3.75,
    cache_read_per_million: 0.30,
};

/// Haiku's input price is the normalization unit for tool-economics reporting
const HAIKU_PRICING: ModelPricing = ModelPricing {
    input_per_million: 0.80,
    output_per_million: 4.00,
    cache_write_per_million: 1.00,
    cache_read_per_million: 0.08,
};

/// $/MTok for Haiku input, used as the base unit in `get_tool_economics`
pub const HAIKU_BASE_UNIT: f64 = HAIKU_PRICING.input_per_million;

const FAMILY_TABLE: &[FamilyEntry] = &[
    FamilyEntry {
        prefix: "claude-3-opus",
        pricing: ModelPricing {
            input_per_million: 15.00,
            output_per_million: 75.00,
            cache_write_per_million: 18.75,
            cache_read_per_million: 1.50,
        },
    },
    FamilyEntry {
        prefix: "claude-opus",
        pricing: ModelPricing {
            input_per_million: 15.00,
            output_per_million: 75.00,
            cache_write_per_million: 18.75,
            cache_read_per_million: 1.50,
        },
    },
    FamilyEntry {
        prefix: "claude-3-5-sonnet",
        pricing: SONNET_PRICING,
    },
    FamilyEntry {
        prefix: "claude-3-sonnet",
        pricing: SONNET_PRICING,
    },
    FamilyEntry {
        prefix: "claude-sonnet",
        pricing: SONNET_PRICING,
    },
    FamilyEntry {
        prefix: "claude-3-5-haiku",
        pricing: ModelPricing {
            input_per_million: 1.00,
            output_per_million: 5.00,
            cache_write_per_million: 1.25,
            cache_read_per_million: 0.10,
        },
    },
    FamilyEntry {
        prefix: "claude-3-haiku",
        pricing: ModelPricing {
            input_per_million: 0.25,
            output_per_million: 1.25,
            cache_write_per_million: 0.30,
            cache_read_per_million: 0.03,
        },
    },
    FamilyEntry {
        prefix: "claude-haiku",
        pricing: HAIKU_PRICING,
    },
    FamilyEntry {
        prefix: "gpt-4o-mini",
        pricing: ModelPricing {
            input_per_million: 0.15,
            output_per_million: 0.60,
            cache_write_per_million: 0.15,
            cache_read_per_million: 0.075,
        },
    },
    FamilyEntry {
        prefix: "gpt-4o",
        pricing: ModelPricing {
            input_per_million: 2.50,
            output_per_million: 10.00,
            cache_write_per_million: 2.50,
            cache_read_per_million: 1.25,
        },
    },
    FamilyEntry {
        prefix: "o1-mini",
        pricing: ModelPricing {
            input_per_million: 1.10,
            output_per_million: 4.40,
            cache_write_per_million: 1.10,
            cache_read_per_million: 0.55,
        },
    },
    FamilyEntry {
        prefix: "o1",
        pricing: ModelPricing {
            input_per_million: 15.00,
            output_per_million: 60.00,
            cache_write_per_million: 15.00,
            cache_read_per_million: 7.50,
        },
    },
    FamilyEntry {
        prefix: "o3-mini",
        pricing: ModelPricing {
            input_per_million: 1.10,
            output_per_million: 4.40,
            cache_write_per_million: 1.10,
            cache_read_per_million: 0.55,
        },
    },
];

/// Look up pricing for `model` by longest matching prefix; unknown models
/// fall back to Sonnet pricing.
pub fn get_pricing(model: &str) -> ModelPricing {
    FAMILY_TABLE
        .iter()
        .filter(|entry| model.starts_with(entry.prefix))
        .max_by_key(|entry| entry.prefix.len())
        .map(|entry| entry.pricing)
        .unwrap_or(SONNET_PRICING)
}

/// Calculate cost in USD for one turn's token usage
pub fn calculate_cost(
    model: &str,
    input_tokens: u32,
    output_tokens: u32,
    cache_creation_tokens: u32,
    cache_read_tokens: u32,
) -> f64 {
    let pricing = get_pricing(model);

    let input_cost = (input_tokens as f64 / 1_000_000.0) * pricing.input_per_million;
    let output_cost = (output_tokens as f64 / 1_000_000.0) * pricing.output_per_million;
    let cache_write_cost =
        (cache_creation_tokens as f64 / 1_000_000.0) * pricing.cache_write_per_million;
    let cache_read_cost = (cache_read_tokens as f64 / 1_000_000.0) * pricing.cache_read_per_million;

    input_cost + output_cost + cache_write_cost + cache_read_cost
}

/// Calculate how much was saved by serving `cache_read_tokens` from cache
/// instead of as regular input
pub fn calculate_cache_savings(model: &str, cache_read_tokens: u32) -> f64 {
    let pricing = get_pricing(model);
    let regular_cost = (cache_read_tokens as f64 / 1_000_000.0) * pricing.input_per_million;
    let cache_cost = (cache_read_tokens as f64 / 1_000_000.0) * pricing.cache_read_per_million;
    regular_cost - cache_cost
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_prefix_wins_over_shorter_family_match() {
        // "claude-3-5-sonnet" must win over the shorter "claude-sonnet" prefix
        let pricing = get_pricing("claude-3-5-sonnet-20241022");
        assert_eq!(pricing.input_per_million, 3.00);
        assert_eq!(pricing.output_per_million, 15.00);
    }

    #[test]
    fn unknown_model_falls_back_to_sonnet() {
        let pricing = get_pricing("some-future-model-9000");
        assert_eq!(pricing.input_per_million, SONNET_PRICING.input_per_million);
    }

    #[test]
    fn openai_families_resolve_distinctly() {
        assert_eq!(get_pricing("gpt-4o-mini-2024-07-18").input_per_million, 0.15);
        assert_eq!(get_pricing("gpt-4o-2024-08-06").input_per_million, 2.50);
        assert_eq!(get_pricing("o1-mini").input_per_million, 1.10);
        assert_eq!(get_pricing("o1-preview").input_per_million, 15.00);
        assert_eq!(get_pricing("o3-mini").input_per_million, 1.10);
    }

    #[test]
    fn calculate_cost_matches_worked_example() {
        let cost = calculate_cost("claude-3-5-sonnet-20241022", 1000, 500, 0, 0);
        assert!((cost - 0.0105).abs() < 0.0001);
    }

    #[test]
    fn cache_savings_reflect_discounted_read_price() {
        let savings = calculate_cache_savings("claude-3-5-sonnet-20241022", 10_000);
        assert!((savings - 0.027).abs() < 0.0001);
    }
}
