//! Token pricing: converts usage into an approximate USD cost.
//!
//! Models are matched by prefix against a small built-in table; unknown
//! models fall back to a conservative price.

struct PricingEntry {
    model_prefix: &'static str,
    input_per_million: f64,
    output_per_million: f64,
}

const FALLBACK_INPUT_PER_MILLION: f64 = 5.0;
const FALLBACK_OUTPUT_PER_MILLION: f64 = 15.0;

/// Longer prefixes first so `gpt-4o-mini` wins over `gpt-4o`.
const TABLE: &[PricingEntry] = &[
    PricingEntry { model_prefix: "gpt-4o-mini", input_per_million: 0.15, output_per_million: 0.60 },
    PricingEntry { model_prefix: "gpt-4o", input_per_million: 2.50, output_per_million: 10.0 },
    PricingEntry { model_prefix: "gpt-4.1-mini", input_per_million: 0.40, output_per_million: 1.60 },
    PricingEntry { model_prefix: "gpt-4.1", input_per_million: 2.0, output_per_million: 8.0 },
    PricingEntry { model_prefix: "claude-3-5-haiku", input_per_million: 0.80, output_per_million: 4.0 },
    PricingEntry { model_prefix: "claude-sonnet-4", input_per_million: 3.0, output_per_million: 15.0 },
    PricingEntry { model_prefix: "claude-opus-4", input_per_million: 15.0, output_per_million: 75.0 },
    PricingEntry { model_prefix: "gemini-2", input_per_million: 1.25, output_per_million: 5.0 },
    // In-process scripted models used by tests and dry runs.
    PricingEntry { model_prefix: "mock", input_per_million: 1.0, output_per_million: 2.0 },
];

/// Estimated cost of one call in USD.
pub fn estimate_cost(prompt_tokens: u64, completion_tokens: u64, model: &str) -> f64 {
    // Provider-qualified names ("openai/gpt-4o") price like the bare model.
    let bare = model.rsplit('/').next().unwrap_or(model);
    let (input, output) = TABLE
        .iter()
        .find(|e| bare.starts_with(e.model_prefix))
        .map(|e| (e.input_per_million, e.output_per_million))
        .unwrap_or((FALLBACK_INPUT_PER_MILLION, FALLBACK_OUTPUT_PER_MILLION));
    (prompt_tokens as f64 / 1_000_000.0) * input + (completion_tokens as f64 / 1_000_000.0) * output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_prefix_wins() {
        let mini = estimate_cost(1_000_000, 0, "gpt-4o-mini-2024-07-18");
        let full = estimate_cost(1_000_000, 0, "gpt-4o-2024-08-06");
        assert!((mini - 0.15).abs() < 1e-9);
        assert!((full - 2.50).abs() < 1e-9);
    }

    #[test]
    fn provider_prefix_is_ignored() {
        assert_eq!(
            estimate_cost(1000, 1000, "openai/gpt-4o"),
            estimate_cost(1000, 1000, "gpt-4o")
        );
    }

    #[test]
    fn unknown_model_uses_fallback() {
        let cost = estimate_cost(1_000_000, 100_000, "some-local-model");
        assert!((cost - 6.5).abs() < 1e-9);
    }
}
