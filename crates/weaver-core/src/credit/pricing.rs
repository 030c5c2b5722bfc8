//! Token pricing for LLM and vision nodes.
//!
//! Rates are USD per million tokens, keyed by model-name prefix. Overrides
//! from `weaver.toml` are consulted before the built-in rates; within each
//! source the longest matching prefix wins, so `gpt-4o-mini` beats `gpt-4o`
//! regardless of declaration order.

use weaver_types::config::ModelPricing;

/// Input and output rate, USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenRate {
    pub input: f64,
    pub output: f64,
}

impl TokenRate {
    const fn new(input: f64, output: f64) -> Self {
        Self { input, output }
    }

    /// USD cost of a call with the given token counts.
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 * self.input + output_tokens as f64 * self.output) / 1_000_000.0
    }
}

/// Used when neither the overrides nor the built-in rates know the model.
/// Priced high so unknown models over-reserve.
pub const FALLBACK_RATE: TokenRate = TokenRate::new(5.0, 15.0);

const BUILT_IN_RATES: &[(&str, TokenRate)] = &[
    ("claude-opus-4", TokenRate::new(15.0, 75.0)),
    ("claude-sonnet-4", TokenRate::new(3.0, 15.0)),
    ("claude-3-5-haiku", TokenRate::new(0.8, 4.0)),
    ("claude-haiku-3", TokenRate::new(0.25, 1.25)),
    ("gpt-4o", TokenRate::new(2.5, 10.0)),
    ("gpt-4o-mini", TokenRate::new(0.15, 0.6)),
    ("gemini-2", TokenRate::new(1.25, 5.0)),
    ("mistral-large", TokenRate::new(2.0, 6.0)),
];

fn longest_match<'a, T>(model: &str, candidates: impl Iterator<Item = (&'a str, T)>) -> Option<T> {
    candidates
        .filter(|(prefix, _)| model.starts_with(prefix))
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(_, rate)| rate)
}

/// Rate for `model`: overrides first, then built-ins, then [`FALLBACK_RATE`].
pub fn rate_for(model: &str, overrides: &[ModelPricing]) -> TokenRate {
    let overridden = longest_match(
        model,
        overrides.iter().map(|p| {
            (
                p.model_pattern.as_str(),
                TokenRate::new(p.input_cost_per_million, p.output_cost_per_million),
            )
        }),
    );
    overridden
        .or_else(|| longest_match(model, BUILT_IN_RATES.iter().map(|(prefix, rate)| (*prefix, *rate))))
        .unwrap_or(FALLBACK_RATE)
}

/// USD cost of an LLM call.
pub fn estimate_cost(input_tokens: u64, output_tokens: u64, model: &str, overrides: &[ModelPricing]) -> f64 {
    rate_for(model, overrides).cost(input_tokens, output_tokens)
}

/// Whole credits for a USD amount. Any non-zero spend costs at least one credit.
pub fn usd_to_credits(usd: f64, credits_per_usd: u64) -> u64 {
    if usd <= 0.0 {
        return 0;
    }
    (usd * credits_per_usd as f64).ceil() as u64
}
