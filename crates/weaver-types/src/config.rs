//! Engine configuration types for Weaver.
//!
//! `EngineConfig` represents `weaver.toml`: concurrency and timeout limits,
//! loop defaults, and the credit cost model. All fields have defaults.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of node activities in flight per execution.
    #[serde(default = "default_max_concurrent_nodes")]
    pub max_concurrent_nodes: usize,

    /// Per-node timeout when the node does not set `timeoutMs`.
    #[serde(default = "default_node_timeout_ms")]
    pub default_node_timeout_ms: u64,

    /// Whole-execution timeout.
    #[serde(default = "default_execution_timeout_ms")]
    pub execution_timeout_ms: u64,

    /// Loop iteration cap when a loop node does not set `maxIterations`.
    #[serde(default = "default_max_iterations")]
    pub default_max_iterations: usize,

    /// Node outputs larger than this (serialized) are replaced by a truncation marker.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Capacity of the execution event broadcast channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    #[serde(default)]
    pub credits: CreditConfig,
}

fn default_max_concurrent_nodes() -> usize {
    10
}

fn default_node_timeout_ms() -> u64 {
    300_000
}

fn default_execution_timeout_ms() -> u64 {
    1_800_000
}

fn default_max_iterations() -> usize {
    100
}

fn default_max_output_bytes() -> usize {
    1024 * 1024
}

fn default_event_buffer() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_nodes: default_max_concurrent_nodes(),
            default_node_timeout_ms: default_node_timeout_ms(),
            execution_timeout_ms: default_execution_timeout_ms(),
            default_max_iterations: default_max_iterations(),
            max_output_bytes: default_max_output_bytes(),
            event_buffer: default_event_buffer(),
            credits: CreditConfig::default(),
        }
    }
}

/// Credit metering configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditConfig {
    /// When false, admission control and metering are bypassed.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Multiplier applied to the estimate when reserving (1.2 reserves 20% headroom).
    #[serde(default = "default_estimate_margin")]
    pub estimate_margin: f64,

    /// Fixed credit cost per node type (wire name, e.g. "http").
    #[serde(default)]
    pub node_costs: BTreeMap<String, u64>,

    /// Fixed cost for node types missing from `node_costs`.
    #[serde(default = "default_node_cost")]
    pub default_node_cost: u64,

    /// Credits charged per USD of LLM spend.
    #[serde(default = "default_credits_per_usd")]
    pub credits_per_usd: u64,

    /// Token count assumed per LLM node when estimating before execution.
    #[serde(default = "default_estimated_tokens")]
    pub estimated_tokens_per_llm_node: u64,

    /// Pricing overrides, checked before the built-in table.
    #[serde(default)]
    pub llm_pricing: Vec<ModelPricing>,
}

fn default_true() -> bool {
    true
}

fn default_estimate_margin() -> f64 {
    1.2
}

fn default_node_cost() -> u64 {
    1
}

fn default_credits_per_usd() -> u64 {
    1000
}

fn default_estimated_tokens() -> u64 {
    2000
}

impl Default for CreditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            estimate_margin: default_estimate_margin(),
            node_costs: BTreeMap::new(),
            default_node_cost: default_node_cost(),
            credits_per_usd: default_credits_per_usd(),
            estimated_tokens_per_llm_node: default_estimated_tokens(),
            llm_pricing: Vec::new(),
        }
    }
}

/// Cost information for a model name prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Prefix matched against the model name (e.g. "claude-sonnet-4").
    pub model_pattern: String,
    /// Cost per million input tokens in USD.
    pub input_cost_per_million: f64,
    /// Cost per million output tokens in USD.
    pub output_cost_per_million: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent_nodes, 10);
        assert_eq!(config.default_node_timeout_ms, 300_000);
        assert_eq!(config.default_max_iterations, 100);
        assert!(config.credits.enabled);
        assert!(config.credits.llm_pricing.is_empty());
    }

    #[test]
    fn engine_config_deserialize_with_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn engine_config_deserialize_with_values() {
        let toml_str = r#"
max_concurrent_nodes = 4
default_max_iterations = 25

[credits]
credits_per_usd = 500
default_node_cost = 2

[credits.node_costs]
http = 3
code = 5

[[credits.llm_pricing]]
model_pattern = "claude-sonnet-4"
input_cost_per_million = 3.0
output_cost_per_million = 15.0
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.max_concurrent_nodes, 4);
        assert_eq!(config.default_max_iterations, 25);
        assert_eq!(config.default_node_timeout_ms, 300_000);
        assert_eq!(config.credits.credits_per_usd, 500);
        assert_eq!(config.credits.node_costs.get("code"), Some(&5));
        assert_eq!(config.credits.llm_pricing[0].model_pattern, "claude-sonnet-4");
        assert!((config.credits.estimate_margin - 1.2).abs() < f64::EPSILON);
    }
}
