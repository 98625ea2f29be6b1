//! Agent configuration.

use agentry_graph::TokenUsage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// When pending (mid-run appended) messages are spliced into the
/// conversation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InjectMode {
    /// Inject only once the finish tool has been called (default)
    #[default]
    OnFinish,
    /// Also inject between tool rounds, before the next turn
    AfterToolCall,
}

/// Per-1k-token pricing for one model
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelPrice {
    /// USD per 1k input tokens
    pub input_per_1k: f64,
    /// USD per 1k output tokens
    pub output_per_1k: f64,
}

fn default_summarize_max_tokens() -> u64 {
    100_000
}

fn default_summarize_keep_tokens() -> u64 {
    4_000
}

fn default_max_iterations() -> u32 {
    50
}

fn default_guard_max_retries() -> u32 {
    2
}

/// Configuration of one agent node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Display name, used in stop markers; defaults to the node id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// System instructions for the model
    pub instructions: String,
    /// Model used for reasoning turns
    pub invoke_model_name: String,
    /// Model used for summarization; falls back to the invoke model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summarize_model_name: Option<String>,
    /// Context size above which older messages are folded into a summary
    #[serde(default = "default_summarize_max_tokens")]
    pub summarize_max_tokens: u64,
    /// Token budget of the message tail retained after summarization
    #[serde(default = "default_summarize_keep_tokens")]
    pub summarize_keep_tokens: u64,
    /// Bound on reasoning iterations per run
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// How many times the tool-usage guard may force another turn
    #[serde(default = "default_guard_max_retries")]
    pub guard_max_retries: u32,
    /// Pending-message injection mode
    #[serde(default)]
    pub inject_mode: InjectMode,
    /// Price table keyed by model name; unknown models cost 0
    #[serde(default)]
    pub model_prices: HashMap<String, ModelPrice>,
}

impl AgentConfig {
    /// Minimal config for a model
    pub fn new(instructions: impl Into<String>, invoke_model_name: impl Into<String>) -> Self {
        Self {
            name: None,
            instructions: instructions.into(),
            invoke_model_name: invoke_model_name.into(),
            summarize_model_name: None,
            summarize_max_tokens: default_summarize_max_tokens(),
            summarize_keep_tokens: default_summarize_keep_tokens(),
            max_iterations: default_max_iterations(),
            guard_max_retries: default_guard_max_retries(),
            inject_mode: InjectMode::default(),
            model_prices: HashMap::new(),
        }
    }

    /// Model used for summarization calls
    pub fn summarize_model(&self) -> &str {
        self.summarize_model_name
            .as_deref()
            .unwrap_or(&self.invoke_model_name)
    }

    /// Cost of one usage report under this config's price table
    pub fn price_of(&self, model: &str, usage: &TokenUsage) -> f64 {
        let Some(price) = self.model_prices.get(model) else { return 0.0 };
        let input = (usage.input_tokens + usage.cached_input_tokens) as f64 / 1000.0;
        let output = (usage.output_tokens + usage.reasoning_tokens) as f64 / 1000.0;
        input * price.input_per_1k + output * price.output_per_1k
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserializes_camel_case_with_defaults() {
        let config: AgentConfig = serde_json::from_value(json!({
            "instructions": "be helpful",
            "invokeModelName": "m",
            "summarizeMaxTokens": 1000,
            "summarizeKeepTokens": 100
        }))
        .unwrap();

        assert_eq!(config.summarize_max_tokens, 1000);
        assert_eq!(config.summarize_keep_tokens, 100);
        assert_eq!(config.max_iterations, 50);
        assert_eq!(config.inject_mode, InjectMode::OnFinish);
        assert_eq!(config.summarize_model(), "m");
    }

    #[test]
    fn unknown_models_cost_zero() {
        let config = AgentConfig::new("x", "m");
        let usage = TokenUsage { input_tokens: 1000, output_tokens: 1000, ..Default::default() };
        assert_eq!(config.price_of("m", &usage), 0.0);
    }

    #[test]
    fn price_table_applies_per_1k() {
        let mut config = AgentConfig::new("x", "m");
        config.model_prices.insert(
            "m".into(),
            ModelPrice { input_per_1k: 0.01, output_per_1k: 0.03 },
        );
        let usage = TokenUsage {
            input_tokens: 2000,
            output_tokens: 1000,
            ..Default::default()
        };
        let price = config.price_of("m", &usage);
        assert!((price - 0.05).abs() < 1e-9);
    }
}
