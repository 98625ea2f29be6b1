//! Token usage accounting types.

use serde::{Deserialize, Serialize};

/// Token counts reported by the invocation backend for one call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens
    pub input_tokens: u64,
    /// Prompt tokens served from provider cache
    pub cached_input_tokens: u64,
    /// Completion tokens
    pub output_tokens: u64,
    /// Reasoning tokens (thinking models)
    pub reasoning_tokens: u64,
    /// Provider-reported total
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Fold another usage report into this one
    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.cached_input_tokens += other.cached_input_tokens;
        self.output_tokens += other.output_tokens;
        self.reasoning_tokens += other.reasoning_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Full accumulated token/cost snapshot for a thread.
///
/// Every `state_update` event carries a complete snapshot, even when only a
/// delta triggered the emission, so consumers can treat each event as the
/// current truth without folding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    /// Accumulated prompt tokens
    pub input_tokens: u64,
    /// Accumulated cached prompt tokens
    pub cached_input_tokens: u64,
    /// Accumulated completion tokens
    pub output_tokens: u64,
    /// Accumulated reasoning tokens
    pub reasoning_tokens: u64,
    /// Accumulated total
    pub total_tokens: u64,
    /// Accumulated cost in USD (0 when the model has no price entry)
    pub total_price: f64,
    /// Prompt size of the most recent call, in tokens
    pub current_context: u64,
}

impl UsageSnapshot {
    /// Fold a per-call usage report into the running totals
    pub fn absorb(&mut self, usage: &TokenUsage) {
        self.input_tokens += usage.input_tokens;
        self.cached_input_tokens += usage.cached_input_tokens;
        self.output_tokens += usage.output_tokens;
        self.reasoning_tokens += usage.reasoning_tokens;
        self.total_tokens += usage.total_tokens;
        self.current_context = usage.input_tokens + usage.cached_input_tokens;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absorb_accumulates_and_tracks_context() {
        let mut snap = UsageSnapshot::default();
        snap.absorb(&TokenUsage {
            input_tokens: 100,
            cached_input_tokens: 20,
            output_tokens: 50,
            reasoning_tokens: 5,
            total_tokens: 175,
        });
        snap.absorb(&TokenUsage {
            input_tokens: 200,
            cached_input_tokens: 0,
            output_tokens: 10,
            reasoning_tokens: 0,
            total_tokens: 210,
        });

        assert_eq!(snap.input_tokens, 300);
        assert_eq!(snap.output_tokens, 60);
        assert_eq!(snap.total_tokens, 385);
        // current_context reflects the latest call, not the sum
        assert_eq!(snap.current_context, 200);
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let snap = UsageSnapshot::default();
        let value = serde_json::to_value(snap).unwrap();
        assert!(value.get("inputTokens").is_some());
        assert!(value.get("totalPrice").is_some());
        assert!(value.get("currentContext").is_some());
    }
}
