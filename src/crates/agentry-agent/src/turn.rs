//! Per-thread turn state: the data the reasoning loop operates on and the
//! shape persisted into checkpoints between turns.

use agentry_checkpoint::{Checkpoint, CheckpointTuple};
use agentry_graph::{Message, ReasoningDelta, Result, UsageSnapshot};
use serde::{Deserialize, Serialize};

/// Rough token estimate used only for summarize-threshold decisions when the
/// backend has not yet reported usage (4 bytes per token).
pub fn estimate_tokens(messages: &[Message]) -> u64 {
    messages.iter().map(|m| m.content.len() as u64 / 4 + 1).sum()
}

/// State of one thread, restored from and persisted to checkpoints
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnState {
    /// Full message history (summary markers included)
    pub messages: Vec<Message>,
    /// Rolling summary text, if any summarization has happened
    pub summary: Option<String>,
    /// Accumulated token/cost counters
    pub usage: UsageSnapshot,
}

impl TurnState {
    /// Restore from the latest checkpoint, or start fresh
    pub fn restore(tuple: Option<CheckpointTuple>) -> Self {
        match tuple {
            Some(tuple) => serde_json::from_value(tuple.checkpoint.state).unwrap_or_default(),
            None => Self::default(),
        }
    }

    /// Serialize into a checkpoint snapshot
    pub fn snapshot(&self) -> Result<Checkpoint> {
        Ok(Checkpoint::new(serde_json::to_value(self)?))
    }

    /// The last message, if any
    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }
}

/// Folds streamed reasoning fragments into at most one logical entry.
///
/// Providers vary the chunk id across fragments of what ends up as a single
/// reasoning message; accumulated content migrates to the new id instead of
/// forking into multiple entries. The entry is taken (and cleared) when the
/// invocation completes.
#[derive(Debug, Default)]
pub struct ReasoningAccumulator {
    entry: Option<(String, String)>,
}

impl ReasoningAccumulator {
    /// Create an empty accumulator
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one fragment
    pub fn push(&mut self, delta: ReasoningDelta) {
        match &mut self.entry {
            Some((id, content)) => {
                content.push_str(&delta.content);
                if *id != delta.id {
                    *id = delta.id;
                }
            }
            None => self.entry = Some((delta.id, delta.content)),
        }
    }

    /// Accumulated content so far, if any
    pub fn content(&self) -> Option<&str> {
        self.entry.as_ref().map(|(_, c)| c.as_str())
    }

    /// Take the accumulated content, clearing the entry
    pub fn take(&mut self) -> Option<String> {
        self.entry.take().map(|(_, c)| c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentry_checkpoint::CheckpointKey;
    use serde_json::json;

    #[test]
    fn restore_from_missing_checkpoint_is_fresh() {
        let state = TurnState::restore(None);
        assert!(state.messages.is_empty());
        assert!(state.summary.is_none());
        assert_eq!(state.usage.total_tokens, 0);
    }

    #[test]
    fn snapshot_roundtrip() {
        let mut state = TurnState::default();
        state.messages.push(Message::human("hi"));
        state.summary = Some("earlier stuff".into());
        state.usage.total_tokens = 42;

        let checkpoint = state.snapshot().unwrap();
        let tuple = CheckpointTuple {
            key: CheckpointKey::new("t", "ns"),
            checkpoint,
            parent_id: None,
        };
        let restored = TurnState::restore(Some(tuple));
        assert_eq!(restored.messages.len(), 1);
        assert_eq!(restored.summary.as_deref(), Some("earlier stuff"));
        assert_eq!(restored.usage.total_tokens, 42);
    }

    #[test]
    fn corrupt_checkpoint_state_falls_back_to_fresh() {
        let tuple = CheckpointTuple {
            key: CheckpointKey::new("t", "ns"),
            checkpoint: Checkpoint::new(json!("not an object")),
            parent_id: None,
        };
        let state = TurnState::restore(Some(tuple));
        assert!(state.messages.is_empty());
    }

    #[test]
    fn reasoning_accumulator_keeps_single_entry_across_id_changes() {
        let mut acc = ReasoningAccumulator::new();
        acc.push(ReasoningDelta { id: "a".into(), content: "think".into() });
        acc.push(ReasoningDelta { id: "a".into(), content: "ing ".into() });
        // Provider switched chunk ids mid-message: content migrates.
        acc.push(ReasoningDelta { id: "b".into(), content: "hard".into() });

        assert_eq!(acc.content(), Some("thinking hard"));
        assert_eq!(acc.take().as_deref(), Some("thinking hard"));
        // Cleared once the invocation completes.
        assert!(acc.content().is_none());
    }

    #[test]
    fn token_estimate_scales_with_content() {
        let short = vec![Message::human("hi")];
        let long = vec![Message::human("x".repeat(4000))];
        assert!(estimate_tokens(&long) > estimate_tokens(&short));
        assert!(estimate_tokens(&long) >= 1000);
    }
}
