//! Conversation history and cumulative usage for one orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shardrag_retriever::Citation;

/// Number of previous turns included when history is requested.
pub const HISTORY_TURNS: usize = 3;

/// Characters of each previous answer included in the history prefix.
pub const HISTORY_ANSWER_CHARS: usize = 500;

/// One answered question. Never modified once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub question: String,
    pub answer: String,
    pub citations: Vec<Citation>,
    pub followup_questions: Vec<String>,
    /// Cost of the main answer only, in USD
    pub cost: f64,
    /// Tokens of the main answer only
    pub tokens: u64,
    pub timestamp: DateTime<Utc>,
    pub num_contexts: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SessionState {
    history: Vec<ConversationTurn>,
    total_cost: f64,
    total_tokens: u64,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self) -> &[ConversationTurn] {
        &self.history
    }

    pub fn total_cost(&self) -> f64 {
        self.total_cost
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_tokens
    }

    /// Adds usage to the running totals. Totals never decrease except by [`reset`](Self::reset).
    pub fn add_usage(&mut self, cost: f64, tokens: u64) {
        self.total_cost += cost.max(0.0);
        self.total_tokens += tokens;
    }

    pub fn push_turn(&mut self, turn: ConversationTurn) {
        self.history.push(turn);
    }

    /// Summary of the last [`HISTORY_TURNS`] turns to prepend to the context,
    /// or an empty string when there is no history.
    pub fn history_prefix(&self) -> String {
        if self.history.is_empty() {
            return String::new();
        }
        let start = self.history.len().saturating_sub(HISTORY_TURNS);
        let parts: Vec<String> = self.history[start..]
            .iter()
            .enumerate()
            .map(|(i, turn)| {
                let answer: String = turn.answer.chars().take(HISTORY_ANSWER_CHARS).collect();
                format!(
                    "Previous Q{n}: {question}\nPrevious A{n}: {answer}...",
                    n = i + 1,
                    question = turn.question
                )
            })
            .collect();
        format!("{}\n\n---\n\n", parts.join("\n\n"))
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Clears history and zeroes the counters.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
