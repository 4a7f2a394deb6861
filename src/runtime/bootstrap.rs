//! Session bootstrap logic
//!
//! Detects a session whose only history entry is an unanswered question, so
//! the runtime can replay it once to produce the missing answer.

use crate::llm::{HistoryMessage, Role};

/// Result of analyzing history for bootstrap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapDecision {
    /// The stored question to replay, if bootstrap should fire
    pub question: Option<String>,
    /// Reason for the decision (for debugging)
    pub reason: BootstrapReason,
}

/// Why we made a particular bootstrap decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapReason {
    /// No history at all
    EmptyHistory,
    /// Several entries ending in a model answer
    AlreadyAnswered,
    /// Several entries ending in an unanswered question
    MultipleEntries,
    /// A single entry that is not a user message
    LastEntryNotUser,
    /// Exactly one unanswered user message
    UnansweredSingleEntry,
}

impl BootstrapDecision {
    fn skip(reason: BootstrapReason) -> Self {
        Self {
            question: None,
            reason,
        }
    }

    pub fn fires(&self) -> bool {
        self.question.is_some()
    }
}

/// Decide whether a freshly seeded session needs its first answer generated
pub fn should_bootstrap(history: &[HistoryMessage]) -> BootstrapDecision {
    match history {
        [] => BootstrapDecision::skip(BootstrapReason::EmptyHistory),
        [only] if only.role == Role::User => BootstrapDecision {
            question: Some(only.text().to_string()),
            reason: BootstrapReason::UnansweredSingleEntry,
        },
        [_] => BootstrapDecision::skip(BootstrapReason::LastEntryNotUser),
        [.., last] if last.role == Role::Model => {
            BootstrapDecision::skip(BootstrapReason::AlreadyAnswered)
        }
        [..] => BootstrapDecision::skip(BootstrapReason::MultipleEntries),
    }
}
