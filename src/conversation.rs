//! Conversation log: the committed turns of the active session

use crate::llm::{HistoryMessage, Role};
use serde::{Deserialize, Serialize};

/// One committed question/answer exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_ref: Option<String>,
    pub answer: String,
}

impl Turn {
    pub fn new(question: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            attachment_ref: None,
            answer: answer.into(),
        }
    }

    #[must_use]
    pub fn with_attachment(mut self, url: impl Into<String>) -> Self {
        self.attachment_ref = Some(url.into());
        self
    }
}

/// Append-only sequence of turns. Entries are never edited in place.
#[derive(Debug, Clone, Default)]
pub struct ConversationLog {
    turns: Vec<Turn>,
}

impl ConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the log wholesale with prior turns
    pub fn seed(&mut self, turns: Vec<Turn>) {
        self.turns = turns;
    }

    pub fn append(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    /// Empty the log when its session is torn down
    pub fn clear(&mut self) {
        self.turns.clear();
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

/// Fold persisted history into committed turns.
///
/// A trailing user message without an answer is not a turn.
pub fn turns_from_history(history: &[HistoryMessage]) -> Vec<Turn> {
    let mut turns = Vec::new();
    let mut pending_user: Option<&HistoryMessage> = None;

    for message in history {
        match message.role {
            Role::User => {
                if let Some(orphan) = pending_user.replace(message) {
                    tracing::debug!(
                        question = %orphan.text(),
                        "Skipping unanswered user message in history"
                    );
                }
            }
            Role::Model => {
                let (question, attachment_ref) = match pending_user.take() {
                    Some(user) => (user.text().to_string(), user.img.clone()),
                    None => (String::new(), None),
                };
                turns.push(Turn {
                    question,
                    attachment_ref,
                    answer: message.text().to_string(),
                });
            }
        }
    }

    turns
}
