//! Controller state types

use serde::Serialize;

/// A submission that has not produced a committed turn yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingTurn {
    pub turn_id: u64,
    pub text: String,
    /// Replays a question the store already holds
    pub is_bootstrap: bool,
}

/// The resolved attachment a streaming turn was sent with
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachmentUse {
    pub attempt: u64,
    pub url: String,
}

/// Controller state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConvState {
    /// Ready for input
    #[default]
    Idle,

    /// Submitted; blocked until the attachment stager resolves
    AwaitingAttachment { turn: PendingTurn },

    /// Deltas arriving into the answer-in-progress buffer
    Streaming {
        turn: PendingTurn,
        attachment: Option<AttachmentUse>,
        buffer: String,
        deltas: usize,
    },
}

impl ConvState {
    /// A submission is in flight
    pub fn is_busy(&self) -> bool {
        !matches!(self, ConvState::Idle)
    }

    pub fn turn_id(&self) -> Option<u64> {
        match self {
            ConvState::Idle => None,
            ConvState::AwaitingAttachment { turn } | ConvState::Streaming { turn, .. } => {
                Some(turn.turn_id)
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ConvState::Idle => "idle",
            ConvState::AwaitingAttachment { .. } => "awaiting_attachment",
            ConvState::Streaming { .. } => "streaming",
        }
    }

    /// Partial answer, if streaming
    pub fn answer_in_progress(&self) -> Option<&str> {
        match self {
            ConvState::Streaming { buffer, .. } => Some(buffer),
            _ => None,
        }
    }
}

/// Context for a session (immutable configuration)
#[derive(Debug, Clone)]
pub struct ConvContext {
    pub session_id: String,
    pub model_id: String,
}

impl ConvContext {
    pub fn new(session_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            model_id: model_id.into(),
        }
    }
}
