//! Events that can occur in a session

use crate::attachment::AttachmentState;
use crate::llm::LlmError;

/// Events that trigger state transitions
#[derive(Debug, Clone)]
pub enum Event {
    // User events
    Submit {
        turn_id: u64,
        text: String,
        is_bootstrap: bool,
    },

    // Attachment events
    AttachmentResolved {
        turn_id: u64,
        attachment: AttachmentState,
    },

    // Stream events
    StreamDelta {
        turn_id: u64,
        text: String,
    },
    StreamComplete {
        turn_id: u64,
    },
    StreamFailed {
        turn_id: u64,
        error: LlmError,
    },

    // Navigation
    SessionClosed,
}

impl Event {
    /// The turn this event belongs to, if it is turn-scoped
    pub fn turn_id(&self) -> Option<u64> {
        match self {
            Event::Submit { turn_id, .. }
            | Event::AttachmentResolved { turn_id, .. }
            | Event::StreamDelta { turn_id, .. }
            | Event::StreamComplete { turn_id }
            | Event::StreamFailed { turn_id, .. } => Some(*turn_id),
            Event::SessionClosed => None,
        }
    }
}
