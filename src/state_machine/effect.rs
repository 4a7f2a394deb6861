//! Effects produced by state transitions

use crate::attachment::AttachmentError;
use crate::conversation::Turn;
use crate::llm::{LlmError, Payload};
use crate::sync::PersistRequest;
use serde::Serialize;
use thiserror::Error;

/// Why a submission was abandoned
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TurnFailure {
    #[error("Attachment failed: {0}")]
    Attachment(AttachmentError),
    #[error("Model stream failed: {0}")]
    Stream(LlmError),
}

/// Effects to be executed after state transition
#[derive(Debug, Clone)]
pub enum Effect {
    /// Block until the attachment stager resolves, then feed back `AttachmentResolved`
    AwaitAttachment { turn_id: u64 },

    /// Send the payload on the session's stream handle and consume the deltas
    RequestStream { turn_id: u64, payload: Payload },

    /// Publish the answer-in-progress buffer held by the new state
    PublishProgress { turn_id: u64 },

    /// Append a finished turn to the conversation log
    CommitTurn { turn_id: u64, turn: Turn },

    /// Hand a committed turn to the sync client
    PersistTurn {
        turn_id: u64,
        request: PersistRequest,
        attachment_attempt: Option<u64>,
    },

    /// Cancel the running attachment wait or stream
    AbortStream,

    NotifyFailure { turn_id: u64, failure: TurnFailure },

    /// Drop a failed attachment attempt once its failure has been reported
    DiscardAttachment { attempt: u64 },

    /// The controller accepts input again
    NotifyIdle,
}
