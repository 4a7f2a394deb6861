//! Pure state transition function

use super::{AttachmentUse, ConvContext, ConvState, Effect, Event, PendingTurn, TurnFailure};
use crate::attachment::AttachmentState;
use crate::conversation::Turn;
use crate::llm::Payload;
use crate::sync::PersistRequest;
use thiserror::Error;

/// Result of a state transition
#[derive(Debug)]
pub struct TransitionResult {
    pub new_state: ConvState,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(state: ConvState) -> Self {
        Self {
            new_state: state,
            effects: vec![],
        }
    }

    #[must_use]
    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }
}

/// Errors that can occur during transition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("A turn is already in flight")]
    Busy,
    #[error("Message is empty")]
    EmptyInput,
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
}

/// A rejected event; the state comes back untouched
#[derive(Debug)]
pub struct Rejection {
    pub state: Box<ConvState>,
    pub error: TransitionError,
}

impl Rejection {
    fn new(state: ConvState, error: TransitionError) -> Self {
        Self {
            state: Box::new(state),
            error,
        }
    }
}

/// Pure transition function
///
/// Given the same inputs it always produces the same outputs, with no I/O.
/// The state is taken by value so the answer buffer grows in place.
pub fn transition(
    state: ConvState,
    _context: &ConvContext,
    event: Event,
) -> Result<TransitionResult, Rejection> {
    match (state, event) {
        // ============================================================
        // Submission
        // ============================================================
        (
            ConvState::Idle,
            Event::Submit {
                turn_id,
                text,
                is_bootstrap,
            },
        ) => {
            if !is_bootstrap && text.trim().is_empty() {
                return Err(Rejection::new(ConvState::Idle, TransitionError::EmptyInput));
            }
            Ok(TransitionResult::new(ConvState::AwaitingAttachment {
                turn: PendingTurn {
                    turn_id,
                    text,
                    is_bootstrap,
                },
            })
            .with_effect(Effect::AwaitAttachment { turn_id }))
        }

        (state, Event::Submit { .. }) => Err(Rejection::new(state, TransitionError::Busy)),

        // ============================================================
        // Attachment resolution
        // ============================================================
        (
            ConvState::AwaitingAttachment { turn },
            Event::AttachmentResolved {
                turn_id,
                attachment,
            },
        ) if turn.turn_id == turn_id => resolve_attachment(turn, attachment),

        // ============================================================
        // Streaming
        // ============================================================
        (
            ConvState::Streaming {
                turn,
                attachment,
                mut buffer,
                deltas,
            },
            Event::StreamDelta { turn_id, text },
        ) if turn.turn_id == turn_id => {
            buffer.push_str(&text);
            Ok(TransitionResult::new(ConvState::Streaming {
                turn,
                attachment,
                buffer,
                deltas: deltas + 1,
            })
            .with_effect(Effect::PublishProgress { turn_id }))
        }

        (
            ConvState::Streaming {
                turn,
                attachment,
                buffer,
                ..
            },
            Event::StreamComplete { turn_id },
        ) if turn.turn_id == turn_id => {
            let attachment_ref = attachment.as_ref().map(|a| a.url.clone());
            // The store already holds a replayed question
            let request = PersistRequest {
                question: (!turn.is_bootstrap).then(|| turn.text.clone()),
                answer: buffer.clone(),
                img: attachment_ref.clone(),
            };
            let committed = Turn {
                question: turn.text,
                attachment_ref,
                answer: buffer,
            };
            Ok(TransitionResult::new(ConvState::Idle)
                .with_effect(Effect::CommitTurn {
                    turn_id,
                    turn: committed,
                })
                .with_effect(Effect::PersistTurn {
                    turn_id,
                    request,
                    attachment_attempt: attachment.map(|a| a.attempt),
                })
                .with_effect(Effect::NotifyIdle))
        }

        (ConvState::Streaming { turn, .. }, Event::StreamFailed { turn_id, error })
            if turn.turn_id == turn_id =>
        {
            Ok(TransitionResult::new(ConvState::Idle)
                .with_effect(Effect::NotifyFailure {
                    turn_id,
                    failure: TurnFailure::Stream(error),
                })
                .with_effect(Effect::NotifyIdle))
        }

        // ============================================================
        // Navigation
        // ============================================================
        (ConvState::Idle, Event::SessionClosed) => Ok(TransitionResult::new(ConvState::Idle)),

        (ConvState::AwaitingAttachment { .. } | ConvState::Streaming { .. }, Event::SessionClosed) => {
            Ok(TransitionResult::new(ConvState::Idle).with_effect(Effect::AbortStream))
        }

        // ============================================================
        // Stale or out-of-order events
        // ============================================================
        (state, event) => {
            let error = TransitionError::InvalidTransition(format!(
                "{} cannot handle {} for turn {:?}",
                state.name(),
                event_name(&event),
                event.turn_id()
            ));
            Err(Rejection::new(state, error))
        }
    }
}

fn resolve_attachment(
    turn: PendingTurn,
    attachment: AttachmentState,
) -> Result<TransitionResult, Rejection> {
    let turn_id = turn.turn_id;
    let (payload, used) = match attachment {
        AttachmentState::Idle => (Payload::text(turn.text.clone()), None),
        AttachmentState::Ready {
            attempt,
            inline,
            descriptor,
            ..
        } => (
            Payload::with_inline(inline, turn.text.clone()),
            Some(AttachmentUse {
                attempt,
                url: descriptor.url,
            }),
        ),
        // The failed attempt is consumed here so the next submit starts clean
        AttachmentState::Failed { attempt, error, .. } => {
            return Ok(TransitionResult::new(ConvState::Idle)
                .with_effect(Effect::NotifyFailure {
                    turn_id,
                    failure: TurnFailure::Attachment(error),
                })
                .with_effect(Effect::DiscardAttachment { attempt })
                .with_effect(Effect::NotifyIdle));
        }
        AttachmentState::Staging { .. } => {
            return Err(Rejection::new(
                ConvState::AwaitingAttachment { turn },
                TransitionError::InvalidTransition(
                    "attachment reported resolved while still staging".to_string(),
                ),
            ));
        }
    };

    Ok(TransitionResult::new(ConvState::Streaming {
        turn,
        attachment: used,
        buffer: String::new(),
        deltas: 0,
    })
    .with_effect(Effect::RequestStream { turn_id, payload }))
}

fn event_name(event: &Event) -> &'static str {
    match event {
        Event::Submit { .. } => "submit",
        Event::AttachmentResolved { .. } => "attachment_resolved",
        Event::StreamDelta { .. } => "stream_delta",
        Event::StreamComplete { .. } => "stream_complete",
        Event::StreamFailed { .. } => "stream_failed",
        Event::SessionClosed => "session_closed",
    }
}
