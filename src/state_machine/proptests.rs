//! Property-based tests for the state machine
//!
//! These tests verify key invariants hold across all possible inputs.

use super::*;
use crate::attachment::{AttachmentError, AttachmentState, PersistedDescriptor};
use crate::llm::{InlinePayload, LlmError, LlmErrorKind};
use proptest::prelude::*;

// ============================================================================
// Test Helpers
// ============================================================================

fn test_context() -> ConvContext {
    ConvContext::new("test-session", "test-model")
}

fn apply(state: &ConvState, event: Event) -> Result<TransitionResult, TransitionError> {
    transition(state.clone(), &test_context(), event).map_err(|rejection| rejection.error)
}

// ============================================================================
// Arbitrary Generators
// ============================================================================

fn arb_pending_turn() -> impl Strategy<Value = PendingTurn> {
    (1u64..20, "[a-zA-Z ]{1,30}", any::<bool>()).prop_map(|(turn_id, text, is_bootstrap)| {
        PendingTurn {
            turn_id,
            text,
            is_bootstrap,
        }
    })
}

fn arb_attachment_use() -> impl Strategy<Value = Option<AttachmentUse>> {
    proptest::option::of(
        (1u64..10, "[a-z]{4,10}").prop_map(|(attempt, name)| AttachmentUse {
            attempt,
            url: format!("https://cdn.test/{name}.png"),
        }),
    )
}

fn arb_busy_state() -> impl Strategy<Value = ConvState> {
    prop_oneof![
        arb_pending_turn().prop_map(|turn| ConvState::AwaitingAttachment { turn }),
        (arb_pending_turn(), arb_attachment_use(), "[a-zA-Z ]{0,30}", 0usize..10).prop_map(
            |(turn, attachment, buffer, deltas)| ConvState::Streaming {
                turn,
                attachment,
                buffer,
                deltas,
            }
        ),
    ]
}

fn arb_state() -> impl Strategy<Value = ConvState> {
    prop_oneof![Just(ConvState::Idle), arb_busy_state()]
}

fn arb_error_kind() -> impl Strategy<Value = LlmErrorKind> {
    prop_oneof![
        Just(LlmErrorKind::Network),
        Just(LlmErrorKind::RateLimit),
        Just(LlmErrorKind::ServerError),
        Just(LlmErrorKind::Auth),
        Just(LlmErrorKind::MalformedChunk),
        Just(LlmErrorKind::Remote),
    ]
}

fn arb_resolved_attachment() -> impl Strategy<Value = AttachmentState> {
    prop_oneof![
        Just(AttachmentState::Idle),
        (1u64..10).prop_map(|attempt| AttachmentState::Ready {
            attempt,
            file_name: "a.png".to_string(),
            inline: InlinePayload {
                data: "aGk=".to_string(),
                mime_type: "image/png".to_string(),
            },
            descriptor: PersistedDescriptor {
                url: "https://cdn.test/a.png".to_string(),
                id: "a".to_string(),
            },
        }),
        (1u64..10).prop_map(|attempt| AttachmentState::Failed {
            attempt,
            file_name: "a.png".to_string(),
            error: AttachmentError::Upload("rejected".to_string()),
        }),
    ]
}

fn arb_event() -> impl Strategy<Value = Event> {
    prop_oneof![
        (1u64..20, "[a-zA-Z ]{0,20}", any::<bool>()).prop_map(|(turn_id, text, is_bootstrap)| {
            Event::Submit {
                turn_id,
                text,
                is_bootstrap,
            }
        }),
        (1u64..20, arb_resolved_attachment())
            .prop_map(|(turn_id, attachment)| Event::AttachmentResolved { turn_id, attachment }),
        (1u64..20, "[a-zA-Z ]{1,10}").prop_map(|(turn_id, text)| Event::StreamDelta { turn_id, text }),
        (1u64..20).prop_map(|turn_id| Event::StreamComplete { turn_id }),
        (1u64..20, arb_error_kind()).prop_map(|(turn_id, kind)| Event::StreamFailed {
            turn_id,
            error: LlmError::new(kind, "stream broke"),
        }),
        Just(Event::SessionClosed),
    ]
}

fn commits(result: &TransitionResult) -> usize {
    result
        .effects
        .iter()
        .filter(|e| matches!(e, Effect::CommitTurn { .. }))
        .count()
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    // Invariant 1: a second submission while busy is rejected, never queued
    #[test]
    fn prop_busy_rejects_submit(state in arb_busy_state(), text in "[a-zA-Z ]{1,20}") {
        let result = apply(&state, Event::Submit { turn_id: 99, text, is_bootstrap: false });
        prop_assert_eq!(result.unwrap_err(), TransitionError::Busy);
    }

    // Invariant 2: idle accepts any non-blank text
    #[test]
    fn prop_idle_accepts_text(text in "[a-zA-Z]{1,10}[a-zA-Z ]{0,20}", turn_id in 1u64..100) {
        let result = apply(&ConvState::Idle, Event::Submit { turn_id, text, is_bootstrap: false });
        prop_assert!(result.is_ok(), "Idle should accept: {:?}", result);
        let new_state = result.unwrap().new_state;
        prop_assert!(new_state.is_busy());
        prop_assert_eq!(new_state.turn_id(), Some(turn_id));
    }

    // Invariant 3: events for any other turn never touch state
    #[test]
    fn prop_mismatched_turn_events_rejected(state in arb_busy_state(), event in arb_event()) {
        let Some(event_turn) = event.turn_id() else { return Ok(()); };
        if matches!(event, Event::Submit { .. }) || state.turn_id() == Some(event_turn) {
            return Ok(());
        }
        match transition(state.clone(), &test_context(), event) {
            Err(rejection) => {
                prop_assert!(matches!(rejection.error, TransitionError::InvalidTransition(_)));
                prop_assert_eq!(*rejection.state, state);
            }
            Ok(result) => prop_assert!(false, "Stale event should be rejected, got {:?}", result),
        }
    }

    // Invariant 4: only a completed stream commits, and it commits exactly one turn
    #[test]
    fn prop_only_completion_commits(state in arb_state(), event in arb_event()) {
        let is_complete = matches!(event, Event::StreamComplete { .. });
        if let Ok(result) = apply(&state, event) {
            let expected = usize::from(is_complete);
            prop_assert_eq!(commits(&result), expected);
        }
    }

    // Invariant 5: every path back to idle from a live turn announces idle or aborts
    #[test]
    fn prop_leaving_busy_notifies(state in arb_busy_state(), event in arb_event()) {
        if let Ok(result) = apply(&state, event) {
            if !result.new_state.is_busy() {
                prop_assert!(result.effects.iter().any(|e| matches!(e, Effect::NotifyIdle | Effect::AbortStream)));
            }
        }
    }

    // Invariant 6: closing a session always lands in idle without committing
    #[test]
    fn prop_close_never_commits(state in arb_state()) {
        let result = apply(&state, Event::SessionClosed).unwrap();
        prop_assert_eq!(&result.new_state, &ConvState::Idle);
        prop_assert_eq!(commits(&result), 0);
    }

    // Invariant 7: the committed answer is the in-order concatenation of all deltas
    #[test]
    fn prop_answer_is_concatenation_of_deltas(
        chunks in proptest::collection::vec("[a-zA-Z0-9 .,]{0,8}", 0..20),
        text in "[a-zA-Z]{1,20}",
    ) {
        let mut state = ConvState::Streaming {
            turn: PendingTurn { turn_id: 1, text, is_bootstrap: false },
            attachment: None,
            buffer: String::new(),
            deltas: 0,
        };
        for chunk in &chunks {
            let result = apply(&state, Event::StreamDelta { turn_id: 1, text: chunk.clone() }).unwrap();
            let published = result.effects.iter().any(|e| matches!(e, Effect::PublishProgress { .. }));
            prop_assert!(published, "Every delta must publish the buffer");
            state = result.new_state;
        }

        let result = apply(&state, Event::StreamComplete { turn_id: 1 }).unwrap();
        let answer = result.effects.iter().find_map(|e| match e {
            Effect::CommitTurn { turn, .. } => Some(turn.answer.clone()),
            _ => None,
        });
        prop_assert_eq!(answer, Some(chunks.concat()));
    }

    // Invariant 8: a failed stream discards the buffer and leaves the session usable
    #[test]
    fn prop_failure_discards_and_recovers(
        turn in arb_pending_turn(),
        buffer in "[a-zA-Z ]{0,30}",
        kind in arb_error_kind(),
    ) {
        let turn_id = turn.turn_id;
        let state = ConvState::Streaming { turn, attachment: None, buffer, deltas: 2 };
        let result = apply(&state, Event::StreamFailed { turn_id, error: LlmError::new(kind, "x") }).unwrap();
        prop_assert_eq!(&result.new_state, &ConvState::Idle);
        prop_assert_eq!(commits(&result), 0);

        let resubmit = apply(&result.new_state, Event::Submit {
            turn_id: turn_id + 1,
            text: "again".to_string(),
            is_bootstrap: false,
        });
        prop_assert!(resubmit.is_ok());
    }

    // Invariant 9: each accepted submission commits at most one turn
    #[test]
    fn prop_one_commit_per_submission(events in proptest::collection::vec(arb_event(), 0..30)) {
        let mut state = ConvState::Idle;
        let mut commits_since_submit = 0;
        for event in events {
            let is_submit = matches!(event, Event::Submit { .. });
            if let Ok(result) = apply(&state, event) {
                if is_submit {
                    commits_since_submit = 0;
                }
                commits_since_submit += commits(&result);
                prop_assert!(commits_since_submit <= 1, "Submission committed more than once");
                state = result.new_state;
            }
        }
    }

    // Invariant 10: a failed attachment is reported once, then its attempt is dropped
    #[test]
    fn prop_failed_attachment_is_discarded(turn in arb_pending_turn(), attempt in 1u64..50) {
        let turn_id = turn.turn_id;
        let state = ConvState::AwaitingAttachment { turn };
        let result = apply(&state, Event::AttachmentResolved {
            turn_id,
            attachment: AttachmentState::Failed {
                attempt,
                file_name: "a.png".to_string(),
                error: AttachmentError::Upload("rejected".to_string()),
            },
        }).unwrap();
        prop_assert_eq!(&result.new_state, &ConvState::Idle);
        let discarded = result.effects.iter().any(|e| matches!(e, Effect::DiscardAttachment { attempt: a } if *a == attempt));
        prop_assert!(discarded);
    }
}
