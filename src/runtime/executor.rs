//! Session runtime executor

use super::{Command, SessionEvent, SessionHandle, SessionView};
use crate::attachment::AttachmentStager;
use crate::conversation::{ConversationLog, Turn};
use crate::llm::{Payload, StreamSession};
use crate::state_machine::{transition, ConvContext, ConvState, Effect, Event, TransitionError};
use crate::sync::{PersistRequest, SyncClient};
use futures::StreamExt;
use std::mem::discriminant;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

const COMMAND_CAPACITY: usize = 32;
const EVENT_CAPACITY: usize = 64;
const BROADCAST_CAPACITY: usize = 256;

/// A committed turn waiting for the session's persist worker
struct PersistJob {
    turn_id: u64,
    request: PersistRequest,
    attachment_attempt: Option<u64>,
}

/// Runs one session: applies the pure transition function and executes the
/// resulting effects
pub struct SessionRuntime {
    context: ConvContext,
    state: ConvState,
    log: ConversationLog,
    stream: Arc<dyn StreamSession>,
    stager: AttachmentStager,
    persist_tx: mpsc::UnboundedSender<PersistJob>,
    commands: mpsc::Receiver<Command>,
    event_rx: mpsc::Receiver<Event>,
    event_tx: mpsc::Sender<Event>,
    broadcast_tx: broadcast::Sender<SessionEvent>,
    view_tx: watch::Sender<SessionView>,
    shutdown: CancellationToken,
    /// Token for the running attachment wait or model stream
    turn_cancel: Option<CancellationToken>,
    next_turn_id: u64,
    /// Unanswered stored question; taken by the first activation
    bootstrap: Option<String>,
}

impl SessionRuntime {
    /// Start a runtime task and return its handle
    pub(crate) fn spawn(
        context: ConvContext,
        turns: Vec<Turn>,
        stream: Arc<dyn StreamSession>,
        stager: AttachmentStager,
        sync: Arc<SyncClient>,
        bootstrap: Option<String>,
    ) -> SessionHandle {
        let (command_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (view_tx, view_rx) = watch::channel(SessionView {
            turns: turns.clone(),
            ..SessionView::default()
        });
        let shutdown = CancellationToken::new();
        let persist_tx =
            spawn_persist_worker(context.session_id.clone(), sync, broadcast_tx.clone());

        let mut log = ConversationLog::new();
        log.seed(turns);

        let handle = SessionHandle {
            session_id: context.session_id.clone(),
            commands: command_tx,
            broadcast_tx: broadcast_tx.clone(),
            view: view_rx,
            shutdown: shutdown.clone(),
        };

        let runtime = Self {
            context,
            state: ConvState::default(),
            log,
            stream,
            stager,
            persist_tx,
            commands,
            event_rx,
            event_tx,
            broadcast_tx,
            view_tx,
            shutdown,
            turn_cancel: None,
            next_turn_id: 1,
            bootstrap,
        };
        tokio::spawn(runtime.run());
        handle
    }

    async fn run(mut self) {
        tracing::info!(
            session_id = %self.context.session_id,
            model = %self.context.model_id,
            turns = self.log.len(),
            "Starting session runtime"
        );

        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = self.event_rx.recv() => {
                    if let Err(e) = self.process_event(event) {
                        tracing::debug!(
                            session_id = %self.context.session_id,
                            error = %e,
                            "Ignoring stale event"
                        );
                    }
                }
            }
        }

        self.close();
        tracing::info!(session_id = %self.context.session_id, "Session runtime stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit { text, reply } => {
                let _ = reply.send(self.submit(text, false));
            }
            Command::Activate { reply } => {
                let _ = reply.send(self.activate());
            }
        }
    }

    fn submit(&mut self, text: String, is_bootstrap: bool) -> Result<u64, TransitionError> {
        let turn_id = self.next_turn_id;
        self.process_event(Event::Submit {
            turn_id,
            text,
            is_bootstrap,
        })
        .inspect_err(|e| {
            tracing::debug!(session_id = %self.context.session_id, error = %e, "Submission rejected");
        })?;
        self.next_turn_id += 1;
        tracing::info!(
            session_id = %self.context.session_id,
            turn_id,
            is_bootstrap,
            "Turn submitted"
        );
        Ok(turn_id)
    }

    fn activate(&mut self) -> Result<bool, TransitionError> {
        let Some(question) = self.bootstrap.take() else {
            return Ok(false);
        };
        tracing::info!(session_id = %self.context.session_id, "Replaying unanswered question");
        self.submit(question, true).map(|_| true)
    }

    fn close(&mut self) {
        self.shutdown.cancel();
        if let Err(e) = self.process_event(Event::SessionClosed) {
            tracing::warn!(session_id = %self.context.session_id, error = %e, "Close failed");
        }
        if !self.log.is_empty() {
            tracing::debug!(
                session_id = %self.context.session_id,
                turns = self.log.len(),
                "Dropping conversation log"
            );
            self.log.clear();
        }
        self.refresh_view();
        let _ = self.broadcast_tx.send(SessionEvent::Closed);
    }

    fn process_event(&mut self, event: Event) -> Result<(), TransitionError> {
        // Effects may feed events straight back; handle them here instead of recursing
        let mut events_to_process = vec![event];

        while let Some(current) = events_to_process.pop() {
            let previous = discriminant(&self.state);
            let previous_name = self.state.name();
            let state = std::mem::take(&mut self.state);
            let result = match transition(state, &self.context, current) {
                Ok(result) => result,
                Err(rejection) => {
                    self.state = *rejection.state;
                    return Err(rejection.error);
                }
            };
            self.state = result.new_state;
            let changed = previous != discriminant(&self.state);
            if changed {
                tracing::debug!(
                    session_id = %self.context.session_id,
                    from = previous_name,
                    to = self.state.name(),
                    "State transition"
                );
            }

            for effect in result.effects {
                if let Some(generated) = self.execute_effect(effect) {
                    events_to_process.push(generated);
                }
            }

            if changed {
                self.refresh_view();
                let _ = self.broadcast_tx.send(SessionEvent::StateChange {
                    state: self.state.clone(),
                });
            }
        }

        Ok(())
    }

    fn execute_effect(&mut self, effect: Effect) -> Option<Event> {
        match effect {
            Effect::AwaitAttachment { turn_id } => {
                if !self.stager.upload_pending() {
                    return Some(Event::AttachmentResolved {
                        turn_id,
                        attachment: self.stager.state(),
                    });
                }

                tracing::info!(
                    session_id = %self.context.session_id,
                    turn_id,
                    "Waiting for attachment upload"
                );
                let token = self.turn_token();
                let stager = self.stager.clone();
                let event_tx = self.event_tx.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        biased;
                        () = token.cancelled() => {}
                        attachment = stager.wait_resolved() => {
                            let _ = event_tx
                                .send(Event::AttachmentResolved { turn_id, attachment })
                                .await;
                        }
                    }
                });
                None
            }

            Effect::RequestStream { turn_id, payload } => {
                let token = self.turn_token();
                let stream = Arc::clone(&self.stream);
                let event_tx = self.event_tx.clone();
                let session_id = self.context.session_id.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        biased;
                        () = token.cancelled() => {
                            tracing::info!(session_id = %session_id, turn_id, "Model stream cancelled");
                        }
                        () = forward_stream(stream, payload, turn_id, event_tx) => {}
                    }
                });
                None
            }

            Effect::PublishProgress { turn_id } => {
                self.refresh_view();
                // Subscribers share the snapshot the view just took
                let text = self.view_tx.borrow().answer_in_progress.clone();
                if let Some(text) = text {
                    let _ = self
                        .broadcast_tx
                        .send(SessionEvent::AnswerProgress { turn_id, text });
                }
                None
            }

            Effect::CommitTurn { turn_id, turn } => {
                tracing::info!(
                    session_id = %self.context.session_id,
                    turn_id,
                    answer_len = turn.answer.len(),
                    with_attachment = turn.attachment_ref.is_some(),
                    "Turn committed"
                );
                self.log.append(turn.clone());
                let index = self.log.len() - 1;
                self.refresh_view();
                let _ = self.broadcast_tx.send(SessionEvent::TurnAppended {
                    turn_id,
                    index,
                    turn,
                });
                None
            }

            Effect::PersistTurn {
                turn_id,
                request,
                attachment_attempt,
            } => {
                let job = PersistJob {
                    turn_id,
                    request,
                    attachment_attempt,
                };
                if self.persist_tx.send(job).is_err() {
                    tracing::error!(
                        session_id = %self.context.session_id,
                        turn_id,
                        "Persist worker gone; turn not stored"
                    );
                }
                None
            }

            Effect::AbortStream => {
                if let Some(token) = self.turn_cancel.take() {
                    tracing::info!(session_id = %self.context.session_id, "Aborting in-flight turn");
                    token.cancel();
                }
                None
            }

            Effect::NotifyFailure { turn_id, failure } => {
                tracing::error!(
                    session_id = %self.context.session_id,
                    turn_id,
                    error = %failure,
                    "Turn failed"
                );
                self.refresh_view();
                let _ = self
                    .broadcast_tx
                    .send(SessionEvent::TurnFailed { turn_id, failure });
                None
            }

            Effect::DiscardAttachment { attempt } => {
                if self.stager.release(attempt) {
                    tracing::debug!(
                        session_id = %self.context.session_id,
                        attempt,
                        "Discarded failed attachment"
                    );
                }
                None
            }

            Effect::NotifyIdle => {
                self.turn_cancel = None;
                self.refresh_view();
                let _ = self.broadcast_tx.send(SessionEvent::Idle);
                None
            }
        }
    }

    /// Fresh cancellation token for the current turn's background work
    fn turn_token(&mut self) -> CancellationToken {
        let token = self.shutdown.child_token();
        self.turn_cancel = Some(token.clone());
        token
    }

    fn refresh_view(&self) {
        let busy = self.state.is_busy();
        let answer = self.state.answer_in_progress();
        let turns = self.log.turns();
        self.view_tx.send_if_modified(|view| {
            let mut modified = false;
            if view.busy != busy {
                view.busy = busy;
                modified = true;
            }
            if view.answer_in_progress.as_deref() != answer {
                view.answer_in_progress = answer.map(Arc::from);
                modified = true;
            }
            // The log only grows while the runtime lives
            if view.turns.len() != turns.len() {
                view.turns = turns.to_vec();
                modified = true;
            }
            modified
        });
    }
}

/// Store committed turns one at a time, in commit order.
///
/// Not tied to the session token: queued turns are still stored after the
/// user navigates away. The worker exits once the runtime is gone and the
/// queue is drained.
fn spawn_persist_worker(
    session_id: String,
    sync: Arc<SyncClient>,
    broadcast_tx: broadcast::Sender<SessionEvent>,
) -> mpsc::UnboundedSender<PersistJob> {
    let (persist_tx, mut jobs) = mpsc::unbounded_channel::<PersistJob>();
    tokio::spawn(async move {
        while let Some(job) = jobs.recv().await {
            let turn_id = job.turn_id;
            match sync
                .persist(&session_id, job.request, job.attachment_attempt)
                .await
            {
                Ok(refreshed) => {
                    let _ = broadcast_tx.send(SessionEvent::Persisted { turn_id });
                    if let Some(history) = refreshed {
                        let _ = broadcast_tx.send(SessionEvent::HistoryRefreshed {
                            messages: history.len(),
                        });
                    }
                }
                Err(error) => {
                    let _ = broadcast_tx.send(SessionEvent::PersistFailed { turn_id, error });
                }
            }
        }
    });
    persist_tx
}

/// Consume one turn's deltas and feed them back as events
async fn forward_stream(
    stream: Arc<dyn StreamSession>,
    payload: Payload,
    turn_id: u64,
    event_tx: mpsc::Sender<Event>,
) {
    let mut deltas = match stream.send_and_stream(&payload).await {
        Ok(deltas) => deltas,
        Err(error) => {
            let _ = event_tx.send(Event::StreamFailed { turn_id, error }).await;
            return;
        }
    };

    while let Some(item) = deltas.next().await {
        let event = match item {
            Ok(delta) => Event::StreamDelta {
                turn_id,
                text: delta.text,
            },
            Err(error) => {
                let _ = event_tx.send(Event::StreamFailed { turn_id, error }).await;
                return;
            }
        };
        if event_tx.send(event).await.is_err() {
            return;
        }
    }

    let _ = event_tx.send(Event::StreamComplete { turn_id }).await;
}
