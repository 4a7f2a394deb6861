//! Runtime for executing chat sessions
//!
//! One `SessionRuntime` task runs per active session id. It owns the
//! controller state and the conversation log; everything else reaches it
//! through channels.

mod bootstrap;
mod executor;


pub use bootstrap::{should_bootstrap, BootstrapDecision, BootstrapReason};
pub use executor::SessionRuntime;

use crate::attachment::{AttachmentHost, AttachmentStager};
use crate::conversation::{turns_from_history, Turn};
use crate::llm::ModelService;
use crate::state_machine::{ConvContext, ConvState, TransitionError, TurnFailure};
use crate::sync::{ChatStore, SyncClient, SyncError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Failed to load history: {0}")]
    HistoryLoad(SyncError),
    #[error(transparent)]
    Rejected(#[from] TransitionError),
    #[error("Session is closed")]
    Closed,
}

/// Events sent to session subscribers
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChange {
        state: ConvState,
    },
    /// The full answer-in-progress buffer after one more delta
    AnswerProgress {
        turn_id: u64,
        text: Arc<str>,
    },
    TurnAppended {
        turn_id: u64,
        index: usize,
        turn: Turn,
    },
    TurnFailed {
        turn_id: u64,
        failure: TurnFailure,
    },
    /// The controller accepts input again
    Idle,
    Persisted {
        turn_id: u64,
    },
    PersistFailed {
        turn_id: u64,
        error: SyncError,
    },
    HistoryRefreshed {
        messages: usize,
    },
    Closed,
}

/// Snapshot for rendering: committed turns are published separately from
/// the partial answer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionView {
    pub turns: Vec<Turn>,
    pub answer_in_progress: Option<Arc<str>>,
    pub busy: bool,
}

pub(crate) enum Command {
    Submit {
        text: String,
        reply: oneshot::Sender<Result<u64, TransitionError>>,
    },
    Activate {
        reply: oneshot::Sender<Result<bool, TransitionError>>,
    },
}

/// Handle to interact with a running session
#[derive(Clone)]
pub struct SessionHandle {
    session_id: String,
    commands: mpsc::Sender<Command>,
    broadcast_tx: broadcast::Sender<SessionEvent>,
    view: watch::Receiver<SessionView>,
    shutdown: CancellationToken,
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Submit a user message; returns the turn id
    pub async fn submit(&self, text: impl Into<String>) -> Result<u64, SessionError> {
        let text = text.into();
        self.request(|reply| Command::Submit { text, reply }).await
    }

    /// Session activation hook. Replays an unanswered stored question the
    /// first time it is called on this runtime; returns whether it did.
    pub async fn activate(&self) -> Result<bool, SessionError> {
        self.request(|reply| Command::Activate { reply }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.broadcast_tx.subscribe()
    }

    pub fn view(&self) -> SessionView {
        self.view.borrow().clone()
    }

    pub fn is_busy(&self) -> bool {
        self.view.borrow().busy
    }

    /// Stop the session: cancels any stream and discards the partial answer
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.commands.is_closed()
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<T, TransitionError>>) -> Command,
    ) -> Result<T, SessionError> {
        if self.shutdown.is_cancelled() {
            return Err(SessionError::Closed);
        }
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| SessionError::Closed)?;
        let result = response.await.map_err(|_| SessionError::Closed)?;
        Ok(result?)
    }
}

/// Navigation layer: owns the shared stager and sync client and keeps at
/// most one session running
pub struct SessionManager {
    model: Arc<dyn ModelService>,
    stager: AttachmentStager,
    sync: Arc<SyncClient>,
    active: Mutex<Option<SessionHandle>>,
}

impl SessionManager {
    pub fn new(
        model: Arc<dyn ModelService>,
        store: Arc<dyn ChatStore>,
        host: Arc<dyn AttachmentHost>,
    ) -> Self {
        let stager = AttachmentStager::new(host);
        let sync = Arc::new(SyncClient::new(store, stager.clone()));
        Self {
            model,
            stager,
            sync,
            active: Mutex::new(None),
        }
    }

    pub fn stager(&self) -> &AttachmentStager {
        &self.stager
    }

    pub fn sync(&self) -> &SyncClient {
        &self.sync
    }

    pub async fn active(&self) -> Option<SessionHandle> {
        self.active.lock().await.clone()
    }

    /// Whether the submit control should be enabled
    pub async fn can_submit(&self) -> bool {
        if self.stager.upload_pending() {
            return false;
        }
        match self.active.lock().await.as_ref() {
            Some(handle) => !handle.is_closed() && !handle.is_busy(),
            None => false,
        }
    }

    /// Switch to `session_id`, tearing down the previous session first
    pub async fn navigate(&self, session_id: &str) -> Result<SessionHandle, SessionError> {
        let mut active = self.active.lock().await;
        if let Some(handle) = active.as_ref() {
            if handle.session_id() == session_id && !handle.is_closed() {
                return Ok(handle.clone());
            }
        }

        if let Some(previous) = active.take() {
            tracing::info!(
                from = %previous.session_id(),
                to = %session_id,
                "Closing session on navigation"
            );
            previous.close();
        }
        self.stager.reset();

        let history = self
            .sync
            .load_history(session_id)
            .await
            .map_err(|e| {
                tracing::error!(session_id = %session_id, error = %e, "History load failed");
                SessionError::HistoryLoad(e)
            })?;

        let decision = should_bootstrap(&history);
        tracing::debug!(
            session_id = %session_id,
            history_len = history.len(),
            fires = decision.fires(),
            reason = ?decision.reason,
            "Bootstrap decision"
        );

        // The replayed question reaches the model through the bootstrap turn only
        let context_history = match (&decision.question, history.split_last()) {
            (Some(_), Some((_, earlier))) => earlier,
            _ => history.as_slice(),
        };
        let stream = self.model.open_session(context_history);

        let handle = SessionRuntime::spawn(
            ConvContext::new(session_id, self.model.model_id()),
            turns_from_history(&history),
            stream,
            self.stager.clone(),
            Arc::clone(&self.sync),
            decision.question,
        );
        *active = Some(handle.clone());
        Ok(handle)
    }

    /// Close the active session, if any
    pub async fn close(&self) {
        if let Some(handle) = self.active.lock().await.take() {
            handle.close();
        }
        self.stager.reset();
    }
}
