//! Reconciliation of the local log with the persisted chat store
//!
//! History is fetched once per session id and cached; every successful
//! persist invalidates and refetches it. Failed persists are logged and
//! kept in the session's pending queue, never rolled back locally.

use crate::attachment::AttachmentStager;
use crate::llm::HistoryMessage;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("Chat store unreachable: {0}")]
    Network(String),
    #[error("Chat store returned HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("Invalid chat store response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SyncError::Decode(err.to_string())
        } else {
            SyncError::Network(err.to_string())
        }
    }
}

/// Persisted chat document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ChatRecord {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub history: Vec<HistoryMessage>,
}

/// Body of the persist call; absent fields are omitted from the JSON
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    pub answer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub img: Option<String>,
}

/// Durable storage for chat history
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn load(&self, session_id: &str) -> Result<ChatRecord, SyncError>;

    async fn persist(
        &self,
        session_id: &str,
        request: &PersistRequest,
    ) -> Result<ChatRecord, SyncError>;
}

/// Chat store backed by the chat API over HTTP
pub struct HttpChatStore {
    client: Client,
    api_url: String,
    session_cookie: Option<String>,
}

impl HttpChatStore {
    pub fn new(api_url: &str, session_cookie: Option<String>) -> Result<Self, SyncError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SyncError::Network(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            session_cookie,
        })
    }

    fn chat_url(&self, session_id: &str) -> String {
        format!("{}/api/chats/{session_id}", self.api_url)
    }

    fn with_credentials(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.session_cookie {
            Some(cookie) => request.header(reqwest::header::COOKIE, cookie),
            None => request,
        }
    }

    async fn read_record(response: reqwest::Response) -> Result<ChatRecord, SyncError> {
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SyncError::Status {
                status: status.as_u16(),
                message,
            });
        }
        response
            .json::<ChatRecord>()
            .await
            .map_err(|e| SyncError::Decode(e.to_string()))
    }
}

#[async_trait]
impl ChatStore for HttpChatStore {
    async fn load(&self, session_id: &str) -> Result<ChatRecord, SyncError> {
        let response = self
            .with_credentials(self.client.get(self.chat_url(session_id)))
            .send()
            .await?;
        Self::read_record(response).await
    }

    async fn persist(
        &self,
        session_id: &str,
        request: &PersistRequest,
    ) -> Result<ChatRecord, SyncError> {
        let response = self
            .with_credentials(self.client.put(self.chat_url(session_id)))
            .json(request)
            .send()
            .await?;
        Self::read_record(response).await
    }
}

type HistoryCell = Arc<OnceCell<Vec<HistoryMessage>>>;

/// Caching sync layer shared by all sessions
pub struct SyncClient {
    store: Arc<dyn ChatStore>,
    stager: AttachmentStager,
    cache: Mutex<HashMap<String, HistoryCell>>,
    /// One lock per session id; held for a whole persist so writes land in order
    lanes: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Requests not yet durably stored, keyed by submission ticket
    pending: StdMutex<HashMap<String, BTreeMap<u64, PersistRequest>>>,
    next_ticket: AtomicU64,
}

impl SyncClient {
    pub fn new(store: Arc<dyn ChatStore>, stager: AttachmentStager) -> Self {
        Self {
            store,
            stager,
            cache: Mutex::new(HashMap::new()),
            lanes: StdMutex::new(HashMap::new()),
            pending: StdMutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(1),
        }
    }

    /// Persisted history for `session_id`, fetched at most once while cached.
    ///
    /// Waits for any persist already running for the session, so the result
    /// never predates a write that was in flight.
    pub async fn load_history(&self, session_id: &str) -> Result<Vec<HistoryMessage>, SyncError> {
        let lane = self.lane(session_id);
        drop(lane.lock().await);
        self.cached_history(session_id).await
    }

    /// Drop the cached history for `session_id`
    pub async fn invalidate(&self, session_id: &str) {
        self.cache.lock().await.remove(session_id);
    }

    /// Requests for `session_id` that have not been durably stored, oldest first
    pub fn pending(&self, session_id: &str) -> Vec<PersistRequest> {
        self.pending_map()
            .get(session_id)
            .map(|queue| queue.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Push one finalized turn to the store.
    ///
    /// Persists for the same session run one at a time. On success, refetches
    /// the history, releases the turn's attachment and returns the refreshed
    /// history if the refetch succeeded.
    pub async fn persist(
        &self,
        session_id: &str,
        request: PersistRequest,
        attachment_attempt: Option<u64>,
    ) -> Result<Option<Vec<HistoryMessage>>, SyncError> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        self.pending_map()
            .entry(session_id.to_string())
            .or_default()
            .insert(ticket, request.clone());

        let lane = self.lane(session_id);
        let _lane = lane.lock().await;

        let start = std::time::Instant::now();
        if let Err(e) = self.store.persist(session_id, &request).await {
            tracing::error!(
                session_id = %session_id,
                error = %e,
                pending = self.pending(session_id).len(),
                duration_ms = %start.elapsed().as_millis(),
                "Failed to persist turn"
            );
            return Err(e);
        }

        tracing::info!(
            session_id = %session_id,
            bootstrap = request.question.is_none(),
            duration_ms = %start.elapsed().as_millis(),
            "Turn persisted"
        );

        if let Some(attempt) = attachment_attempt {
            self.stager.release(attempt);
        }
        {
            let mut pending = self.pending_map();
            if let Some(queue) = pending.get_mut(session_id) {
                queue.remove(&ticket);
                if queue.is_empty() {
                    pending.remove(session_id);
                }
            }
        }

        self.invalidate(session_id).await;
        match self.cached_history(session_id).await {
            Ok(history) => Ok(Some(history)),
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "History refetch failed");
                Ok(None)
            }
        }
    }

    async fn cached_history(&self, session_id: &str) -> Result<Vec<HistoryMessage>, SyncError> {
        let cell = {
            let mut cache = self.cache.lock().await;
            Arc::clone(cache.entry(session_id.to_string()).or_default())
        };

        let history = cell
            .get_or_try_init(|| async {
                tracing::debug!(session_id = %session_id, "Fetching chat history");
                self.store.load(session_id).await.map(|record| record.history)
            })
            .await?;
        Ok(history.clone())
    }

    fn lane(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(lanes.entry(session_id.to_string()).or_default())
    }

    fn pending_map(&self) -> MutexGuard<'_, HashMap<String, BTreeMap<u64, PersistRequest>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
