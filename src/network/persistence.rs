//! Persistence Collaborator
//!
//! Fire-and-forget HTTP POSTs to the backend that stores chat messages and
//! finished matches. Failures are logged and otherwise ignored.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::game::{MatchOutcome, UserId};
use crate::network::protocol::ChatMessage;

/// Collaborator call failures.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// Transport or timeout.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Backend answered with a non-success status.
    #[error("unexpected status {0}")]
    Status(reqwest::StatusCode),
}

/// Chat record as the backend stores it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRecord {
    /// Author.
    pub sender_id: UserId,
    /// Recipient.
    pub receiver_id: UserId,
    /// Text.
    pub content: String,
    /// When the hub relayed it.
    pub created_at: DateTime<Utc>,
}

impl ChatRecord {
    /// Record for a relayed message, stamped now.
    pub fn from_message(msg: &ChatMessage) -> Self {
        Self {
            sender_id: msg.sender_id,
            receiver_id: msg.receiver_id,
            content: msg.data.clone(),
            created_at: Utc::now(),
        }
    }
}

/// Match history record as the backend stores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MatchRecord {
    /// Left player.
    pub player1_id: UserId,
    /// Right player.
    pub player2_id: UserId,
    /// Winner.
    pub winner_id: UserId,
    /// Left player's score.
    #[serde(rename = "Score1")]
    pub score1: u32,
    /// Right player's score.
    #[serde(rename = "Score2")]
    pub score2: u32,
}

impl MatchRecord {
    /// Record for a finished match. Draws have no winner and are not stored.
    pub fn from_outcome(outcome: &MatchOutcome) -> Option<Self> {
        Some(Self {
            player1_id: outcome.players[0],
            player2_id: outcome.players[1],
            winner_id: outcome.winner?,
            score1: outcome.score[0],
            score2: outcome.score[1],
        })
    }
}

/// Where records go.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Chat store endpoint. `None` disables chat storage.
    pub chat_url: Option<String>,
    /// Match store endpoint. `None` disables match storage.
    pub match_url: Option<String>,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            chat_url: Some("http://backend:4000/conversation/add".into()),
            match_url: Some("http://backend:4000/api/game-history".into()),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Handle to the persistence backend. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Persistence {
    client: reqwest::Client,
    chat_url: Option<Arc<str>>,
    match_url: Option<Arc<str>>,
}

impl Persistence {
    /// Client for the configured endpoints.
    pub fn new(config: &PersistenceConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!("Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });
        Self {
            client,
            chat_url: config.chat_url.as_deref().map(Arc::from),
            match_url: config.match_url.as_deref().map(Arc::from),
        }
    }

    /// Persistence that stores nothing.
    pub fn disabled() -> Self {
        Self {
            client: reqwest::Client::new(),
            chat_url: None,
            match_url: None,
        }
    }

    /// Store a relayed chat message in the background.
    pub fn store_chat(&self, msg: &ChatMessage) {
        if let Some(url) = &self.chat_url {
            self.spawn_post("chat message", url.clone(), ChatRecord::from_message(msg));
        }
    }

    /// Store a finished match in the background.
    pub fn store_match(&self, outcome: &MatchOutcome) {
        let Some(url) = &self.match_url else {
            return;
        };
        match MatchRecord::from_outcome(outcome) {
            Some(record) => self.spawn_post("match result", url.clone(), record),
            None => debug!(players = ?outcome.players, "Draw not stored"),
        }
    }

    fn spawn_post<T>(&self, what: &'static str, url: Arc<str>, body: T)
    where
        T: Serialize + Send + Sync + 'static,
    {
        let client = self.client.clone();
        tokio::spawn(async move {
            match post(&client, &url, &body).await {
                Ok(()) => debug!("Stored {}", what),
                Err(e) => warn!("Failed to store {} at {}: {}", what, url, e),
            }
        });
    }
}

async fn post<T: Serialize>(client: &reqwest::Client, url: &str, body: &T) -> Result<(), PersistError> {
    let resp = client.post(url).json(body).send().await?;
    let status = resp.status();
    if !status.is_success() {
        return Err(PersistError::Status(status));
    }
    Ok(())
}
