use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::SearchConfig;
use crate::error::{ChatError, ChatResult};
use crate::message::StoredMessage;
use crate::metrics;

/// Denormalized document shape the search collaborator receives.
#[derive(Debug, Clone, Serialize)]
pub struct SearchDocument {
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<Uuid>,
    pub sender_id: Uuid,
    pub content: String,
    pub kind: String,
    pub created_at: DateTime<Utc>,
}

impl SearchDocument {
    /// Private messages never become documents: indexing their plaintext
    /// would defeat at-rest encryption. Deleted rows have nothing to index.
    pub fn from_message(msg: &StoredMessage) -> Option<Self> {
        if msg.is_private || msg.is_deleted {
            return None;
        }
        Some(Self {
            id: msg.id,
            room_id: msg.room_id,
            sender_id: msg.sender_id,
            content: msg.content.clone(),
            kind: msg.kind.clone(),
            created_at: msg.created_at,
        })
    }
}

/// HTTP sink for the full-text search collaborator. All calls are
/// best-effort from the caller's point of view; the spawned variants log
/// and count failures instead of returning them.
#[derive(Clone)]
pub struct SearchIndexer {
    client: reqwest::Client,
    base_url: String,
    index: String,
    enabled: bool,
}

impl SearchIndexer {
    pub fn new(cfg: &SearchConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(cfg.timeout_secs))
                .build()
                .expect("Failed to create HTTP client"),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            index: cfg.index.clone(),
            enabled: cfg.enabled,
        }
    }

    fn documents_url(&self) -> String {
        format!("{}/indexes/{}/documents", self.base_url, self.index)
    }

    pub async fn index_message(&self, msg: &StoredMessage) -> ChatResult<()> {
        if !self.enabled {
            return Ok(());
        }
        let Some(doc) = SearchDocument::from_message(msg) else {
            return Ok(());
        };

        let response = self
            .client
            .post(self.documents_url())
            .json(&[doc])
            .send()
            .await
            .map_err(|e| ChatError::indexing(format!("index request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(ChatError::indexing(format!(
                "search collaborator returned HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    pub async fn remove_message(&self, message_id: &Uuid) -> ChatResult<()> {
        if !self.enabled {
            return Ok(());
        }
        let url = format!("{}/{}", self.documents_url(), message_id);
        let response = self
            .client
            .delete(url)
            .send()
            .await
            .map_err(|e| ChatError::indexing(format!("delete request failed: {}", e)))?;

        // 404 means the document was never indexed (private) or already gone
        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(ChatError::indexing(format!(
                "search collaborator returned HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Indexes off the send path. Never blocks delivery or surfaces errors
    /// to the sender.
    pub fn spawn_index(&self, msg: StoredMessage) {
        let indexer = self.clone();
        tokio::spawn(async move {
            if let Err(err) = indexer.index_message(&msg).await {
                metrics::INDEXING_FAILURES_TOTAL.inc();
                err.log();
            }
        });
    }

    pub fn spawn_remove(&self, message_id: Uuid) {
        let indexer = self.clone();
        tokio::spawn(async move {
            if let Err(err) = indexer.remove_message(&message_id).await {
                metrics::INDEXING_FAILURES_TOTAL.inc();
                err.log();
            }
        });
    }
}
