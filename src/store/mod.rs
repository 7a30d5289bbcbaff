pub mod cache;
pub mod search;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;
use uuid::Uuid;

use crate::db::DbPool;
use crate::error::ChatResult;
use crate::message::{MessageKind, ReactionMap, StoredMessage};

pub use cache::RecentCache;
pub use search::{SearchDocument, SearchIndexer};

const MESSAGE_COLUMNS: &str = r#"
    id, room_id, sender_id, recipient_ids, kind, content, is_private,
    encrypted_content, iv, parent_id, is_edited, is_deleted,
    is_flagged, moderation_reason, created_at, updated_at
"#;

/// Insert parameters for one message. The pipeline has already run: private
/// messages arrive with cleared content plus ciphertext and nonce, public
/// ones with moderated plaintext and no ciphertext.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub room_id: Option<Uuid>,
    pub sender_id: Uuid,
    pub recipient_ids: Vec<Uuid>,
    pub kind: MessageKind,
    pub content: String,
    pub is_private: bool,
    pub encrypted_content: Option<Vec<u8>>,
    pub iv: Option<Vec<u8>>,
    pub parent_id: Option<Uuid>,
    pub is_flagged: bool,
    pub moderation_reason: Option<String>,
}

/// Replacement body for an edit, produced by re-running moderation and,
/// for private messages, re-encryption.
#[derive(Debug, Clone)]
pub struct EditedBody {
    pub content: String,
    pub encrypted_content: Option<Vec<u8>>,
    pub iv: Option<Vec<u8>>,
    pub is_flagged: bool,
    pub moderation_reason: Option<String>,
}

/// Durable store plus its cache and search sidecars. Persistence is always
/// the synchronous part; indexing runs from spawned tasks and cache failures
/// degrade to a rebuild on the next read.
#[derive(Clone)]
pub struct MessageStore {
    pool: DbPool,
    cache: RecentCache,
    indexer: Arc<SearchIndexer>,
}

impl MessageStore {
    pub fn new(pool: DbPool, cache: RecentCache, indexer: Arc<SearchIndexer>) -> Self {
        Self {
            pool,
            cache,
            indexer,
        }
    }

    /// Persists a message with an engine-assigned id and timestamps, then
    /// feeds the room cache and (for public messages) the search index.
    /// Returns the stored row; nothing is broadcast until this has
    /// succeeded.
    pub async fn create_message(&self, new: NewMessage) -> ChatResult<StoredMessage> {
        let query = format!(
            r#"
            INSERT INTO messages (
                id, room_id, sender_id, recipient_ids, kind, content,
                is_private, encrypted_content, iv, parent_id,
                is_flagged, moderation_reason
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING {}
            "#,
            MESSAGE_COLUMNS
        );

        let stored = sqlx::query_as::<_, StoredMessage>(&query)
            .bind(Uuid::new_v4())
            .bind(new.room_id)
            .bind(new.sender_id)
            .bind(&new.recipient_ids)
            .bind(new.kind.as_str())
            .bind(&new.content)
            .bind(new.is_private)
            .bind(&new.encrypted_content)
            .bind(&new.iv)
            .bind(new.parent_id)
            .bind(new.is_flagged)
            .bind(&new.moderation_reason)
            .fetch_one(&self.pool)
            .await?;

        if let Err(err) = self.cache.push(&stored).await {
            // The row is durable; drop the cache so the next read rebuilds
            // instead of serving a window with a hole in it.
            warn!(message_id = %stored.id, error = %err, "Recent cache push failed");
            if let Some(room_id) = stored.room_id {
                let _ = self.cache.invalidate(&room_id).await;
            }
        }

        if !stored.is_private {
            self.indexer.spawn_index(stored.clone());
        }

        Ok(stored)
    }

    /// Recent window for a room, newest first. Cache first; on miss the
    /// durable store answers and the cache is rebuilt.
    pub async fn recent_messages(
        &self,
        room_id: &Uuid,
        limit: usize,
    ) -> ChatResult<Vec<StoredMessage>> {
        let limit = limit.min(self.cache.cap());

        if let Some(mut rows) = self.cache.fetch(room_id).await? {
            rows.truncate(limit);
            return Ok(rows);
        }

        let query = format!(
            r#"
            SELECT {}
            FROM messages
            WHERE room_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
            MESSAGE_COLUMNS
        );
        let rows = sqlx::query_as::<_, StoredMessage>(&query)
            .bind(room_id)
            .bind(self.cache.cap() as i64)
            .fetch_all(&self.pool)
            .await?;

        if let Err(err) = self.cache.rebuild(room_id, &rows).await {
            warn!(room_id = %room_id, error = %err, "Recent cache rebuild failed");
        }

        let mut rows = rows;
        rows.truncate(limit);
        Ok(rows)
    }

    pub async fn message_by_id(&self, message_id: &Uuid) -> ChatResult<Option<StoredMessage>> {
        let query = format!(
            r#"
            SELECT {}
            FROM messages
            WHERE id = $1
            "#,
            MESSAGE_COLUMNS
        );
        let row = sqlx::query_as::<_, StoredMessage>(&query)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Reaction state for a batch of messages in one query, keyed by
    /// message id. Messages without reactions are simply absent.
    pub async fn reactions_for_many(
        &self,
        message_ids: &[Uuid],
    ) -> ChatResult<HashMap<Uuid, ReactionMap>> {
        if message_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = sqlx::query_as::<_, (Uuid, String, Uuid)>(
            r#"
            SELECT message_id, emoji, user_id
            FROM message_reactions
            WHERE message_id = ANY($1)
            "#,
        )
        .bind(message_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut by_message: HashMap<Uuid, ReactionMap> = HashMap::new();
        for (message_id, emoji, user_id) in rows {
            by_message
                .entry(message_id)
                .or_default()
                .entry(emoji)
                .or_default()
                .insert(user_id);
        }
        Ok(by_message)
    }

    /// Full reaction state of a message as `emoji -> reacting users`.
    pub async fn reactions_for(&self, message_id: &Uuid) -> ChatResult<ReactionMap> {
        let rows = sqlx::query_as::<_, (String, Uuid)>(
            r#"
            SELECT emoji, user_id
            FROM message_reactions
            WHERE message_id = $1
            "#,
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;

        let mut map = ReactionMap::new();
        for (emoji, user_id) in rows {
            map.entry(emoji).or_default().insert(user_id);
        }
        Ok(map)
    }

    /// Toggle semantics: adds the user's reaction, or removes it when it is
    /// already present. The composite primary key makes concurrent toggles
    /// by different users independent rows, so none can overwrite another.
    /// Returns the message's full reaction state afterwards.
    pub async fn toggle_reaction(
        &self,
        msg: &StoredMessage,
        user_id: &Uuid,
        emoji: &str,
    ) -> ChatResult<ReactionMap> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO message_reactions (message_id, emoji, user_id)
            VALUES ($1, $2, $3)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(msg.id)
        .bind(emoji)
        .bind(user_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 0 {
            sqlx::query(
                r#"
                DELETE FROM message_reactions
                WHERE message_id = $1 AND emoji = $2 AND user_id = $3
                "#,
            )
            .bind(msg.id)
            .bind(emoji)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        }

        self.invalidate_room(msg).await;
        self.reactions_for(&msg.id).await
    }

    /// Removes the user's reaction if present; removing a reaction that was
    /// never added is a no-op, not an error.
    pub async fn remove_reaction(
        &self,
        msg: &StoredMessage,
        user_id: &Uuid,
        emoji: &str,
    ) -> ChatResult<ReactionMap> {
        sqlx::query(
            r#"
            DELETE FROM message_reactions
            WHERE message_id = $1 AND emoji = $2 AND user_id = $3
            "#,
        )
        .bind(msg.id)
        .bind(emoji)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        self.invalidate_room(msg).await;
        self.reactions_for(&msg.id).await
    }

    /// Applies an edited body and marks the row edited. Public edits are
    /// re-indexed with the new content; the cache entry is dropped either
    /// way.
    pub async fn apply_edit(
        &self,
        msg: &StoredMessage,
        body: EditedBody,
    ) -> ChatResult<StoredMessage> {
        let query = format!(
            r#"
            UPDATE messages
            SET content = $1,
                encrypted_content = $2,
                iv = $3,
                is_flagged = $4,
                moderation_reason = $5,
                is_edited = TRUE,
                updated_at = NOW()
            WHERE id = $6
            RETURNING {}
            "#,
            MESSAGE_COLUMNS
        );

        let updated = sqlx::query_as::<_, StoredMessage>(&query)
            .bind(&body.content)
            .bind(&body.encrypted_content)
            .bind(&body.iv)
            .bind(body.is_flagged)
            .bind(&body.moderation_reason)
            .bind(msg.id)
            .fetch_one(&self.pool)
            .await?;

        self.invalidate_room(&updated).await;
        if !updated.is_private {
            self.indexer.spawn_index(updated.clone());
        }
        Ok(updated)
    }

    /// Logical delete: the row stays, flagged, and the wire serves blank
    /// content. The search document is removed best-effort.
    pub async fn mark_deleted(&self, msg: &StoredMessage) -> ChatResult<StoredMessage> {
        let query = format!(
            r#"
            UPDATE messages
            SET is_deleted = TRUE,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            MESSAGE_COLUMNS
        );

        let updated = sqlx::query_as::<_, StoredMessage>(&query)
            .bind(msg.id)
            .fetch_one(&self.pool)
            .await?;

        self.invalidate_room(&updated).await;
        if !updated.is_private {
            self.indexer.spawn_remove(updated.id);
        }
        Ok(updated)
    }

    async fn invalidate_room(&self, msg: &StoredMessage) {
        if let Some(room_id) = msg.room_id {
            if let Err(err) = self.cache.invalidate(&room_id).await {
                warn!(room_id = %room_id, error = %err, "Recent cache invalidation failed");
            }
        }
    }
}
