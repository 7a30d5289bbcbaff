use tracing::warn;
use uuid::Uuid;

use crate::config::CacheConfig;
use crate::error::ChatResult;
use crate::kv::KvClient;
use crate::message::StoredMessage;

/// Bounded per-room list of recently persisted messages, newest first.
///
/// Entries are rmp-serde encoded rows in stored form, so the ciphertext of
/// private messages is what sits in Redis, never their plaintext. Direct
/// messages have no room and are not cached at all.
#[derive(Clone)]
pub struct RecentCache {
    kv: KvClient,
    cap: usize,
    ttl_secs: i64,
}

impl RecentCache {
    pub fn new(kv: KvClient, cfg: &CacheConfig) -> Self {
        Self {
            kv,
            // A cap of 0 would turn the LTRIM stop index negative, which
            // Redis reads as keep-everything; the floor keeps the list bounded.
            cap: cfg.recent_cap.max(1),
            ttl_secs: cfg.ttl_secs,
        }
    }

    /// Upper bound of the cached window per room
    pub fn cap(&self) -> usize {
        self.cap
    }

    fn key(room_id: &Uuid) -> String {
        format!("recent:{}", room_id)
    }

    /// Appends a freshly persisted message and trims to the cap.
    pub async fn push(&self, msg: &StoredMessage) -> ChatResult<()> {
        let Some(room_id) = msg.room_id else {
            return Ok(());
        };
        let bytes = rmp_serde::encode::to_vec_named(msg)?;
        let mut kv = self.kv.clone();
        kv.push_capped(&Self::key(&room_id), &bytes, self.cap, self.ttl_secs)
            .await?;
        Ok(())
    }

    /// Cached rows for a room, newest first. `None` means cache miss;
    /// `Some(vec![])` never occurs because empty keys read as missing.
    pub async fn fetch(&self, room_id: &Uuid) -> ChatResult<Option<Vec<StoredMessage>>> {
        let mut kv = self.kv.clone();
        let raw = kv.list_all(&Self::key(room_id)).await?;
        if raw.is_empty() {
            return Ok(None);
        }

        let total = raw.len();
        let mut rows = Vec::with_capacity(total);
        for bytes in raw {
            match rmp_serde::from_slice::<StoredMessage>(&bytes) {
                Ok(msg) => rows.push(msg),
                Err(err) => {
                    // A single bad entry poisons ordering; rebuild from the
                    // durable store instead of serving a gap.
                    warn!(room_id = %room_id, error = %err, "Undecodable cache entry, discarding cache");
                    self.invalidate(room_id).await?;
                    return Ok(None);
                }
            }
        }
        Ok(Some(rows))
    }

    /// Replaces the room's cache with rows fetched from the durable store,
    /// newest first.
    pub async fn rebuild(&self, room_id: &Uuid, rows: &[StoredMessage]) -> ChatResult<()> {
        let mut encoded = Vec::with_capacity(rows.len().min(self.cap));
        for msg in rows.iter().take(self.cap) {
            encoded.push(rmp_serde::encode::to_vec_named(msg)?);
        }
        let mut kv = self.kv.clone();
        kv.replace_list(&Self::key(room_id), &encoded, self.ttl_secs)
            .await?;
        Ok(())
    }

    /// Drops the room's cache so the next read rebuilds it. Used after
    /// edits, deletes and reaction changes.
    pub async fn invalidate(&self, room_id: &Uuid) -> ChatResult<()> {
        let mut kv = self.kv.clone();
        kv.del(&Self::key(room_id)).await?;
        Ok(())
    }
}
