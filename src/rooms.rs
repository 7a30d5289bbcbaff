use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::db::DbPool;
use crate::error::{ChatError, ChatResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomKind {
    Public,
    Private,
    Direct,
}

impl RoomKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
            Self::Direct => "direct",
        }
    }
}

/// One room row. Rooms and memberships are owned by the room service; this
/// engine only reads them for access checks and auto-subscription.
#[derive(Debug, Clone, FromRow)]
pub struct Room {
    pub id: Uuid,
    pub name: String,
    pub kind: String,
    pub max_members: i32,
    pub allow_file_sharing: bool,
    pub moderation_enabled: bool,
    pub created_by: Uuid,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Room {
    /// Unknown kinds are treated as members-only
    pub fn kind(&self) -> RoomKind {
        match self.kind.as_str() {
            "public" => RoomKind::Public,
            "direct" => RoomKind::Direct,
            _ => RoomKind::Private,
        }
    }

    pub fn open_to_all(&self) -> bool {
        matches!(self.kind(), RoomKind::Public)
    }
}

/// Client-facing room settings, sent with `joinedRoom`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub id: Uuid,
    pub name: String,
    pub kind: RoomKind,
    pub member_count: i64,
    pub max_members: i32,
    pub allow_file_sharing: bool,
}

/// Read-only view over the room service's tables.
#[derive(Clone)]
pub struct RoomDirectory {
    pool: DbPool,
}

impl RoomDirectory {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn room_by_id(&self, room_id: &Uuid) -> ChatResult<Option<Room>> {
        let room = sqlx::query_as::<_, Room>(
            r#"
            SELECT id, name, kind, max_members, allow_file_sharing,
                   moderation_enabled, created_by, is_active, created_at, updated_at
            FROM rooms
            WHERE id = $1 AND is_active = TRUE
            "#,
        )
        .bind(room_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(room)
    }

    pub async fn require_room(&self, room_id: &Uuid) -> ChatResult<Room> {
        self.room_by_id(room_id)
            .await?
            .ok_or_else(|| ChatError::validation("room not found"))
    }

    pub async fn is_member(&self, room_id: &Uuid, user_id: &Uuid) -> ChatResult<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM room_members
                WHERE room_id = $1 AND user_id = $2
            )
            "#,
        )
        .bind(room_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    /// Public rooms are open to any authenticated user; private and direct
    /// rooms require an existing membership row.
    pub async fn check_access(&self, room: &Room, user_id: &Uuid) -> ChatResult<()> {
        if room.open_to_all() || self.is_member(&room.id, user_id).await? {
            Ok(())
        } else {
            Err(ChatError::authorization("not a member of this room"))
        }
    }

    pub async fn member_count(&self, room_id: &Uuid) -> ChatResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM room_members WHERE room_id = $1
            "#,
        )
        .bind(room_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    /// Rooms the user holds a membership in, for auto-subscription at connect
    pub async fn room_ids_for_user(&self, user_id: &Uuid) -> ChatResult<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT rm.room_id
            FROM room_members rm
            JOIN rooms r ON r.id = rm.room_id
            WHERE rm.user_id = $1 AND r.is_active = TRUE
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    pub async fn summary(&self, room: &Room) -> ChatResult<RoomSummary> {
        let member_count = self.member_count(&room.id).await?;
        Ok(RoomSummary {
            id: room.id,
            name: room.name.clone(),
            kind: room.kind(),
            member_count,
            max_members: room.max_members,
            allow_file_sharing: room.allow_file_sharing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room_of_kind(kind: &str) -> Room {
        Room {
            id: Uuid::new_v4(),
            name: "general".to_string(),
            kind: kind.to_string(),
            max_members: 256,
            allow_file_sharing: true,
            moderation_enabled: true,
            created_by: Uuid::new_v4(),
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn only_public_rooms_are_open_to_all() {
        assert!(room_of_kind("public").open_to_all());
        assert!(!room_of_kind("private").open_to_all());
        assert!(!room_of_kind("direct").open_to_all());
    }

    #[test]
    fn unknown_kind_falls_back_to_members_only() {
        let room = room_of_kind("broadcast");
        assert_eq!(room.kind(), RoomKind::Private);
        assert!(!room.open_to_all());
    }

    #[test]
    fn summary_serializes_camel_case() {
        let summary = RoomSummary {
            id: Uuid::new_v4(),
            name: "general".to_string(),
            kind: RoomKind::Public,
            member_count: 3,
            max_members: 256,
            allow_file_sharing: false,
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["kind"], "public");
        assert_eq!(json["memberCount"], 3);
        assert_eq!(json["allowFileSharing"], false);
    }
}
