use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::crypto::MessageCipher;
use crate::error::ChatError;

/// Served in place of a private body that cannot be opened
pub const REDACTED_CONTENT: &str = "[message unavailable]";

/// emoji -> reacting users, ordered for stable wire output
pub type ReactionMap = BTreeMap<String, BTreeSet<Uuid>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
    System,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::File => "file",
            Self::System => "system",
        }
    }

    /// File-bearing kinds are subject to the room's file sharing setting
    pub fn is_attachment(&self) -> bool {
        matches!(self, Self::Image | Self::File)
    }
}

impl std::str::FromStr for MessageKind {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "file" => Ok(Self::File),
            "system" => Ok(Self::System),
            other => Err(ChatError::validation(format!(
                "unknown message kind: {}",
                other
            ))),
        }
    }
}

/// One persisted message row.
///
/// Private rows clear `content` and carry ciphertext plus nonce instead;
/// non-private rows never carry ciphertext. Serialization exists for the
/// recent cache, which stores this form so plaintext of private messages
/// never enters Redis.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: Uuid,
    pub room_id: Option<Uuid>,
    pub sender_id: Uuid,
    pub recipient_ids: Vec<Uuid>,
    pub kind: String,
    pub content: String,
    pub is_private: bool,
    pub encrypted_content: Option<Vec<u8>>,
    pub iv: Option<Vec<u8>>,
    pub parent_id: Option<Uuid>,
    pub is_edited: bool,
    pub is_deleted: bool,
    pub is_flagged: bool,
    pub moderation_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredMessage {
    /// Everyone a direct message concerns: the recipients plus the sender
    pub fn direct_audience(&self) -> Vec<Uuid> {
        let mut audience: Vec<Uuid> = self.recipient_ids.clone();
        if !audience.contains(&self.sender_id) {
            audience.push(self.sender_id);
        }
        audience
    }
}

/// What the audience receives. Ciphertext and nonce never appear here; the
/// body is plaintext restored before delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<Uuid>,
    pub sender_id: Uuid,
    pub sender_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recipient_ids: Vec<Uuid>,
    pub kind: MessageKind,
    pub content: String,
    pub is_private: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    pub is_edited: bool,
    pub is_deleted: bool,
    pub is_flagged: bool,
    pub reactions: ReactionMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MessagePayload {
    /// Build from a row plus an already known plaintext body. The send path
    /// uses this right after persisting, when the moderated body is in hand.
    pub fn from_parts(
        msg: &StoredMessage,
        sender_name: String,
        content: String,
        reactions: ReactionMap,
    ) -> Self {
        Self {
            id: msg.id,
            room_id: msg.room_id,
            sender_id: msg.sender_id,
            sender_name,
            recipient_ids: msg.recipient_ids.clone(),
            kind: msg.kind.parse().unwrap_or_default(),
            content,
            is_private: msg.is_private,
            parent_id: msg.parent_id,
            is_edited: msg.is_edited,
            is_deleted: msg.is_deleted,
            is_flagged: msg.is_flagged,
            reactions,
            created_at: msg.created_at,
            updated_at: msg.updated_at,
        }
    }

    /// Build from a row on the read path. Private bodies are opened with the
    /// cipher; a record that fails to open is served redacted, never failed.
    pub fn from_stored(
        msg: &StoredMessage,
        sender_name: String,
        reactions: ReactionMap,
        cipher: &MessageCipher,
    ) -> Self {
        let content = if msg.is_deleted {
            String::new()
        } else if msg.is_private {
            match (&msg.encrypted_content, &msg.iv) {
                (Some(ciphertext), Some(iv)) => match cipher.decrypt(ciphertext, iv) {
                    Ok(text) => text,
                    Err(err) => {
                        err.log();
                        REDACTED_CONTENT.to_string()
                    }
                },
                _ => REDACTED_CONTENT.to_string(),
            }
        } else {
            msg.content.clone()
        };

        Self::from_parts(msg, sender_name, content, reactions)
    }
}

// ============================================================================
// Wire Events
// ============================================================================

/// Everything a client may send, one closed union. Frames look like
/// `{"event": <name>, "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "connect")]
    Connect { token: String },

    #[serde(rename = "joinRoom", rename_all = "camelCase")]
    JoinRoom { room_id: Uuid },

    #[serde(rename = "leaveRoom", rename_all = "camelCase")]
    LeaveRoom { room_id: Uuid },

    #[serde(rename = "sendMessage", rename_all = "camelCase")]
    SendMessage {
        content: String,
        #[serde(default)]
        room_id: Option<Uuid>,
        #[serde(default)]
        recipients: Vec<Uuid>,
        #[serde(default)]
        is_private: bool,
        #[serde(default)]
        kind: MessageKind,
        #[serde(default)]
        parent_message_id: Option<Uuid>,
    },

    #[serde(rename = "editMessage", rename_all = "camelCase")]
    EditMessage { message_id: Uuid, content: String },

    #[serde(rename = "deleteMessage", rename_all = "camelCase")]
    DeleteMessage { message_id: Uuid },

    #[serde(rename = "addReaction", rename_all = "camelCase")]
    AddReaction { message_id: Uuid, emoji: String },

    #[serde(rename = "removeReaction", rename_all = "camelCase")]
    RemoveReaction { message_id: Uuid, emoji: String },

    #[serde(rename = "fetchRecent", rename_all = "camelCase")]
    FetchRecent {
        room_id: Uuid,
        #[serde(default)]
        limit: Option<usize>,
    },

    #[serde(rename = "typing_start", rename_all = "camelCase")]
    TypingStart { room_id: Uuid },

    #[serde(rename = "typing_stop", rename_all = "camelCase")]
    TypingStop { room_id: Uuid },
}

impl ClientEvent {
    /// Event name as it appears on the wire, for logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::JoinRoom { .. } => "joinRoom",
            Self::LeaveRoom { .. } => "leaveRoom",
            Self::SendMessage { .. } => "sendMessage",
            Self::EditMessage { .. } => "editMessage",
            Self::DeleteMessage { .. } => "deleteMessage",
            Self::AddReaction { .. } => "addReaction",
            Self::RemoveReaction { .. } => "removeReaction",
            Self::FetchRecent { .. } => "fetchRecent",
            Self::TypingStart { .. } => "typing_start",
            Self::TypingStop { .. } => "typing_stop",
        }
    }
}

/// Everything the gateway may emit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "connected", rename_all = "camelCase")]
    Connected {
        user_id: Uuid,
        username: String,
        /// Rooms auto-subscribed at connect
        rooms: Vec<Uuid>,
    },

    #[serde(rename = "joinedRoom", rename_all = "camelCase")]
    JoinedRoom { room: crate::rooms::RoomSummary },

    #[serde(rename = "userJoinedRoom", rename_all = "camelCase")]
    UserJoinedRoom { room_id: Uuid, user_id: Uuid },

    #[serde(rename = "leftRoom", rename_all = "camelCase")]
    LeftRoom { room_id: Uuid },

    #[serde(rename = "userLeftRoom", rename_all = "camelCase")]
    UserLeftRoom { room_id: Uuid, user_id: Uuid },

    /// Acknowledgement to the sender, carrying the persisted message
    #[serde(rename = "messageSent")]
    MessageSent(MessagePayload),

    #[serde(rename = "newMessage")]
    NewMessage(MessagePayload),

    #[serde(rename = "newPrivateMessage")]
    NewPrivateMessage(MessagePayload),

    #[serde(rename = "messageUpdated")]
    MessageUpdated(MessagePayload),

    #[serde(rename = "messageDeleted", rename_all = "camelCase")]
    MessageDeleted {
        message_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        room_id: Option<Uuid>,
    },

    #[serde(rename = "reaction_updated", rename_all = "camelCase")]
    ReactionUpdated {
        message_id: Uuid,
        reactions: ReactionMap,
    },

    #[serde(rename = "user_typing", rename_all = "camelCase")]
    UserTyping {
        room_id: Uuid,
        user_id: Uuid,
        typing: bool,
    },

    #[serde(rename = "userOnline", rename_all = "camelCase")]
    UserOnline { user_id: Uuid },

    #[serde(rename = "userOffline", rename_all = "camelCase")]
    UserOffline { user_id: Uuid },

    #[serde(rename = "recentMessages", rename_all = "camelCase")]
    RecentMessages {
        room_id: Uuid,
        messages: Vec<MessagePayload>,
    },

    #[serde(rename = "error", rename_all = "camelCase")]
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_secs: Option<i64>,
    },
}

impl ServerEvent {
    /// Broadcast event for a freshly persisted message
    pub fn new_message(payload: MessagePayload) -> Self {
        if payload.is_private {
            Self::NewPrivateMessage(payload)
        } else {
            Self::NewMessage(payload)
        }
    }

    pub fn from_error(err: &ChatError) -> Self {
        Self::Error {
            code: err.wire_code().to_string(),
            message: err.user_message(),
            retry_after_secs: err.retry_after_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_events_parse_by_wire_name() {
        let room_id = Uuid::new_v4();
        let frame = format!(r#"{{"event":"joinRoom","data":{{"roomId":"{}"}}}}"#, room_id);
        let event: ClientEvent = serde_json::from_str(&frame).unwrap();
        assert_eq!(event, ClientEvent::JoinRoom { room_id });

        let frame = format!(
            r#"{{"event":"typing_start","data":{{"roomId":"{}"}}}}"#,
            room_id
        );
        let event: ClientEvent = serde_json::from_str(&frame).unwrap();
        assert_eq!(event, ClientEvent::TypingStart { room_id });
    }

    #[test]
    fn send_message_fills_defaults() {
        let room_id = Uuid::new_v4();
        let frame = format!(
            r#"{{"event":"sendMessage","data":{{"content":"hello","roomId":"{}"}}}}"#,
            room_id
        );
        let event: ClientEvent = serde_json::from_str(&frame).unwrap();
        match event {
            ClientEvent::SendMessage {
                content,
                room_id: parsed_room,
                recipients,
                is_private,
                kind,
                parent_message_id,
            } => {
                assert_eq!(content, "hello");
                assert_eq!(parsed_room, Some(room_id));
                assert!(recipients.is_empty());
                assert!(!is_private);
                assert_eq!(kind, MessageKind::Text);
                assert_eq!(parent_message_id, None);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn unknown_event_names_fail_to_parse() {
        let frame = r#"{"event":"launchMissiles","data":{}}"#;
        assert!(serde_json::from_str::<ClientEvent>(frame).is_err());
    }

    #[test]
    fn server_events_carry_their_wire_names() {
        let user_id = Uuid::new_v4();
        let json = serde_json::to_value(ServerEvent::UserOnline { user_id }).unwrap();
        assert_eq!(json["event"], "userOnline");
        assert_eq!(json["data"]["userId"], user_id.to_string());

        let json = serde_json::to_value(ServerEvent::UserTyping {
            room_id: Uuid::new_v4(),
            user_id,
            typing: true,
        })
        .unwrap();
        assert_eq!(json["event"], "user_typing");
        assert_eq!(json["data"]["typing"], true);
    }

    #[test]
    fn error_event_includes_retry_hint_only_when_present() {
        let rate = ServerEvent::from_error(&ChatError::RateLimited { retry_after_secs: 9 });
        let json = serde_json::to_value(&rate).unwrap();
        assert_eq!(json["event"], "error");
        assert_eq!(json["data"]["code"], "rate_limit_exceeded");
        assert_eq!(json["data"]["retryAfterSecs"], 9);

        let validation = ServerEvent::from_error(&ChatError::validation("empty content"));
        let json = serde_json::to_value(&validation).unwrap();
        assert_eq!(json["data"]["code"], "validation_failed");
        assert!(json["data"].get("retryAfterSecs").is_none());
    }

    #[test]
    fn private_payloads_pick_the_private_event() {
        let payload = sample_payload(true);
        assert!(matches!(
            ServerEvent::new_message(payload),
            ServerEvent::NewPrivateMessage(_)
        ));
        let payload = sample_payload(false);
        assert!(matches!(
            ServerEvent::new_message(payload),
            ServerEvent::NewMessage(_)
        ));
    }

    #[test]
    fn stored_private_rows_decrypt_on_read() {
        let cipher = MessageCipher::new_random();
        let sealed = cipher.encrypt("quiet words").unwrap();
        let msg = sample_stored(Some(sealed.ciphertext), Some(sealed.nonce));

        let payload =
            MessagePayload::from_stored(&msg, "alice".to_string(), ReactionMap::new(), &cipher);
        assert_eq!(payload.content, "quiet words");
    }

    #[test]
    fn undecryptable_rows_are_redacted_not_failed() {
        let cipher = MessageCipher::new_random();
        let sealed = cipher.encrypt("quiet words").unwrap();
        let msg = sample_stored(Some(sealed.ciphertext), Some(sealed.nonce));

        let other = MessageCipher::new_random();
        let payload =
            MessagePayload::from_stored(&msg, "alice".to_string(), ReactionMap::new(), &other);
        assert_eq!(payload.content, REDACTED_CONTENT);
    }

    #[test]
    fn deleted_rows_serve_empty_content() {
        let mut msg = sample_stored(None, None);
        msg.is_private = false;
        msg.content = "soon gone".to_string();
        msg.is_deleted = true;

        let payload = MessagePayload::from_stored(
            &msg,
            "alice".to_string(),
            ReactionMap::new(),
            &MessageCipher::new_random(),
        );
        assert_eq!(payload.content, "");
        assert!(payload.is_deleted);
    }

    #[test]
    fn direct_audience_includes_the_sender_once() {
        let mut msg = sample_stored(None, None);
        let recipient = Uuid::new_v4();
        msg.room_id = None;
        msg.recipient_ids = vec![recipient, msg.sender_id];

        let audience = msg.direct_audience();
        assert_eq!(audience.len(), 2);
        assert!(audience.contains(&recipient));
        assert!(audience.contains(&msg.sender_id));
    }

    fn sample_stored(
        encrypted_content: Option<Vec<u8>>,
        iv: Option<Vec<u8>>,
    ) -> StoredMessage {
        let is_private = encrypted_content.is_some();
        StoredMessage {
            id: Uuid::new_v4(),
            room_id: Some(Uuid::new_v4()),
            sender_id: Uuid::new_v4(),
            recipient_ids: Vec::new(),
            kind: "text".to_string(),
            content: String::new(),
            is_private,
            encrypted_content,
            iv,
            parent_id: None,
            is_edited: false,
            is_deleted: false,
            is_flagged: false,
            moderation_reason: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn sample_payload(is_private: bool) -> MessagePayload {
        MessagePayload {
            id: Uuid::new_v4(),
            room_id: Some(Uuid::new_v4()),
            sender_id: Uuid::new_v4(),
            sender_name: "alice".to_string(),
            recipient_ids: Vec::new(),
            kind: MessageKind::Text,
            content: "hello".to_string(),
            is_private,
            parent_id: None,
            is_edited: false,
            is_deleted: false,
            is_flagged: false,
            reactions: ReactionMap::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}
