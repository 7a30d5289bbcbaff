use std::collections::HashSet;

use tracing::debug;
use uuid::Uuid;

use crate::context::AppContext;
use crate::error::{ChatError, ChatResult};
use crate::message::{MessageKind, MessagePayload, ReactionMap, ServerEvent, StoredMessage};
use crate::metrics;
use crate::rate_limit::ActionClass;
use crate::rooms::Room;
use crate::store::{EditedBody, NewMessage};
use crate::utils;

use super::{with_stage_timeout, ConnectionHandler, SessionContext};

const DEFAULT_FETCH_LIMIT: usize = 50;
const PROFANITY_REASON: &str = "profanity";

pub struct SendRequest {
    pub content: String,
    pub room_id: Option<Uuid>,
    pub recipients: Vec<Uuid>,
    pub is_private: bool,
    pub kind: MessageKind,
    pub parent_message_id: Option<Uuid>,
}

enum Destination {
    Room(Room),
    Direct(Vec<Uuid>),
}

/// The full pipeline, in fixed order: validation, rate limit, moderation,
/// encryption (private only), persistence, broadcast. A failure at any
/// stage stops the pipeline and reaches only the sender; nothing is ever
/// broadcast before the row is durable.
pub async fn handle_send(
    ctx: &AppContext,
    session: &SessionContext,
    handler: &mut ConnectionHandler,
    req: SendRequest,
) -> ChatResult<()> {
    let timer = metrics::MESSAGE_PIPELINE_TIME.start_timer();

    // 1. Validation
    let content = req.content.trim();
    if content.is_empty() {
        return Err(ChatError::validation("message content is empty"));
    }
    let max_chars = ctx.config.pipeline.max_content_chars;
    if content.chars().count() > max_chars {
        return Err(ChatError::validation(format!(
            "message exceeds {} characters",
            max_chars
        )));
    }

    let destination = resolve_destination(ctx, session, &req).await?;

    if req.kind.is_attachment() {
        if let Destination::Room(room) = &destination {
            if !room.allow_file_sharing {
                return Err(ChatError::validation("file sharing is disabled in this room"));
            }
        }
    }

    if let Some(parent_id) = req.parent_message_id {
        let parent = ctx
            .store
            .message_by_id(&parent_id)
            .await?
            .ok_or_else(|| ChatError::validation("parent message not found"))?;
        if let Destination::Room(room) = &destination {
            if parent.room_id != Some(room.id) {
                return Err(ChatError::validation("parent message is in another room"));
            }
        }
    }

    // 2. Rate limit
    with_stage_timeout(
        ctx,
        "rate limit check",
        ctx.rate_limiter
            .check_and_consume(&session.user_id, ActionClass::Message),
    )
    .await?;

    // 3. Moderation. A room can switch off the profanity stage for itself;
    //    direct messages always get the full pipeline.
    let profanity_enabled = match &destination {
        Destination::Room(room) => room.moderation_enabled,
        Destination::Direct(_) => true,
    };
    let moderated = ctx.moderation.apply(content, profanity_enabled)?;
    if moderated.was_filtered {
        metrics::MESSAGES_FLAGGED_TOTAL.inc();
    }

    // 4. Encryption. Stored private rows carry ciphertext with cleared
    //    content; the plaintext lives on only in this stack frame.
    let is_private = req.is_private || matches!(destination, Destination::Direct(_));
    let (stored_content, encrypted_content, iv) = if is_private {
        let sealed = ctx.cipher.encrypt(&moderated.content)?;
        (String::new(), Some(sealed.ciphertext), Some(sealed.nonce))
    } else {
        (moderated.content.clone(), None, None)
    };

    // 5. Persist
    let (room_id, recipient_ids) = match &destination {
        Destination::Room(room) => (Some(room.id), Vec::new()),
        Destination::Direct(recipients) => (None, recipients.clone()),
    };
    let new = NewMessage {
        room_id,
        sender_id: session.user_id,
        recipient_ids,
        kind: req.kind,
        content: stored_content,
        is_private,
        encrypted_content,
        iv,
        parent_id: req.parent_message_id,
        is_flagged: moderated.was_filtered,
        moderation_reason: moderated.was_filtered.then(|| PROFANITY_REASON.to_string()),
    };
    let stored = with_stage_timeout(ctx, "persist", ctx.store.create_message(new)).await?;

    // 6. Broadcast to the audience, then acknowledge to the sender with the
    //    persisted message. The sending connection gets only the ack; the
    //    sender's other connections receive the broadcast.
    let payload = MessagePayload::from_parts(
        &stored,
        session.username.clone(),
        moderated.content,
        ReactionMap::new(),
    );
    let event = ServerEvent::new_message(payload.clone());
    broadcast_to_audience(ctx, &stored, &event, Some(&session.connection_id)).await;

    metrics::MESSAGES_SENT_TOTAL.inc();
    debug!(message_id = %stored.id, private = is_private, "Message delivered");
    timer.observe_duration();

    handler.send_event(&ServerEvent::MessageSent(payload)).await
}

/// Sender-only edit. The replacement body re-runs moderation and, for
/// private messages, re-encryption; the audience receives `messageUpdated`.
pub async fn handle_edit(
    ctx: &AppContext,
    session: &SessionContext,
    handler: &mut ConnectionHandler,
    message_id: Uuid,
    content: String,
) -> ChatResult<()> {
    let content = content.trim();
    if content.is_empty() {
        return Err(ChatError::validation("message content is empty"));
    }
    let max_chars = ctx.config.pipeline.max_content_chars;
    if content.chars().count() > max_chars {
        return Err(ChatError::validation(format!(
            "message exceeds {} characters",
            max_chars
        )));
    }

    let msg = require_message(ctx, &message_id).await?;
    if msg.sender_id != session.user_id {
        return Err(ChatError::authorization("only the sender may edit a message"));
    }
    if msg.is_deleted {
        return Err(ChatError::validation("message is deleted"));
    }

    with_stage_timeout(
        ctx,
        "rate limit check",
        ctx.rate_limiter
            .check_and_consume(&session.user_id, ActionClass::Message),
    )
    .await?;

    let profanity_enabled = match msg.room_id {
        Some(room_id) => ctx
            .rooms
            .room_by_id(&room_id)
            .await?
            .map(|room| room.moderation_enabled)
            .unwrap_or(true),
        None => true,
    };
    let moderated = ctx.moderation.apply(content, profanity_enabled)?;
    if moderated.was_filtered {
        metrics::MESSAGES_FLAGGED_TOTAL.inc();
    }

    let body = if msg.is_private {
        let sealed = ctx.cipher.encrypt(&moderated.content)?;
        EditedBody {
            content: String::new(),
            encrypted_content: Some(sealed.ciphertext),
            iv: Some(sealed.nonce),
            is_flagged: moderated.was_filtered,
            moderation_reason: moderated.was_filtered.then(|| PROFANITY_REASON.to_string()),
        }
    } else {
        EditedBody {
            content: moderated.content.clone(),
            encrypted_content: None,
            iv: None,
            is_flagged: moderated.was_filtered,
            moderation_reason: moderated.was_filtered.then(|| PROFANITY_REASON.to_string()),
        }
    };

    let updated = with_stage_timeout(ctx, "persist", ctx.store.apply_edit(&msg, body)).await?;
    let reactions = ctx.store.reactions_for(&updated.id).await?;
    let payload = MessagePayload::from_parts(
        &updated,
        session.username.clone(),
        moderated.content,
        reactions,
    );
    let event = ServerEvent::MessageUpdated(payload);

    broadcast_to_audience(ctx, &updated, &event, Some(&session.connection_id)).await;
    handler.send_event(&event).await
}

/// Sender-only logical delete. The row stays; the audience receives
/// `messageDeleted` and reads serve blank content from here on.
pub async fn handle_delete(
    ctx: &AppContext,
    session: &SessionContext,
    handler: &mut ConnectionHandler,
    message_id: Uuid,
) -> ChatResult<()> {
    let msg = require_message(ctx, &message_id).await?;
    if msg.sender_id != session.user_id {
        return Err(ChatError::authorization(
            "only the sender may delete a message",
        ));
    }

    let event = ServerEvent::MessageDeleted {
        message_id: msg.id,
        room_id: msg.room_id,
    };

    // Deleting twice confirms to the caller without a second broadcast
    if msg.is_deleted {
        return handler.send_event(&event).await;
    }

    with_stage_timeout(
        ctx,
        "rate limit check",
        ctx.rate_limiter
            .check_and_consume(&session.user_id, ActionClass::Message),
    )
    .await?;

    let deleted = with_stage_timeout(ctx, "persist", ctx.store.mark_deleted(&msg)).await?;

    broadcast_to_audience(ctx, &deleted, &event, Some(&session.connection_id)).await;
    handler.send_event(&event).await
}

/// Recent window for one room, to the requesting connection only. Served
/// from the cache when warm; private bodies are decrypted server-side and
/// a record that cannot be opened comes back redacted.
pub async fn handle_fetch_recent(
    ctx: &AppContext,
    session: &SessionContext,
    handler: &mut ConnectionHandler,
    room_id: Uuid,
    limit: Option<usize>,
) -> ChatResult<()> {
    let room = ctx.rooms.require_room(&room_id).await?;
    ctx.rooms.check_access(&room, &session.user_id).await?;

    let limit = limit.unwrap_or(DEFAULT_FETCH_LIMIT).max(1);
    let rows = ctx.store.recent_messages(&room_id, limit).await?;

    let ids: Vec<Uuid> = rows.iter().map(|msg| msg.id).collect();
    let mut reactions = ctx.store.reactions_for_many(&ids).await?;

    let mut messages = Vec::with_capacity(rows.len());
    for msg in &rows {
        let sender_name = match ctx.presence.username_of(&msg.sender_id).await {
            Some(name) => name,
            None => utils::fallback_username(&msg.sender_id),
        };
        let map = reactions.remove(&msg.id).unwrap_or_default();
        messages.push(MessagePayload::from_stored(
            msg,
            sender_name,
            map,
            &ctx.cipher,
        ));
    }

    handler
        .send_event(&ServerEvent::RecentMessages { room_id, messages })
        .await
}

pub(super) async fn require_message(
    ctx: &AppContext,
    message_id: &Uuid,
) -> ChatResult<StoredMessage> {
    ctx.store
        .message_by_id(message_id)
        .await?
        .ok_or_else(|| ChatError::validation("message not found"))
}

/// Room messages go to the room's subscribers, direct messages to every
/// connection of the recipients and the sender.
pub(super) async fn broadcast_to_audience(
    ctx: &AppContext,
    msg: &StoredMessage,
    event: &ServerEvent,
    exclude_conn: Option<&Uuid>,
) {
    match msg.room_id {
        Some(room_id) => {
            ctx.presence
                .broadcast_room(&room_id, event, exclude_conn)
                .await;
        }
        None => {
            ctx.presence
                .send_to_users(&msg.direct_audience(), event, exclude_conn)
                .await;
        }
    }
}

async fn resolve_destination(
    ctx: &AppContext,
    session: &SessionContext,
    req: &SendRequest,
) -> ChatResult<Destination> {
    match (req.room_id, req.recipients.is_empty()) {
        (Some(room_id), true) => {
            let room = ctx.rooms.require_room(&room_id).await?;
            ctx.rooms.check_access(&room, &session.user_id).await?;
            Ok(Destination::Room(room))
        }
        (None, false) => {
            let mut seen = HashSet::new();
            let recipients: Vec<Uuid> = req
                .recipients
                .iter()
                .copied()
                .filter(|id| *id != session.user_id && seen.insert(*id))
                .collect();
            if recipients.is_empty() {
                return Err(ChatError::validation(
                    "a direct message needs at least one recipient",
                ));
            }
            Ok(Destination::Direct(recipients))
        }
        _ => Err(ChatError::validation(
            "exactly one destination: a room or a recipient list",
        )),
    }
}
