use uuid::Uuid;

use crate::context::AppContext;
use crate::error::{ChatError, ChatResult};
use crate::message::{ServerEvent, StoredMessage};
use crate::rate_limit::ActionClass;

use super::messages::{broadcast_to_audience, require_message};
use super::{with_stage_timeout, ConnectionHandler, SessionContext};

/// Matches the emoji column width
const MAX_EMOJI_CHARS: usize = 32;

/// Toggle: a reaction the user already holds on this message is removed,
/// otherwise it is added. Everyone in the audience gets the message's full
/// reaction state afterwards.
pub async fn handle_add(
    ctx: &AppContext,
    session: &SessionContext,
    handler: &mut ConnectionHandler,
    message_id: Uuid,
    emoji: String,
) -> ChatResult<()> {
    let emoji = valid_emoji(&emoji)?;
    let msg = require_message(ctx, &message_id).await?;
    if msg.is_deleted {
        return Err(ChatError::validation("message is deleted"));
    }
    check_audience(ctx, session, &msg).await?;

    with_stage_timeout(
        ctx,
        "rate limit check",
        ctx.rate_limiter
            .check_and_consume(&session.user_id, ActionClass::Reaction),
    )
    .await?;

    let reactions = with_stage_timeout(
        ctx,
        "persist",
        ctx.store.toggle_reaction(&msg, &session.user_id, emoji),
    )
    .await?;

    let event = ServerEvent::ReactionUpdated {
        message_id: msg.id,
        reactions,
    };
    broadcast_to_audience(ctx, &msg, &event, Some(&session.connection_id)).await;
    handler.send_event(&event).await
}

/// Plain removal, idempotent: removing a reaction that was never added
/// still succeeds and reports the current state.
pub async fn handle_remove(
    ctx: &AppContext,
    session: &SessionContext,
    handler: &mut ConnectionHandler,
    message_id: Uuid,
    emoji: String,
) -> ChatResult<()> {
    let emoji = valid_emoji(&emoji)?;
    let msg = require_message(ctx, &message_id).await?;
    check_audience(ctx, session, &msg).await?;

    with_stage_timeout(
        ctx,
        "rate limit check",
        ctx.rate_limiter
            .check_and_consume(&session.user_id, ActionClass::Reaction),
    )
    .await?;

    let reactions = with_stage_timeout(
        ctx,
        "persist",
        ctx.store.remove_reaction(&msg, &session.user_id, emoji),
    )
    .await?;

    let event = ServerEvent::ReactionUpdated {
        message_id: msg.id,
        reactions,
    };
    broadcast_to_audience(ctx, &msg, &event, Some(&session.connection_id)).await;
    handler.send_event(&event).await
}

fn valid_emoji(emoji: &str) -> ChatResult<&str> {
    let emoji = emoji.trim();
    if emoji.is_empty() || emoji.chars().count() > MAX_EMOJI_CHARS {
        return Err(ChatError::validation("invalid reaction emoji"));
    }
    Ok(emoji)
}

/// Reacting requires being in the message's audience: room access for room
/// messages, participation for direct ones.
async fn check_audience(
    ctx: &AppContext,
    session: &SessionContext,
    msg: &StoredMessage,
) -> ChatResult<()> {
    match msg.room_id {
        Some(room_id) => {
            let room = ctx.rooms.require_room(&room_id).await?;
            ctx.rooms.check_access(&room, &session.user_id).await
        }
        None => {
            if msg.direct_audience().contains(&session.user_id) {
                Ok(())
            } else {
                Err(ChatError::authorization(
                    "not a participant in this conversation",
                ))
            }
        }
    }
}
