use uuid::Uuid;

use crate::context::AppContext;
use crate::error::ChatResult;
use crate::message::ServerEvent;
use crate::rate_limit::ActionClass;

use super::{with_stage_timeout, ConnectionHandler, SessionContext};

/// Subscribes the connection after the access check. Joining a room the
/// connection already occupies refreshes the confirmation without a second
/// announcement to the room.
pub async fn handle_join(
    ctx: &AppContext,
    session: &SessionContext,
    handler: &mut ConnectionHandler,
    room_id: Uuid,
) -> ChatResult<()> {
    let room = ctx.rooms.require_room(&room_id).await?;
    ctx.rooms.check_access(&room, &session.user_id).await?;

    with_stage_timeout(
        ctx,
        "rate limit check",
        ctx.rate_limiter
            .check_and_consume(&session.user_id, ActionClass::Membership),
    )
    .await?;

    let already_subscribed = ctx
        .presence
        .is_subscribed(&session.connection_id, &room_id)
        .await;
    ctx.presence.subscribe(&session.connection_id, &room_id).await;

    let summary = ctx.rooms.summary(&room).await?;
    handler
        .send_event(&ServerEvent::JoinedRoom { room: summary })
        .await?;

    if !already_subscribed {
        ctx.presence
            .broadcast_room(
                &room_id,
                &ServerEvent::UserJoinedRoom {
                    room_id,
                    user_id: session.user_id,
                },
                Some(&session.connection_id),
            )
            .await;
    }
    Ok(())
}

/// Unsubscribes the connection. No directory check here: leaving must work
/// even for a room that has since been deactivated.
pub async fn handle_leave(
    ctx: &AppContext,
    session: &SessionContext,
    handler: &mut ConnectionHandler,
    room_id: Uuid,
) -> ChatResult<()> {
    with_stage_timeout(
        ctx,
        "rate limit check",
        ctx.rate_limiter
            .check_and_consume(&session.user_id, ActionClass::Membership),
    )
    .await?;

    let was_subscribed = ctx
        .presence
        .is_subscribed(&session.connection_id, &room_id)
        .await;
    ctx.presence
        .unsubscribe(&session.connection_id, &room_id)
        .await;

    handler.send_event(&ServerEvent::LeftRoom { room_id }).await?;

    if was_subscribed {
        ctx.presence
            .broadcast_room(
                &room_id,
                &ServerEvent::UserLeftRoom {
                    room_id,
                    user_id: session.user_id,
                },
                Some(&session.connection_id),
            )
            .await;
    }
    Ok(())
}
