use uuid::Uuid;

use crate::context::AppContext;
use crate::error::{ChatError, ChatResult};
use crate::message::ServerEvent;

use super::SessionContext;

/// Typing indicators are ephemeral: never persisted, never rate limited.
/// The only gate is an active subscription to the room.
pub async fn handle_typing(
    ctx: &AppContext,
    session: &SessionContext,
    room_id: Uuid,
    typing: bool,
) -> ChatResult<()> {
    if !ctx
        .presence
        .is_subscribed(&session.connection_id, &room_id)
        .await
    {
        return Err(ChatError::authorization("not subscribed to this room"));
    }

    ctx.presence
        .broadcast_room(
            &room_id,
            &ServerEvent::UserTyping {
                room_id,
                user_id: session.user_id,
                typing,
            },
            Some(&session.connection_id),
        )
        .await;
    Ok(())
}
