// ============================================================================
// Chat Gateway - WebSocket entry point
// ============================================================================
//
// One spawned task per accepted socket. The first frame must be a `connect`
// event carrying a JWT; after that the task runs a select! loop over the
// socket and the connection's outbound channel, dispatching each inbound
// event through one explicit match. Events on a connection are processed
// inline and sequentially, which is what keeps one sender's messages to one
// room in receipt order.
//
// ============================================================================

mod connection;
mod messages;
mod reactions;
mod rooms;
mod typing;

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::AppContext;
use crate::error::{ChatError, ChatResult};
use crate::message::{ClientEvent, ServerEvent};
use crate::metrics;
use crate::presence;
use crate::utils::display_user_id;

pub use connection::{ConnectionHandler, WebSocketStreamType};

/// Everything a handler may know about the authenticated session. Built
/// once at handshake and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub connection_id: Uuid,
    pub user_id: Uuid,
    pub username: String,
    pub connected_at: DateTime<Utc>,
}

/// Wraps a pipeline stage in the configured budget. A stage that overruns
/// fails only the current operation; nothing is retried.
pub(crate) async fn with_stage_timeout<T, F>(
    ctx: &AppContext,
    stage: &str,
    fut: F,
) -> ChatResult<T>
where
    F: Future<Output = ChatResult<T>>,
{
    let budget = Duration::from_secs(ctx.config.pipeline.stage_timeout_secs);
    match tokio::time::timeout(budget, fut).await {
        Ok(result) => result,
        Err(_) => Err(ChatError::timeout(stage)),
    }
}

pub async fn handle_socket(ws_stream: WebSocketStreamType, addr: SocketAddr, ctx: AppContext) {
    metrics::CONNECTIONS_TOTAL.inc();

    let (ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    let mut handler = ConnectionHandler::new(ws_sender, addr);

    // The socket is useless until the handshake binds it to a user; a
    // failed or missing connect frame closes it right away.
    let session = match handshake(&ctx, &mut handler, &mut ws_receiver).await {
        Ok(session) => session,
        Err(err) => {
            err.log();
            handler.send_error(&err).await;
            handler.close().await;
            return;
        }
    };

    let user = display_user_id(&session.user_id, &ctx.config.logging);
    info!(user = %user, connection_id = %session.connection_id, "Session established");

    let came_online = ctx
        .presence
        .register(
            session.connection_id,
            session.user_id,
            session.username.clone(),
            tx,
        )
        .await;
    presence::mirror_connect(&ctx.kv, &session.user_id, &session.connection_id).await;
    metrics::CONNECTIONS_ACTIVE.set(ctx.presence.connection_count().await as i64);
    metrics::USERS_ONLINE.set(ctx.presence.online_count().await as i64);

    // Auto-subscribe to the user's persistent rooms
    let joined_rooms = match ctx.rooms.room_ids_for_user(&session.user_id).await {
        Ok(ids) => ids,
        Err(err) => {
            warn!(user = %user, error = %err, "Room lookup failed at connect");
            Vec::new()
        }
    };
    for room_id in &joined_rooms {
        ctx.presence.subscribe(&session.connection_id, room_id).await;
    }

    if handler
        .send_event(&ServerEvent::Connected {
            user_id: session.user_id,
            username: session.username.clone(),
            rooms: joined_rooms.clone(),
        })
        .await
        .is_err()
    {
        finish(&ctx, &session).await;
        return;
    }

    // First connection for this user: announce to every room they occupy
    if came_online {
        let event = ServerEvent::UserOnline {
            user_id: session.user_id,
        };
        for room_id in &joined_rooms {
            ctx.presence
                .broadcast_room(room_id, &event, Some(&session.connection_id))
                .await;
        }
    }

    loop {
        tokio::select! {
            inbound = ws_receiver.next() => {
                match inbound {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<ClientEvent>(&text) {
                            Ok(event) => {
                                if let Err(err) = dispatch(&ctx, &session, &mut handler, event).await {
                                    err.log();
                                    handler.send_error(&err).await;
                                }
                            }
                            Err(err) => {
                                debug!(user = %user, error = %err, "Unparseable client frame");
                                handler
                                    .send_error(&ChatError::validation("malformed event payload"))
                                    .await;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) => {
                        debug!(user = %user, "Connection closed by client");
                        break;
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = handler.pong(data).await;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(user = %user, error = %err, "WebSocket read error");
                        break;
                    }
                    None => break,
                }
            }

            outbound = rx.recv() => {
                match outbound {
                    Some(event) => {
                        if handler.send_event(&event).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    finish(&ctx, &session).await;
    info!(
        user = %user,
        connection_id = %session.connection_id,
        duration_secs = (Utc::now() - session.connected_at).num_seconds(),
        "Session closed"
    );
}

/// Waits for the single `connect` frame, verifying its token. Ping frames
/// are answered while waiting; anything else fails the handshake.
async fn handshake(
    ctx: &AppContext,
    handler: &mut ConnectionHandler,
    ws_receiver: &mut (impl StreamExt<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
              + Unpin),
) -> ChatResult<SessionContext> {
    let budget = Duration::from_secs(ctx.config.pipeline.handshake_timeout_secs);
    let deadline = tokio::time::Instant::now() + budget;

    loop {
        let frame = tokio::time::timeout_at(deadline, ws_receiver.next())
            .await
            .map_err(|_| ChatError::auth("no connect frame before handshake timeout"))?;

        match frame {
            Some(Ok(WsMessage::Text(text))) => {
                let event: ClientEvent = serde_json::from_str(&text)
                    .map_err(|_| ChatError::auth("expected a connect event"))?;
                let ClientEvent::Connect { token } = event else {
                    return Err(ChatError::auth("expected a connect event"));
                };

                let user = ctx.auth_manager.verify_token(&token)?;
                return Ok(SessionContext {
                    connection_id: Uuid::new_v4(),
                    user_id: user.user_id,
                    username: user.username,
                    connected_at: Utc::now(),
                });
            }
            Some(Ok(WsMessage::Ping(data))) => {
                let _ = handler.pong(data).await;
            }
            Some(Ok(WsMessage::Close(_))) | None => {
                return Err(ChatError::auth("connection closed during handshake"));
            }
            Some(Ok(_)) => {
                return Err(ChatError::auth("expected a connect event"));
            }
            Some(Err(err)) => {
                return Err(ChatError::WebSocket(err.to_string()));
            }
        }
    }
}

/// Every post-handshake event goes through this one match. Handlers check
/// authorization and rate limits themselves, as their first steps.
async fn dispatch(
    ctx: &AppContext,
    session: &SessionContext,
    handler: &mut ConnectionHandler,
    event: ClientEvent,
) -> ChatResult<()> {
    match event {
        ClientEvent::Connect { .. } => {
            Err(ChatError::validation("session already established"))
        }
        ClientEvent::JoinRoom { room_id } => {
            rooms::handle_join(ctx, session, handler, room_id).await
        }
        ClientEvent::LeaveRoom { room_id } => {
            rooms::handle_leave(ctx, session, handler, room_id).await
        }
        ClientEvent::SendMessage {
            content,
            room_id,
            recipients,
            is_private,
            kind,
            parent_message_id,
        } => {
            messages::handle_send(
                ctx,
                session,
                handler,
                messages::SendRequest {
                    content,
                    room_id,
                    recipients,
                    is_private,
                    kind,
                    parent_message_id,
                },
            )
            .await
        }
        ClientEvent::EditMessage {
            message_id,
            content,
        } => messages::handle_edit(ctx, session, handler, message_id, content).await,
        ClientEvent::DeleteMessage { message_id } => {
            messages::handle_delete(ctx, session, handler, message_id).await
        }
        ClientEvent::FetchRecent { room_id, limit } => {
            messages::handle_fetch_recent(ctx, session, handler, room_id, limit).await
        }
        ClientEvent::AddReaction { message_id, emoji } => {
            reactions::handle_add(ctx, session, handler, message_id, emoji).await
        }
        ClientEvent::RemoveReaction { message_id, emoji } => {
            reactions::handle_remove(ctx, session, handler, message_id, emoji).await
        }
        ClientEvent::TypingStart { room_id } => {
            typing::handle_typing(ctx, session, room_id, true).await
        }
        ClientEvent::TypingStop { room_id } => {
            typing::handle_typing(ctx, session, room_id, false).await
        }
    }
}

/// Disconnect path shared by every exit: drop presence state, mirror the
/// removal, and announce `userOffline` once the last connection is gone.
async fn finish(ctx: &AppContext, session: &SessionContext) {
    if let Some(gone) = ctx.presence.unregister(&session.connection_id).await {
        presence::mirror_disconnect(&ctx.kv, &gone.user_id, &session.connection_id).await;

        if gone.went_offline {
            let event = ServerEvent::UserOffline {
                user_id: gone.user_id,
            };
            for room_id in &gone.rooms {
                ctx.presence.broadcast_room(room_id, &event, None).await;
            }
        }
    }
    metrics::CONNECTIONS_ACTIVE.set(ctx.presence.connection_count().await as i64);
    metrics::USERS_ONLINE.set(ctx.presence.online_count().await as i64);
}
