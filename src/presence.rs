use std::collections::{HashMap, HashSet};

use tokio::sync::{mpsc, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::kv::KvClient;
use crate::message::ServerEvent;

/// Redis mirror keys expire on their own so a crashed node cannot leave
/// users online forever.
const PRESENCE_TTL_SECS: i64 = 3600;

pub type EventSender = mpsc::UnboundedSender<ServerEvent>;

#[derive(Clone)]
struct ConnectionEntry {
    user_id: Uuid,
    username: String,
    tx: EventSender,
}

#[derive(Default)]
struct RoomIndex {
    by_room: HashMap<Uuid, HashSet<Uuid>>,
    by_conn: HashMap<Uuid, HashSet<Uuid>>,
}

/// What `unregister` hands back so the gateway can finish the disconnect:
/// whose socket closed, whether that was their last one, and which rooms
/// the connection was subscribed to.
pub struct Disconnected {
    pub user_id: Uuid,
    pub went_offline: bool,
    pub rooms: Vec<Uuid>,
}

/// In-process connection, online-user and room-subscription state.
///
/// All mutation goes through these methods. Where more than one lock is
/// needed the acquisition order is fixed: connections, then users, then
/// rooms. Sends go over unbounded channels and never block under a lock.
pub struct PresenceRegistry {
    connections: RwLock<HashMap<Uuid, ConnectionEntry>>,
    user_connections: RwLock<HashMap<Uuid, HashSet<Uuid>>>,
    rooms: RwLock<RoomIndex>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            user_connections: RwLock::new(HashMap::new()),
            rooms: RwLock::new(RoomIndex::default()),
        }
    }

    /// Records a live connection. Returns true only when this is the user's
    /// first open connection, which is the one moment `userOnline` may fire.
    pub async fn register(
        &self,
        conn_id: Uuid,
        user_id: Uuid,
        username: String,
        tx: EventSender,
    ) -> bool {
        self.connections.write().await.insert(
            conn_id,
            ConnectionEntry {
                user_id,
                username,
                tx,
            },
        );

        let mut users = self.user_connections.write().await;
        let set = users.entry(user_id).or_default();
        let came_online = set.is_empty();
        set.insert(conn_id);
        came_online
    }

    /// Removes a connection and all of its subscriptions. Returns None for
    /// an id that was never registered.
    pub async fn unregister(&self, conn_id: &Uuid) -> Option<Disconnected> {
        let entry = self.connections.write().await.remove(conn_id)?;

        let went_offline = {
            let mut users = self.user_connections.write().await;
            match users.get_mut(&entry.user_id) {
                Some(set) => {
                    set.remove(conn_id);
                    if set.is_empty() {
                        users.remove(&entry.user_id);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };

        let rooms = {
            let mut index = self.rooms.write().await;
            let subscribed = index.by_conn.remove(conn_id).unwrap_or_default();
            for room_id in &subscribed {
                if let Some(subs) = index.by_room.get_mut(room_id) {
                    subs.remove(conn_id);
                    if subs.is_empty() {
                        index.by_room.remove(room_id);
                    }
                }
            }
            subscribed.into_iter().collect()
        };

        Some(Disconnected {
            user_id: entry.user_id,
            went_offline,
            rooms,
        })
    }

    pub async fn subscribe(&self, conn_id: &Uuid, room_id: &Uuid) {
        let mut index = self.rooms.write().await;
        index.by_room.entry(*room_id).or_default().insert(*conn_id);
        index.by_conn.entry(*conn_id).or_default().insert(*room_id);
    }

    /// Idempotent; unsubscribing a connection that never joined is a no-op.
    pub async fn unsubscribe(&self, conn_id: &Uuid, room_id: &Uuid) {
        let mut index = self.rooms.write().await;
        if let Some(subs) = index.by_room.get_mut(room_id) {
            subs.remove(conn_id);
            if subs.is_empty() {
                index.by_room.remove(room_id);
            }
        }
        if let Some(rooms) = index.by_conn.get_mut(conn_id) {
            rooms.remove(room_id);
            if rooms.is_empty() {
                index.by_conn.remove(conn_id);
            }
        }
    }

    pub async fn is_subscribed(&self, conn_id: &Uuid, room_id: &Uuid) -> bool {
        self.rooms
            .read()
            .await
            .by_conn
            .get(conn_id)
            .map(|rooms| rooms.contains(room_id))
            .unwrap_or(false)
    }

    /// Delivers an event to every connection subscribed to the room, minus
    /// the excluded connection (usually the originator's).
    pub async fn broadcast_room(
        &self,
        room_id: &Uuid,
        event: &ServerEvent,
        exclude: Option<&Uuid>,
    ) {
        let targets: Vec<Uuid> = {
            let index = self.rooms.read().await;
            match index.by_room.get(room_id) {
                Some(subs) => subs
                    .iter()
                    .filter(|conn_id| Some(*conn_id) != exclude)
                    .copied()
                    .collect(),
                None => return,
            }
        };

        let connections = self.connections.read().await;
        for conn_id in targets {
            if let Some(entry) = connections.get(&conn_id) {
                if entry.tx.send(event.clone()).is_err() {
                    // Receiver task already gone; unregister will clean up
                    debug!(connection_id = %conn_id, "Dropped event for closed connection");
                }
            }
        }
    }

    /// Delivers an event to every open connection of one user, minus the
    /// excluded connection.
    pub async fn send_to_user(&self, user_id: &Uuid, event: &ServerEvent, exclude: Option<&Uuid>) {
        let conn_ids: Vec<Uuid> = {
            let users = self.user_connections.read().await;
            match users.get(user_id) {
                Some(set) => set
                    .iter()
                    .filter(|conn_id| Some(*conn_id) != exclude)
                    .copied()
                    .collect(),
                None => return,
            }
        };

        let connections = self.connections.read().await;
        for conn_id in conn_ids {
            if let Some(entry) = connections.get(&conn_id) {
                if entry.tx.send(event.clone()).is_err() {
                    debug!(connection_id = %conn_id, "Dropped event for closed connection");
                }
            }
        }
    }

    pub async fn send_to_users(&self, user_ids: &[Uuid], event: &ServerEvent, exclude: Option<&Uuid>) {
        for user_id in user_ids {
            self.send_to_user(user_id, event, exclude).await;
        }
    }

    pub async fn is_online(&self, user_id: &Uuid) -> bool {
        self.user_connections.read().await.contains_key(user_id)
    }

    /// Display name of a currently connected user, from any of their
    /// connection entries.
    pub async fn username_of(&self, user_id: &Uuid) -> Option<String> {
        let conn_id = {
            let users = self.user_connections.read().await;
            users.get(user_id)?.iter().next().copied()?
        };
        self.connections
            .read()
            .await
            .get(&conn_id)
            .map(|entry| entry.username.clone())
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn online_count(&self) -> usize {
        self.user_connections.read().await.len()
    }
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Best-effort Redis mirror of the in-process presence map. Failures are
/// logged and never affect registration.
pub async fn mirror_connect(kv: &KvClient, user_id: &Uuid, conn_id: &Uuid) {
    let key = presence_key(user_id);
    let mut kv = kv.clone();
    if let Err(err) = kv.sadd(&key, &conn_id.to_string()).await {
        debug!(error = %err, "Presence mirror add failed");
        return;
    }
    if let Err(err) = kv.expire(&key, PRESENCE_TTL_SECS).await {
        debug!(error = %err, "Presence mirror expire failed");
    }
}

pub async fn mirror_disconnect(kv: &KvClient, user_id: &Uuid, conn_id: &Uuid) {
    let mut kv = kv.clone();
    if let Err(err) = kv.srem(&presence_key(user_id), &conn_id.to_string()).await {
        debug!(error = %err, "Presence mirror remove failed");
    }
}

fn presence_key(user_id: &Uuid) -> String {
    format!("presence:{}", user_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (EventSender, mpsc::UnboundedReceiver<ServerEvent>) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn online_fires_only_on_first_connection() {
        let registry = PresenceRegistry::new();
        let user_id = Uuid::new_v4();
        let (tx_a, _rx_a) = channel();
        let (tx_b, _rx_b) = channel();
        let conn_a = Uuid::new_v4();
        let conn_b = Uuid::new_v4();

        assert!(registry.register(conn_a, user_id, "alice".into(), tx_a).await);
        assert!(!registry.register(conn_b, user_id, "alice".into(), tx_b).await);
        assert!(registry.is_online(&user_id).await);
        assert_eq!(registry.connection_count().await, 2);
        assert_eq!(registry.online_count().await, 1);
    }

    #[tokio::test]
    async fn offline_fires_only_on_last_disconnect() {
        let registry = PresenceRegistry::new();
        let user_id = Uuid::new_v4();
        let (tx_a, _rx_a) = channel();
        let (tx_b, _rx_b) = channel();
        let conn_a = Uuid::new_v4();
        let conn_b = Uuid::new_v4();

        registry.register(conn_a, user_id, "alice".into(), tx_a).await;
        registry.register(conn_b, user_id, "alice".into(), tx_b).await;

        let first = registry.unregister(&conn_a).await.unwrap();
        assert!(!first.went_offline);
        assert!(registry.is_online(&user_id).await);

        let second = registry.unregister(&conn_b).await.unwrap();
        assert!(second.went_offline);
        assert!(!registry.is_online(&user_id).await);
        assert_eq!(registry.connection_count().await, 0);
    }

    #[tokio::test]
    async fn unregister_reports_and_clears_subscriptions() {
        let registry = PresenceRegistry::new();
        let user_id = Uuid::new_v4();
        let room_id = Uuid::new_v4();
        let (tx, _rx) = channel();
        let conn_id = Uuid::new_v4();

        registry.register(conn_id, user_id, "alice".into(), tx).await;
        registry.subscribe(&conn_id, &room_id).await;
        assert!(registry.is_subscribed(&conn_id, &room_id).await);

        let gone = registry.unregister(&conn_id).await.unwrap();
        assert_eq!(gone.rooms, vec![room_id]);

        // The room's subscriber set must not retain the dead connection
        let (tx2, mut rx2) = channel();
        let conn2 = Uuid::new_v4();
        registry.register(conn2, user_id, "alice".into(), tx2).await;
        registry.subscribe(&conn2, &room_id).await;
        registry
            .broadcast_room(&room_id, &ServerEvent::UserOnline { user_id }, None)
            .await;
        assert!(rx2.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_skips_the_excluded_connection() {
        let registry = PresenceRegistry::new();
        let room_id = Uuid::new_v4();
        let (tx_a, mut rx_a) = channel();
        let (tx_b, mut rx_b) = channel();
        let conn_a = Uuid::new_v4();
        let conn_b = Uuid::new_v4();

        registry
            .register(conn_a, Uuid::new_v4(), "alice".into(), tx_a)
            .await;
        registry
            .register(conn_b, Uuid::new_v4(), "bob".into(), tx_b)
            .await;
        registry.subscribe(&conn_a, &room_id).await;
        registry.subscribe(&conn_b, &room_id).await;

        let event = ServerEvent::UserTyping {
            room_id,
            user_id: Uuid::new_v4(),
            typing: true,
        };
        registry.broadcast_room(&room_id, &event, Some(&conn_a)).await;

        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap(), event);
    }

    #[tokio::test]
    async fn send_to_user_reaches_every_connection() {
        let registry = PresenceRegistry::new();
        let user_id = Uuid::new_v4();
        let (tx_a, mut rx_a) = channel();
        let (tx_b, mut rx_b) = channel();

        registry
            .register(Uuid::new_v4(), user_id, "alice".into(), tx_a)
            .await;
        registry
            .register(Uuid::new_v4(), user_id, "alice".into(), tx_b)
            .await;

        let event = ServerEvent::UserOffline {
            user_id: Uuid::new_v4(),
        };
        registry.send_to_user(&user_id, &event, None).await;
        assert_eq!(rx_a.try_recv().unwrap(), event);
        assert_eq!(rx_b.try_recv().unwrap(), event);
    }

    #[tokio::test]
    async fn send_to_user_can_skip_one_connection() {
        let registry = PresenceRegistry::new();
        let user_id = Uuid::new_v4();
        let (tx_a, mut rx_a) = channel();
        let (tx_b, mut rx_b) = channel();
        let conn_a = Uuid::new_v4();

        registry.register(conn_a, user_id, "alice".into(), tx_a).await;
        registry
            .register(Uuid::new_v4(), user_id, "alice".into(), tx_b)
            .await;

        let event = ServerEvent::UserOnline { user_id };
        registry.send_to_user(&user_id, &event, Some(&conn_a)).await;
        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap(), event);
    }

    #[tokio::test]
    async fn username_resolves_while_connected() {
        let registry = PresenceRegistry::new();
        let user_id = Uuid::new_v4();
        let (tx, _rx) = channel();
        let conn_id = Uuid::new_v4();

        assert_eq!(registry.username_of(&user_id).await, None);
        registry.register(conn_id, user_id, "alice".into(), tx).await;
        assert_eq!(registry.username_of(&user_id).await.as_deref(), Some("alice"));
    }
}
