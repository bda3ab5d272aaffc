use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use studybuddy_types::events::GatewayEvent;

/// A serialized event fanned out to every connection. Connections drop
/// group-scoped ones they are not subscribed to.
#[derive(Debug, Clone)]
pub struct Broadcast {
    pub group_id: Option<i64>,
    pub json: Arc<str>,
}

/// Messages addressed to every connection of one user.
#[derive(Debug, Clone)]
pub enum UserMessage {
    Event(GatewayEvent),
    /// The user lost access to a group: drop its subscription and presence.
    Revoke { group_id: i64 },
}

/// Realtime notifier shared by the REST handlers and the gateway connections.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    broadcast_tx: broadcast::Sender<Broadcast>,

    /// user_id -> (conn_id -> sender). A user may hold several connections.
    user_channels: RwLock<HashMap<i64, HashMap<Uuid, mpsc::UnboundedSender<UserMessage>>>>,

    /// group_id -> (user_id -> number of connections tracking the group)
    presence: RwLock<HashMap<i64, HashMap<i64, usize>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(DispatcherInner {
                broadcast_tx,
                user_channels: RwLock::new(HashMap::new()),
                presence: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Broadcast> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Serialize once and fan out to all connections.
    pub fn broadcast(&self, event: GatewayEvent) {
        let json = match serde_json::to_string(&event) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize gateway event {:?}: {}", event, e);
                return;
            }
        };
        // No receivers is fine: nobody is connected.
        let _ = self.inner.broadcast_tx.send(Broadcast {
            group_id: event.group_id(),
            json: json.into(),
        });
    }

    // -- Change notifications --

    /// Signal that a message log changed. Personal notes only reach the author.
    pub async fn notify_messages_changed(&self, group_id: Option<i64>, author_id: i64) {
        match group_id {
            Some(group_id) => self.broadcast(GatewayEvent::MessagesChanged { group_id }),
            None => {
                self.send_to_user(author_id, GatewayEvent::PersonalMessagesChanged)
                    .await
            }
        }
    }

    pub fn notify_group_changed(&self, group_id: i64) {
        self.broadcast(GatewayEvent::GroupChanged { group_id });
    }

    pub async fn notify_group_deleted(&self, group_id: i64) {
        self.broadcast(GatewayEvent::GroupDeleted { group_id });
        self.inner.presence.write().await.remove(&group_id);
    }

    /// Tell every connection of `user_id` to drop `group_id`.
    pub async fn revoke_access(&self, user_id: i64, group_id: i64) {
        self.send_user_message(user_id, UserMessage::Revoke { group_id }).await;
    }

    // -- Per-user channels --

    /// Register a connection for targeted delivery. Returns (conn_id, receiver).
    pub async fn register_connection(
        &self,
        user_id: i64,
    ) -> (Uuid, mpsc::UnboundedReceiver<UserMessage>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .user_channels
            .write()
            .await
            .entry(user_id)
            .or_default()
            .insert(conn_id, tx);
        (conn_id, rx)
    }

    pub async fn unregister_connection(&self, user_id: i64, conn_id: Uuid) {
        let mut channels = self.inner.user_channels.write().await;
        if let Some(conns) = channels.get_mut(&user_id) {
            conns.remove(&conn_id);
            if conns.is_empty() {
                channels.remove(&user_id);
            }
        }
    }

    /// Send a targeted event to every connection of a user.
    pub async fn send_to_user(&self, user_id: i64, event: GatewayEvent) {
        self.send_user_message(user_id, UserMessage::Event(event)).await;
    }

    /// Send a targeted event to one connection.
    pub async fn send_to_connection(&self, user_id: i64, conn_id: Uuid, event: GatewayEvent) {
        let channels = self.inner.user_channels.read().await;
        if let Some(tx) = channels.get(&user_id).and_then(|conns| conns.get(&conn_id)) {
            let _ = tx.send(UserMessage::Event(event));
        }
    }

    async fn send_user_message(&self, user_id: i64, msg: UserMessage) {
        let channels = self.inner.user_channels.read().await;
        if let Some(conns) = channels.get(&user_id) {
            for tx in conns.values() {
                let _ = tx.send(msg.clone());
            }
        }
    }

    // -- Presence --

    /// Count one more connection of `user_id` viewing `group_id`.
    /// Announces a join on the user's first connection. Returns the current set.
    pub async fn track(&self, group_id: i64, user_id: i64) -> Vec<i64> {
        let (joined, snapshot) = {
            let mut presence = self.inner.presence.write().await;
            let viewers = presence.entry(group_id).or_default();
            let count = viewers.entry(user_id).or_insert(0);
            *count += 1;
            (*count == 1, sorted_keys(viewers))
        };

        if joined {
            debug!("user {} now present in group {}", user_id, group_id);
            self.broadcast(GatewayEvent::PresenceJoin { group_id, user_id });
        }
        snapshot
    }

    /// Drop one connection of `user_id` from `group_id`.
    /// Announces a leave when the user's last connection goes.
    pub async fn untrack(&self, group_id: i64, user_id: i64) {
        let left = {
            let mut presence = self.inner.presence.write().await;
            let Some(viewers) = presence.get_mut(&group_id) else {
                return;
            };
            let left = match viewers.get_mut(&user_id) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    viewers.remove(&user_id);
                    true
                }
                None => false,
            };
            if viewers.is_empty() {
                presence.remove(&group_id);
            }
            left
        };

        if left {
            debug!("user {} left group {}", user_id, group_id);
            self.broadcast(GatewayEvent::PresenceLeave { group_id, user_id });
        }
    }

    /// Users currently viewing a group, ascending by id.
    pub async fn present_in(&self, group_id: i64) -> Vec<i64> {
        self.inner
            .presence
            .read()
            .await
            .get(&group_id)
            .map(sorted_keys)
            .unwrap_or_default()
    }
}

fn sorted_keys(viewers: &HashMap<i64, usize>) -> Vec<i64> {
    let mut ids: Vec<i64> = viewers.keys().copied().collect();
    ids.sort_unstable();
    ids
}
