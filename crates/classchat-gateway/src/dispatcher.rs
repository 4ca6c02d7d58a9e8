use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tracing::debug;
use uuid::Uuid;

use classchat_types::events::GatewayEvent;

/// Channel every connection of a user joins at connect time.
pub fn user_channel(user_id: Uuid) -> String {
    format!("user#{}", user_id)
}

/// Channel carrying the traffic of one conversation.
pub fn conversation_channel(conversation_id: Uuid) -> String {
    format!("convo#{}", conversation_id)
}

/// Tracks live connections and the named channels they have joined.
/// Delivery is fire-and-forget: only connections that are subscribed at
/// broadcast time get the event, nothing is queued for anyone else.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    registry: RwLock<Registry>,
}

#[derive(Default)]
struct Registry {
    /// conn_id -> connection
    connections: HashMap<Uuid, ConnectionEntry>,

    /// channel name -> conn_ids
    channels: HashMap<String, HashSet<Uuid>>,
}

struct ConnectionEntry {
    user_id: Uuid,
    tx: mpsc::UnboundedSender<GatewayEvent>,
    channels: HashSet<String>,
}

impl Registry {
    fn join(&mut self, conn_id: Uuid, channel: &str) -> bool {
        let Some(entry) = self.connections.get_mut(&conn_id) else {
            return false;
        };
        if !entry.channels.insert(channel.to_string()) {
            return false;
        }
        self.channels.entry(channel.to_string()).or_default().insert(conn_id);
        true
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                registry: RwLock::new(Registry::default()),
            }),
        }
    }

    /// Register a live connection. Returns (conn_id, receiver) where the
    /// receiver yields every event addressed to this connection.
    pub async fn register_connection(
        &self,
        user_id: Uuid,
    ) -> (Uuid, mpsc::UnboundedReceiver<GatewayEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.registry.write().await.connections.insert(
            conn_id,
            ConnectionEntry {
                user_id,
                tx,
                channels: HashSet::new(),
            },
        );
        (conn_id, rx)
    }

    /// Drop a connection and every channel membership it held.
    pub async fn unregister_connection(&self, conn_id: Uuid) {
        let mut registry = self.inner.registry.write().await;
        let Some(entry) = registry.connections.remove(&conn_id) else {
            return;
        };
        for channel in &entry.channels {
            if let Some(members) = registry.channels.get_mut(channel) {
                members.remove(&conn_id);
                if members.is_empty() {
                    registry.channels.remove(channel);
                }
            }
        }
        debug!(
            "Connection {} of {} left {} channels",
            conn_id,
            entry.user_id,
            entry.channels.len()
        );
    }

    /// Add a connection to a channel. Idempotent: returns `false` when the
    /// connection was already a member or is not registered.
    pub async fn subscribe(&self, conn_id: Uuid, channel: &str) -> bool {
        self.inner.registry.write().await.join(conn_id, channel)
    }

    /// Subscribe every connection currently in `identity_channel` to
    /// `target_channel`. Connections joining `identity_channel` later are not
    /// picked up. Returns how many connections were newly subscribed.
    pub async fn subscribe_all_connections_of(
        &self,
        identity_channel: &str,
        target_channel: &str,
    ) -> usize {
        let mut registry = self.inner.registry.write().await;
        let members: Vec<Uuid> = registry
            .channels
            .get(identity_channel)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default();

        members
            .into_iter()
            .filter(|conn_id| registry.join(*conn_id, target_channel))
            .count()
    }

    /// Deliver an event to every connection currently in `channel`.
    /// Returns the number of connections it was handed to.
    pub async fn broadcast(&self, channel: &str, event: GatewayEvent) -> usize {
        let registry = self.inner.registry.read().await;
        let Some(members) = registry.channels.get(channel) else {
            return 0;
        };

        let mut delivered = 0;
        for conn_id in members {
            if let Some(entry) = registry.connections.get(conn_id) {
                if entry.tx.send(event.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Send an event to exactly one connection.
    pub async fn send_to_connection(&self, conn_id: Uuid, event: GatewayEvent) -> bool {
        let registry = self.inner.registry.read().await;
        registry
            .connections
            .get(&conn_id)
            .is_some_and(|entry| entry.tx.send(event).is_ok())
    }
}

#[cfg(test)]
impl Dispatcher {
    /// Channels a connection is currently subscribed to.
    pub(crate) async fn channels_of(&self, conn_id: Uuid) -> Vec<String> {
        self.inner
            .registry
            .read()
            .await
            .connections
            .get(&conn_id)
            .map(|entry| entry.channels.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) async fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .registry
            .read()
            .await
            .channels
            .get(channel)
            .map_or(0, HashSet::len)
    }
}
