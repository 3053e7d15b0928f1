//! In-memory registry of connected users and their live subscriptions.
//!
//! Each connected user gets exactly one entry: the outbound queue feeding
//! their socket writer, the authoritative set of subscribed chats, and one
//! listener task that pumps fabric messages into the queue. A user in K
//! chats costs one task and one multiplexed subscription handle, not K.
//!
//! Subscription changes flow to the listener over a control channel, so
//! `subscribe`/`unsubscribe` never tear the listener down and are safe to
//! call while it is mid-drain.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use courier_fabric::{Fabric, FabricError, FabricSubscriber};
use courier_shared::{ChatId, UserId};

/// Subscription mutations applied by the listener between drains.
enum ListenerControl {
    Subscribe(ChatId),
    Unsubscribe(ChatId),
}

struct ConnectionEntry {
    /// Distinguishes this connection from a later one for the same user,
    /// so a stale socket's cleanup cannot evict its replacement.
    conn_id: u64,
    control: mpsc::UnboundedSender<ListenerControl>,
    /// Authoritative channel set; the listener's fabric-side view follows
    /// it asynchronously.
    channels: HashSet<ChatId>,
    listener: JoinHandle<()>,
}

/// Counts reported by `GET /ws/stats`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RegistryStats {
    pub total_connections: usize,
    pub connected_users: usize,
    /// Subscribed-channel count per connected user.
    pub subscriptions: HashMap<String, usize>,
}

/// Per-process connection and subscription state. Constructed once in
/// `main` and shared behind an `Arc`; tests build their own against a
/// local fabric.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<UserId, ConnectionEntry>>,
    next_conn_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Register a user's connection and start its listener.
    ///
    /// Opens one fabric subscription, subscribes it to every chat in
    /// `chat_ids`, and spawns the task that forwards fabric messages into
    /// `outbound`. If the user already has a connection the old entry is
    /// replaced and its listener aborted; the old socket is left to close
    /// on its own.
    ///
    /// Returns the connection id to pass back to [`disconnect`].
    ///
    /// [`disconnect`]: ConnectionRegistry::disconnect
    pub async fn connect(
        &self,
        fabric: &dyn Fabric,
        user_id: UserId,
        chat_ids: Vec<ChatId>,
        outbound: mpsc::Sender<String>,
    ) -> Result<u64, FabricError> {
        let mut subscriber = fabric.subscriber().await?;
        for chat_id in &chat_ids {
            subscriber.subscribe(&chat_id.channel()).await?;
        }

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let listener = tokio::spawn(listener_loop(
            user_id.clone(),
            subscriber,
            control_rx,
            outbound,
        ));

        let entry = ConnectionEntry {
            conn_id,
            control: control_tx,
            channels: chat_ids.iter().cloned().collect(),
            listener,
        };

        let old = self.connections.write().await.insert(user_id.clone(), entry);
        if let Some(old) = old {
            old.listener.abort();
            tracing::info!(user_id = %user_id, "replaced existing connection");
        }

        tracing::info!(
            user_id = %user_id,
            chats = chat_ids.len(),
            "user connected"
        );
        Ok(conn_id)
    }

    /// Remove a user's connection and stop its listener.
    ///
    /// A no-op unless `conn_id` matches the registered entry: when a
    /// duplicate connection has already replaced this one, the stale
    /// socket's cleanup must leave the replacement running.
    pub async fn disconnect(&self, user_id: &UserId, conn_id: u64) {
        let mut connections = self.connections.write().await;
        let matches = connections
            .get(user_id)
            .map(|entry| entry.conn_id == conn_id)
            .unwrap_or(false);

        if matches {
            if let Some(entry) = connections.remove(user_id) {
                entry.listener.abort();
                tracing::info!(user_id = %user_id, "user disconnected");
            }
        }
    }

    /// Add a chat to a connected user's subscription set. Returns `true`
    /// if the chat was newly added, `false` if it was already present or
    /// the user is not connected.
    pub async fn subscribe(&self, user_id: &UserId, chat_id: &ChatId) -> bool {
        let mut connections = self.connections.write().await;
        let Some(entry) = connections.get_mut(user_id) else {
            return false;
        };

        if !entry.channels.insert(chat_id.clone()) {
            return false;
        }

        // Listener applies the fabric-side change; if it is already gone
        // the entry is moments from removal anyway.
        let _ = entry
            .control
            .send(ListenerControl::Subscribe(chat_id.clone()));
        tracing::debug!(user_id = %user_id, chat_id = %chat_id, "subscribed");
        true
    }

    /// Remove a chat from a connected user's subscription set. Returns
    /// `true` if the chat was present.
    pub async fn unsubscribe(&self, user_id: &UserId, chat_id: &ChatId) -> bool {
        let mut connections = self.connections.write().await;
        let Some(entry) = connections.get_mut(user_id) else {
            return false;
        };

        if !entry.channels.remove(chat_id) {
            return false;
        }

        let _ = entry
            .control
            .send(ListenerControl::Unsubscribe(chat_id.clone()));
        tracing::debug!(user_id = %user_id, chat_id = %chat_id, "unsubscribed");
        true
    }

    /// Whether a connected user currently has a chat in their
    /// subscription set. Gateways use this to reject publishes from
    /// non-subscribers.
    pub async fn is_subscribed(&self, user_id: &UserId, chat_id: &ChatId) -> bool {
        self.connections
            .read()
            .await
            .get(user_id)
            .map(|entry| entry.channels.contains(chat_id))
            .unwrap_or(false)
    }

    /// The chats a connected user is subscribed to.
    pub async fn subscriptions_of(&self, user_id: &UserId) -> Vec<ChatId> {
        self.connections
            .read()
            .await
            .get(user_id)
            .map(|entry| entry.channels.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn stats(&self) -> RegistryStats {
        let connections = self.connections.read().await;
        let subscriptions = connections
            .iter()
            .map(|(user_id, entry)| (user_id.as_str().to_string(), entry.channels.len()))
            .collect();

        RegistryStats {
            total_connections: connections.len(),
            connected_users: connections.len(),
            subscriptions,
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Pump fabric messages into the user's outbound queue while applying
/// subscription changes. Ends when the registry drops the entry, the
/// outbound side closes, or the fabric shuts down.
async fn listener_loop(
    user_id: UserId,
    mut subscriber: Box<dyn FabricSubscriber>,
    mut control: mpsc::UnboundedReceiver<ListenerControl>,
    outbound: mpsc::Sender<String>,
) {
    loop {
        tokio::select! {
            cmd = control.recv() => match cmd {
                Some(ListenerControl::Subscribe(chat_id)) => {
                    if let Err(e) = subscriber.subscribe(&chat_id.channel()).await {
                        tracing::error!(
                            user_id = %user_id,
                            chat_id = %chat_id,
                            error = %e,
                            "fabric subscribe failed"
                        );
                    }
                }
                Some(ListenerControl::Unsubscribe(chat_id)) => {
                    if let Err(e) = subscriber.unsubscribe(&chat_id.channel()).await {
                        tracing::error!(
                            user_id = %user_id,
                            chat_id = %chat_id,
                            error = %e,
                            "fabric unsubscribe failed"
                        );
                    }
                }
                // Registry dropped the entry.
                None => break,
            },
            msg = subscriber.next() => match msg {
                Some(msg) => {
                    if outbound.send(msg.payload).await.is_err() {
                        // Socket writer is gone; cleanup will follow.
                        break;
                    }
                }
                None => {
                    tracing::warn!(user_id = %user_id, "fabric subscription ended");
                    break;
                }
            },
        }
    }

    tracing::debug!(user_id = %user_id, "listener stopped");
}
