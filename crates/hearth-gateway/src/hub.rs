use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use hearth_types::events::{WebSocketEvent, WebSocketMessage};

use crate::connection::WebConn;

/// Registry of live, authenticated connections keyed by user id.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    /// user_id -> that user's connections
    connections: RwLock<HashMap<String, Vec<Arc<WebConn>>>>,
}

impl Hub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                connections: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register an authenticated connection. Registering twice is a no-op.
    pub async fn register(&self, conn: Arc<WebConn>) {
        let Some(user_id) = conn.user_id() else {
            warn!("conn {} registered without a user, ignoring", conn.id);
            return;
        };
        let mut connections = self.inner.connections.write().await;
        let entry = connections.entry(user_id.to_string()).or_default();
        if !entry.iter().any(|c| c.id == conn.id) {
            debug!("conn {} ({}) registered", conn.id, user_id);
            entry.push(conn);
        }
    }

    /// Remove a connection. Returns whether its user still has other
    /// connections. Unknown connections are ignored.
    pub async fn unregister(&self, conn: &WebConn) -> bool {
        let Some(user_id) = conn.user_id() else {
            return false;
        };
        let mut connections = self.inner.connections.write().await;
        let Some(entry) = connections.get_mut(user_id) else {
            return false;
        };
        entry.retain(|c| c.id != conn.id);
        if entry.is_empty() {
            connections.remove(user_id);
            false
        } else {
            true
        }
    }

    /// Fan an event out to the target user's connections, or to everyone.
    /// Never blocks: a full queue closes that connection.
    pub async fn publish(&self, event: WebSocketEvent) {
        let event = Arc::new(event);
        let mut dead = Vec::new();
        {
            let connections = self.inner.connections.read().await;
            let targets: Box<dyn Iterator<Item = &Arc<WebConn>>> = if event.broadcast.user_id.is_empty() {
                Box::new(connections.values().flatten())
            } else {
                Box::new(connections.get(&event.broadcast.user_id).into_iter().flatten())
            };
            for conn in targets {
                if !enqueue(conn, WebSocketMessage::Event(event.clone())) {
                    dead.push(conn.clone());
                }
            }
        }
        for conn in dead {
            self.unregister(&conn).await;
        }
    }

    /// Enqueue a non-broadcast message (a reply, a hello) for one connection.
    pub async fn send_message(&self, conn: &Arc<WebConn>, msg: WebSocketMessage) {
        if !enqueue(conn, msg) {
            self.unregister(conn).await;
        }
    }

    /// Membership changed: the user's connections refresh their channel cache.
    pub async fn invalidate_channel_members(&self, user_id: &str) {
        let connections = self.inner.connections.read().await;
        for conn in connections.get(user_id).into_iter().flatten() {
            conn.invalidate_channel_members();
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.connections.read().await.values().map(Vec::len).sum()
    }

    pub async fn is_online(&self, user_id: &str) -> bool {
        self.inner.connections.read().await.contains_key(user_id)
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

/// False when the connection should be dropped from the registry.
fn enqueue(conn: &WebConn, msg: WebSocketMessage) -> bool {
    match conn.try_send(msg) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!(
                "conn {} ({}) send queue full, closing",
                conn.id,
                conn.user_id().unwrap_or_default()
            );
            conn.close();
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}
