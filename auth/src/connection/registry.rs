use super::CacheConnection;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct TrackedConnection {
    connection: Weak<dyn CacheConnection>,
    authenticated_expiry: DateTime<Utc>,
}

/// A tracked connection whose token is older than the current one, upgraded
/// for the duration of a re-authentication pass.
pub struct StaleConnection {
    pub id: ConnectionId,
    pub connection: Arc<dyn CacheConnection>,
    pub authenticated_expiry: DateTime<Utc>,
}

/// Live connections managed by one engine, each tagged with the expiry of
/// the token it last authenticated with.
#[derive(Clone)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<ConnectionId, TrackedConnection>>>,
    next_id: Arc<AtomicU64>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Starts tracking `connection` as authenticated with a token that
    /// expires at `authenticated_expiry`. Tracking the same connection twice
    /// returns the existing id.
    pub async fn track(
        &self,
        connection: &Arc<dyn CacheConnection>,
        authenticated_expiry: DateTime<Utc>,
    ) -> ConnectionId {
        let weak = Arc::downgrade(connection);
        let mut connections = self.connections.write().await;

        if let Some((id, _)) = connections
            .iter()
            .find(|(_, tracked)| Weak::ptr_eq(&tracked.connection, &weak))
        {
            return *id;
        }

        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        connections.insert(
            id,
            TrackedConnection {
                connection: weak,
                authenticated_expiry,
            },
        );
        id
    }

    /// Connections authenticated with a token older than `current_expiry`.
    /// Entries whose connection has been dropped are pruned.
    pub async fn stale(&self, current_expiry: DateTime<Utc>) -> Vec<StaleConnection> {
        let mut connections = self.connections.write().await;
        let mut stale = Vec::new();

        connections.retain(|id, tracked| {
            let Some(connection) = tracked.connection.upgrade() else {
                log::debug!("Pruning dropped connection {id}");
                return false;
            };
            if tracked.authenticated_expiry < current_expiry {
                stale.push(StaleConnection {
                    id: *id,
                    connection,
                    authenticated_expiry: tracked.authenticated_expiry,
                });
            }
            true
        });

        stale.sort_by_key(|connection| connection.id);
        stale
    }

    /// Records that `id` is authenticated with a token expiring at `expiry`.
    /// The tag never moves backwards.
    pub async fn mark_authenticated(&self, id: ConnectionId, expiry: DateTime<Utc>) {
        let mut connections = self.connections.write().await;
        if let Some(tracked) = connections.get_mut(&id) {
            tracked.authenticated_expiry = tracked.authenticated_expiry.max(expiry);
        }
    }

    pub async fn untrack(&self, id: ConnectionId) -> bool {
        let mut connections = self.connections.write().await;
        connections.remove(&id).is_some()
    }

    pub async fn authenticated_expiry(&self, id: ConnectionId) -> Option<DateTime<Utc>> {
        let connections = self.connections.read().await;
        connections
            .get(&id)
            .map(|tracked| tracked.authenticated_expiry)
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
