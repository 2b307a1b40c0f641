//! Transport boundary: what the engine needs to know about a Redis client.
//!
//! The engine never owns connections. It observes them through weak
//! references and talks to their server endpoints through these traits.

pub mod registry;

pub use registry::{ConnectionId, ConnectionRegistry, StaleConnection};

use crate::common::ReauthenticationError;
use async_trait::async_trait;
use std::sync::Arc;

/// A multiplexed client connection that may span several servers.
pub trait CacheConnection: Send + Sync {
    /// Name used in logs and in connection-level failure events.
    fn client_name(&self) -> String;

    /// Current server endpoints of this connection. Returns
    /// [`ReauthenticationError::Disposed`] once the connection is closed.
    fn servers(&self) -> Result<Vec<Arc<dyn ServerEndpoint>>, ReauthenticationError>;
}

/// A single server of a [`CacheConnection`].
#[async_trait]
pub trait ServerEndpoint: Send + Sync {
    /// Printable address, e.g. `cache.redis.cache.windows.net:6380`.
    fn endpoint(&self) -> String;

    /// Disconnected endpoints are skipped; they authenticate through the
    /// credential callback when they reconnect.
    fn is_connected(&self) -> bool;

    /// Sends `AUTH <username> <token>` on the existing connection.
    async fn reauthenticate(&self, username: &str, token: &str)
    -> Result<(), ReauthenticationError>;
}
