//! Re-authentication of tracked connections with the current token.

use crate::common::{ReauthenticationError, panic_message};
use crate::connection::{ConnectionRegistry, ServerEndpoint, StaleConnection};
use crate::events::{ConnectionReauthenticated, ConnectionReauthenticationFailed, TokenEvents};
use crate::token::{TokenState, TokenStore};
use futures::future::join_all;
use std::sync::Arc;

/// Counts from one re-authentication pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReauthenticationPass {
    /// Connections that were behind the current token.
    pub stale: usize,
    /// Connections whose every connected endpoint accepted the token.
    pub reauthenticated: usize,
    /// Connections found disposed and no longer tracked.
    pub pruned: usize,
}

enum ConnectionOutcome {
    Reauthenticated,
    Failed,
    Disposed,
}

/// Brings every stale connection up to the current token.
///
/// Connections are handled concurrently, each on its own task, and the
/// endpoints of one connection are handled concurrently within that task.
/// Overlapping passes are harmless: tags only move forward.
#[derive(Clone)]
pub struct Reauthenticator {
    registry: ConnectionRegistry,
    store: Arc<TokenStore>,
    events: Arc<TokenEvents>,
    immediate_retries: u32,
}

impl Reauthenticator {
    pub fn new(
        registry: ConnectionRegistry,
        store: Arc<TokenStore>,
        events: Arc<TokenEvents>,
        immediate_retries: u32,
    ) -> Self {
        Self {
            registry,
            store,
            events,
            immediate_retries,
        }
    }

    pub async fn reauthenticate_all(&self) -> ReauthenticationPass {
        let (Some(token), Some(username)) = (self.store.snapshot(), self.store.username()) else {
            return ReauthenticationPass::default();
        };
        let username: Arc<str> = username.into();

        let stale = self.registry.stale(token.expires_at).await;
        let mut pass = ReauthenticationPass {
            stale: stale.len(),
            ..ReauthenticationPass::default()
        };
        if stale.is_empty() {
            return pass;
        }

        log::debug!(
            "Re-authenticating {} connection(s) with token expiring at {}",
            stale.len(),
            token.expires_at
        );

        let tasks: Vec<_> = stale
            .into_iter()
            .map(|connection| {
                let worker = self.clone();
                let token = token.clone();
                let username = username.clone();
                let client = connection.connection.client_name();
                let handle = tokio::spawn(async move {
                    worker
                        .reauthenticate_connection(connection, &token, &username)
                        .await
                });
                (client, handle)
            })
            .collect();

        for (client, handle) in tasks {
            match handle.await {
                Ok(ConnectionOutcome::Reauthenticated) => pass.reauthenticated += 1,
                Ok(ConnectionOutcome::Disposed) => pass.pruned += 1,
                Ok(ConnectionOutcome::Failed) => {}
                Err(join_error) => {
                    let reason = if join_error.is_panic() {
                        panic_message(join_error.into_panic())
                    } else {
                        join_error.to_string()
                    };
                    log::error!("Re-authentication of client '{client}' panicked: {reason}");
                    self.events
                        .connection_reauthentication_failed(ConnectionReauthenticationFailed {
                            error: ReauthenticationError::Panicked(client.clone()),
                            endpoint: client,
                        })
                        .await;
                }
            }
        }

        pass
    }

    async fn reauthenticate_connection(
        &self,
        stale: StaleConnection,
        token: &TokenState,
        username: &str,
    ) -> ConnectionOutcome {
        let StaleConnection {
            id,
            connection,
            authenticated_expiry,
        } = stale;
        let client = connection.client_name();

        let servers = match connection.servers() {
            Ok(servers) => servers,
            Err(ReauthenticationError::Disposed) => {
                log::info!("Client '{client}' has been disposed and will no longer be managed");
                self.registry.untrack(id).await;
                return ConnectionOutcome::Disposed;
            }
            Err(e) => {
                log::error!(
                    "Failed to re-authenticate client '{client}'; its current token expires at {authenticated_expiry}: {e}"
                );
                self.events
                    .connection_reauthentication_failed(ConnectionReauthenticationFailed {
                        error: e,
                        endpoint: client,
                    })
                    .await;
                return ConnectionOutcome::Failed;
            }
        };
        // Only the weak reference may outlive this pass.
        drop(connection);

        log::trace!(
            "Re-authenticating client '{client}' from {authenticated_expiry} to {}",
            token.expires_at
        );

        let attempts = servers.into_iter().filter_map(|server| {
            if server.is_connected() {
                Some(self.reauthenticate_endpoint(server, token.value(), username))
            } else {
                log::warn!(
                    "Skipping re-authentication of '{}' because it is not connected; it will use the new token when it reconnects",
                    server.endpoint()
                );
                None
            }
        });
        let results = join_all(attempts).await;

        if results
            .iter()
            .any(|result| matches!(result, Err(ReauthenticationError::Disposed)))
        {
            log::info!("Client '{client}' has been disposed and will no longer be managed");
            self.registry.untrack(id).await;
            return ConnectionOutcome::Disposed;
        }

        if results.iter().all(Result::is_ok) {
            self.registry.mark_authenticated(id, token.expires_at).await;
            ConnectionOutcome::Reauthenticated
        } else {
            ConnectionOutcome::Failed
        }
    }

    async fn reauthenticate_endpoint(
        &self,
        server: Arc<dyn ServerEndpoint>,
        token: &str,
        username: &str,
    ) -> Result<(), ReauthenticationError> {
        let endpoint = server.endpoint();
        let mut retries_left = self.immediate_retries;

        loop {
            log::trace!("Re-authenticating connection to '{endpoint}'");
            match server.reauthenticate(username, token).await {
                Ok(()) => {
                    log::info!("Re-authenticated connection to '{endpoint}'");
                    self.events
                        .connection_reauthenticated(ConnectionReauthenticated { endpoint })
                        .await;
                    return Ok(());
                }
                Err(ReauthenticationError::Disposed) => return Err(ReauthenticationError::Disposed),
                Err(e) if retries_left > 0 => {
                    retries_left -= 1;
                    log::debug!("Retrying re-authentication of '{endpoint}' after error: {e}");
                }
                Err(e) => {
                    log::error!(
                        "Failed to re-authenticate connection to '{endpoint}', will try again on the next heartbeat: {e}"
                    );
                    self.events
                        .connection_reauthentication_failed(ConnectionReauthenticationFailed {
                            error: e.clone(),
                            endpoint,
                        })
                        .await;
                    return Err(e);
                }
            }
        }
    }
}
