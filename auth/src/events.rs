//! Notification bus for token and re-authentication events.
//!
//! Handlers are plain synchronous closures. Each invocation runs on the
//! blocking pool under a deadline, so a handler that hangs or panics is
//! logged and discarded without holding up token refresh or
//! re-authentication.

use crate::common::{HandlerError, IdentityError, ReauthenticationError, panic_message};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// Deadline for a single handler invocation.
pub const HANDLER_TIMEOUT: Duration = Duration::from_secs(5);

/// A new token was installed.
#[derive(Clone, Debug)]
pub struct TokenRefreshed {
    pub acquired_at: DateTime<Utc>,
    pub expires_on: DateTime<Utc>,
}

/// Every acquisition attempt failed; the previous token (if any) stays active.
#[derive(Clone, Debug)]
pub struct TokenRefreshFailed {
    pub error: IdentityError,
    pub current_expiry: Option<DateTime<Utc>>,
}

/// One server endpoint accepted the new token.
#[derive(Clone, Debug)]
pub struct ConnectionReauthenticated {
    pub endpoint: String,
}

/// One server endpoint (or a whole connection) could not be re-authenticated.
#[derive(Clone, Debug)]
pub struct ConnectionReauthenticationFailed {
    pub error: ReauthenticationError,
    pub endpoint: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Subscribers<E> {
    handlers: RwLock<Vec<(SubscriptionId, Handler<E>)>>,
}

impl<E> Default for Subscribers<E> {
    fn default() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }
}

impl<E> Subscribers<E> {
    fn add(&self, id: SubscriptionId, handler: Handler<E>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, handler));
    }

    fn remove(&self, id: SubscriptionId) -> bool {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    fn snapshot(&self) -> Vec<Handler<E>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect()
    }
}

/// Per-event-kind subscriber lists.
pub struct TokenEvents {
    next_id: AtomicU64,
    handler_timeout: Duration,
    token_refreshed: Subscribers<TokenRefreshed>,
    token_refresh_failed: Subscribers<TokenRefreshFailed>,
    connection_reauthenticated: Subscribers<ConnectionReauthenticated>,
    connection_reauthentication_failed: Subscribers<ConnectionReauthenticationFailed>,
}

impl Default for TokenEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenEvents {
    pub fn new() -> Self {
        Self::with_handler_timeout(HANDLER_TIMEOUT)
    }

    pub fn with_handler_timeout(handler_timeout: Duration) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handler_timeout,
            token_refreshed: Subscribers::default(),
            token_refresh_failed: Subscribers::default(),
            connection_reauthenticated: Subscribers::default(),
            connection_reauthentication_failed: Subscribers::default(),
        }
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn on_token_refreshed(
        &self,
        handler: impl Fn(&TokenRefreshed) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.next_id();
        self.token_refreshed.add(id, Arc::new(handler));
        id
    }

    pub fn on_token_refresh_failed(
        &self,
        handler: impl Fn(&TokenRefreshFailed) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.next_id();
        self.token_refresh_failed.add(id, Arc::new(handler));
        id
    }

    pub fn on_connection_reauthenticated(
        &self,
        handler: impl Fn(&ConnectionReauthenticated) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.next_id();
        self.connection_reauthenticated.add(id, Arc::new(handler));
        id
    }

    pub fn on_connection_reauthentication_failed(
        &self,
        handler: impl Fn(&ConnectionReauthenticationFailed) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.next_id();
        self.connection_reauthentication_failed
            .add(id, Arc::new(handler));
        id
    }

    /// Removes a handler of any kind. Returns `false` for unknown ids.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.token_refreshed.remove(id)
            || self.token_refresh_failed.remove(id)
            || self.connection_reauthenticated.remove(id)
            || self.connection_reauthentication_failed.remove(id)
    }

    pub(crate) async fn token_refreshed(&self, event: TokenRefreshed) {
        self.dispatch("TokenRefreshed", &self.token_refreshed, event)
            .await;
    }

    pub(crate) async fn token_refresh_failed(&self, event: TokenRefreshFailed) {
        self.dispatch("TokenRefreshFailed", &self.token_refresh_failed, event)
            .await;
    }

    pub(crate) async fn connection_reauthenticated(&self, event: ConnectionReauthenticated) {
        self.dispatch(
            "ConnectionReauthenticated",
            &self.connection_reauthenticated,
            event,
        )
        .await;
    }

    pub(crate) async fn connection_reauthentication_failed(
        &self,
        event: ConnectionReauthenticationFailed,
    ) {
        self.dispatch(
            "ConnectionReauthenticationFailed",
            &self.connection_reauthentication_failed,
            event,
        )
        .await;
    }

    async fn dispatch<E>(&self, name: &'static str, subscribers: &Subscribers<E>, event: E)
    where
        E: Send + Sync + 'static,
    {
        let handlers = subscribers.snapshot();
        if handlers.is_empty() {
            return;
        }

        let event = Arc::new(event);
        let invocations = handlers.into_iter().map(|handler| {
            let event = event.clone();
            invoke_with_timeout(name, self.handler_timeout, move || handler(event.as_ref()))
        });

        for result in futures::future::join_all(invocations).await {
            if let Err(e) = result {
                log::warn!("{e}");
            }
        }
    }
}

/// Runs `handler` on the blocking pool and waits at most `timeout` for it.
///
/// A handler that overruns keeps running detached; its result is ignored.
pub async fn invoke_with_timeout<F>(
    name: &'static str,
    timeout: Duration,
    handler: F,
) -> Result<(), HandlerError>
where
    F: FnOnce() + Send + 'static,
{
    let task = tokio::task::spawn_blocking(handler);

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(join_error)) if join_error.is_panic() => Err(HandlerError::Failed {
            name,
            reason: panic_message(join_error.into_panic()),
        }),
        Ok(Err(join_error)) => Err(HandlerError::Failed {
            name,
            reason: join_error.to_string(),
        }),
        Err(_) => Err(HandlerError::TimedOut {
            name,
            millis: timeout.as_millis(),
        }),
    }
}
