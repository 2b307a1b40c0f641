//! The token engine: one per identity, shared by every connection that
//! authenticates with it.

use crate::common::AuthError;
use crate::config::{AuthOptions, RefreshPolicy};
use crate::connection::{CacheConnection, ConnectionId, ConnectionRegistry};
use crate::events::TokenEvents;
use crate::heartbeat::{self, HeartbeatHandle, SingleFlight};
use crate::identity::{self, IdentityBackend};
use crate::provider::Credential;
use crate::reauth::{ReauthenticationPass, Reauthenticator};
use crate::token::{AcquireOutcome, TokenAcquirer, TokenState, TokenStore};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use zeroize::Zeroizing;

/// Builder for [`TokenAuthEngine`].
///
/// # Examples
///
/// ```no_run
/// use azure_redis_auth::config::RefreshPolicy;
/// use azure_redis_auth::engine::TokenAuthEngineBuilder;
/// # use azure_redis_auth::identity::IdentityBackend;
/// # use std::sync::Arc;
/// # async fn example(backend: Arc<dyn IdentityBackend>) -> Result<(), azure_redis_auth::common::AuthError> {
/// let engine = TokenAuthEngineBuilder::new(backend)
///     .principal_id("00000000-0000-0000-0000-000000000000")
///     .policy(RefreshPolicy::default())
///     .start()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct TokenAuthEngineBuilder {
    backend: Arc<dyn IdentityBackend>,
    policy: RefreshPolicy,
    principal_id: Option<String>,
    events: Option<Arc<TokenEvents>>,
}

impl TokenAuthEngineBuilder {
    pub fn new(backend: Arc<dyn IdentityBackend>) -> Self {
        Self {
            backend,
            policy: RefreshPolicy::default(),
            principal_id: None,
            events: None,
        }
    }

    pub fn policy(mut self, policy: RefreshPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn principal_id(mut self, principal_id: impl Into<String>) -> Self {
        self.principal_id = Some(principal_id.into());
        self
    }

    /// Shares an existing subscriber registry, e.g. to subscribe before the
    /// initial acquisition.
    pub fn events(mut self, events: Arc<TokenEvents>) -> Self {
        self.events = Some(events);
        self
    }

    /// Builds an engine without a token. Must be called inside a tokio
    /// runtime; the heartbeat runs on that runtime.
    pub fn build(self) -> Result<TokenAuthEngine, AuthError> {
        self.policy.validate()?;
        let runtime = Handle::try_current().map_err(|e| AuthError::NoRuntime(e.to_string()))?;

        let store = Arc::new(TokenStore::new());
        let events = self.events.unwrap_or_default();
        let registry = ConnectionRegistry::new();
        let reauthenticator = Reauthenticator::new(
            registry.clone(),
            store.clone(),
            events.clone(),
            self.policy.immediate_reauthentication_retries,
        );
        let acquirer = TokenAcquirer::new(
            self.backend,
            store.clone(),
            events.clone(),
            self.policy,
            self.principal_id,
        );

        let inner = Arc::new_cyclic(|this| EngineInner {
            this: this.clone(),
            acquirer,
            reauthenticator,
            registry,
            store,
            events,
            in_flight: SingleFlight::default(),
            heartbeat: Mutex::new(None),
            shut_down: AtomicBool::new(false),
            runtime,
        });

        Ok(TokenAuthEngine { inner })
    }

    /// Builds the engine and performs the initial token acquisition.
    /// Failure to obtain the first token is returned to the caller.
    pub async fn start(self) -> Result<TokenAuthEngine, AuthError> {
        let engine = self.build()?;
        engine.acquire_token(true).await?;
        Ok(engine)
    }
}

pub(crate) struct EngineInner {
    this: Weak<EngineInner>,
    acquirer: TokenAcquirer,
    reauthenticator: Reauthenticator,
    registry: ConnectionRegistry,
    store: Arc<TokenStore>,
    events: Arc<TokenEvents>,
    in_flight: SingleFlight,
    heartbeat: Mutex<Option<HeartbeatHandle>>,
    shut_down: AtomicBool,
    runtime: Handle,
}

impl EngineInner {
    fn refresh_due(&self, state: Option<&TokenState>) -> bool {
        let Some(state) = state else {
            return true;
        };
        state.is_expired_at(Utc::now())
            || state.lifetime() <= chrono::Duration::zero()
            || self
                .acquirer
                .policy()
                .refresh_due
                .should_refresh(state.acquired_at, state.expires_at)
    }

    /// Refreshes the token when due, then re-authenticates stale
    /// connections. Returns `false` when another check was already running.
    pub(crate) async fn ensure_authentication(&self) -> bool {
        let Some(_guard) = self.in_flight.try_enter() else {
            log::trace!("Authentication check already in progress, skipping");
            return false;
        };

        if self.refresh_due(self.store.snapshot().as_deref()) {
            if let Err(e) = self.acquirer.acquire(false).await {
                log::error!("Token refresh failed: {e}");
            }
        }

        // Always runs: connections that failed last time are retried.
        let pass = self.reauthenticator.reauthenticate_all().await;
        if pass.stale > 0 {
            log::debug!(
                "Re-authentication pass: {} stale, {} re-authenticated, {} pruned",
                pass.stale,
                pass.reauthenticated,
                pass.pruned
            );
        }
        true
    }

    /// One heartbeat: authentication check followed by heartbeat
    /// bookkeeping, since the pass may have pruned the last connection.
    pub(crate) async fn background_check(&self) {
        self.ensure_authentication().await;
        self.sync_heartbeat().await;
    }

    /// Runs the heartbeat exactly while connections are tracked and the
    /// engine has not been shut down.
    async fn sync_heartbeat(&self) {
        let mut heartbeat = self.heartbeat.lock().await;
        let wanted = !self.shut_down.load(Ordering::Acquire) && !self.registry.is_empty().await;
        let running = heartbeat.as_ref().is_some_and(HeartbeatHandle::is_running);

        if wanted && !running {
            let period = self.acquirer.policy().heartbeat_interval;
            log::info!("Redis connection established, starting token refresh every {period:?}");
            *heartbeat = Some(heartbeat::spawn_heartbeat(
                self.this.clone(),
                period,
                &self.runtime,
            ));
        } else if !wanted {
            if let Some(handle) = heartbeat.take() {
                log::info!("No Redis connections are managed, stopping token refresh");
                handle.stop().await;
            }
        }
    }
}

/// Keeps Redis connections authenticated with short-lived Entra ID tokens.
///
/// Cloning is cheap; clones share the same token and connections. The
/// heartbeat stops when the last clone is dropped.
#[derive(Clone)]
pub struct TokenAuthEngine {
    inner: Arc<EngineInner>,
}

impl TokenAuthEngine {
    pub fn builder(backend: Arc<dyn IdentityBackend>) -> TokenAuthEngineBuilder {
        TokenAuthEngineBuilder::new(backend)
    }

    /// Creates the identity backend and refresh policy from `options` and
    /// performs the initial token acquisition.
    pub async fn from_options(options: &AuthOptions) -> Result<Self, AuthError> {
        let backend = identity::create_backend(options)?;
        let policy = options.refresh_policy()?;

        let mut builder = TokenAuthEngineBuilder::new(backend).policy(policy);
        if let Some(principal_id) = &options.principal_id {
            builder = builder.principal_id(principal_id.clone());
        }
        builder.start().await
    }

    pub fn events(&self) -> &TokenEvents {
        &self.inner.events
    }

    /// The current credential, without waiting on any I/O.
    ///
    /// An expired token is still returned, and a background refresh is
    /// started so the next connection gets a fresh one.
    pub fn credential(&self) -> Option<Credential> {
        let state = self.inner.store.snapshot()?;

        if state.is_expired_at(Utc::now()) {
            log::warn!(
                "Current token expired at {}, ensuring a background refresh is in progress",
                state.expires_at
            );
            if !self.inner.in_flight.is_busy() {
                let period = self.inner.acquirer.policy().heartbeat_interval;
                self.inner
                    .runtime
                    .spawn(heartbeat::guarded_check(self.inner.clone(), period));
            }
        }

        Some(Credential {
            username: self.inner.store.username(),
            password: Zeroizing::new(state.value().to_string()),
        })
    }

    pub fn username(&self) -> Option<String> {
        self.inner.store.username()
    }

    /// Starts managing a connection that has just connected with the current
    /// token. The heartbeat starts with the first managed connection.
    pub async fn on_connection_established(
        &self,
        connection: &Arc<dyn CacheConnection>,
    ) -> ConnectionId {
        let expiry = self.inner.store.current_expiry();
        let id = self.inner.registry.track(connection, expiry).await;
        log::debug!(
            "Managing connection {id} of client '{}'",
            connection.client_name()
        );
        self.inner.sync_heartbeat().await;
        id
    }

    /// Stops managing a connection. The heartbeat stops with the last one.
    pub async fn stop_managing(&self, id: ConnectionId) -> bool {
        let removed = self.inner.registry.untrack(id).await;
        self.inner.sync_heartbeat().await;
        removed
    }

    /// Runs one authentication check now. Returns `false` if a check was
    /// already in progress and this call did nothing.
    pub async fn ensure_authentication(&self) -> bool {
        self.inner.ensure_authentication().await
    }

    pub async fn acquire_token(&self, throw_on_failure: bool) -> Result<AcquireOutcome, AuthError> {
        self.inner.acquirer.acquire(throw_on_failure).await
    }

    pub async fn reauthenticate_all(&self) -> ReauthenticationPass {
        self.inner.reauthenticator.reauthenticate_all().await
    }

    /// Expiry of the current token, `MIN_UTC` before the first acquisition.
    pub fn token_expiry(&self) -> DateTime<Utc> {
        self.inner.store.current_expiry()
    }

    /// Expiry of the token `id` was last authenticated with.
    pub async fn authenticated_expiry(&self, id: ConnectionId) -> Option<DateTime<Utc>> {
        self.inner.registry.authenticated_expiry(id).await
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.registry.len().await
    }

    pub async fn is_heartbeat_running(&self) -> bool {
        self.inner
            .heartbeat
            .lock()
            .await
            .as_ref()
            .is_some_and(HeartbeatHandle::is_running)
    }

    /// Stops the heartbeat for good. Tracked connections keep their current
    /// token until it expires.
    pub async fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::Release);
        self.inner.sync_heartbeat().await;
        log::info!("Token engine shut down");
    }
}
