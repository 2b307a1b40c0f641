use super::state::{TokenState, TokenStore};
use crate::common::{AuthError, IdentityError};
use crate::config::RefreshPolicy;
use crate::events::{TokenEvents, TokenRefreshFailed, TokenRefreshed};
use crate::identity::{AccessToken, IdentityBackend, claims};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Result of one acquisition run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// A token with a later expiry was installed.
    Refreshed { expires_on: DateTime<Utc> },
    /// The backend returned a token that does not expire later than the
    /// current one (typically its own cache); nothing changed.
    Unchanged,
    /// Every attempt failed and the failure was reported, not returned.
    Failed,
}

/// Drives an [`IdentityBackend`] with bounded retries and installs the
/// result into the [`TokenStore`].
pub struct TokenAcquirer {
    backend: Arc<dyn IdentityBackend>,
    store: Arc<TokenStore>,
    events: Arc<TokenEvents>,
    policy: RefreshPolicy,
    principal_id: Option<String>,
}

impl TokenAcquirer {
    pub fn new(
        backend: Arc<dyn IdentityBackend>,
        store: Arc<TokenStore>,
        events: Arc<TokenEvents>,
        policy: RefreshPolicy,
        principal_id: Option<String>,
    ) -> Self {
        Self {
            backend,
            store,
            events,
            policy,
            principal_id,
        }
    }

    pub fn policy(&self) -> &RefreshPolicy {
        &self.policy
    }

    /// Requests a token up to `max_attempts` times.
    ///
    /// When every attempt fails a `TokenRefreshFailed` event is emitted; the
    /// last error is returned only if `throw_on_failure` is set.
    ///
    /// A token whose username cannot be resolved (no `principal_id` and no
    /// `oid` claim) is a configuration problem, not a backend failure: it is
    /// never installed and no `TokenRefreshFailed` event is emitted. It
    /// surfaces as [`AuthError::MissingUsername`] or, without
    /// `throw_on_failure`, as [`AcquireOutcome::Failed`] plus an error log.
    pub async fn acquire(&self, throw_on_failure: bool) -> Result<AcquireOutcome, AuthError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..max_attempts {
            match self.attempt(attempt).await {
                Ok(token) => return self.install(token, throw_on_failure).await,
                Err(e) => {
                    log::warn!(
                        "Token acquisition attempt {}/{max_attempts} failed: {e}",
                        attempt + 1
                    );
                    if attempt + 1 < max_attempts {
                        let delay = (self.policy.backoff)(attempt, Some(&e));
                        log::debug!("Retrying token acquisition in {delay:?}");
                        last_error = Some(e);
                        sleep(delay).await;
                    } else {
                        last_error = Some(e);
                    }
                }
            }
        }

        let error = last_error.unwrap_or_else(|| {
            IdentityError::Credential("no token acquisition attempt was made".to_string())
        });
        let current_expiry = self.store.snapshot().map(|state| state.expires_at);
        log::error!("Token acquisition failed after {max_attempts} attempts: {error}");

        self.events
            .token_refresh_failed(TokenRefreshFailed {
                error: error.clone(),
                current_expiry,
            })
            .await;

        if throw_on_failure {
            Err(error.into())
        } else {
            Ok(AcquireOutcome::Failed)
        }
    }

    async fn attempt(&self, attempt: u32) -> Result<AccessToken, IdentityError> {
        let timeout = self.policy.attempt_timeouts.for_attempt(attempt);
        let cancel = CancellationToken::new();

        match tokio::time::timeout(timeout, self.backend.get_token(cancel.clone())).await {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                Err(IdentityError::Timeout {
                    seconds: timeout.as_secs(),
                })
            }
        }
    }

    async fn install(
        &self,
        token: AccessToken,
        throw_on_failure: bool,
    ) -> Result<AcquireOutcome, AuthError> {
        if self.store.username().is_none() {
            match self.resolve_username(&token.token) {
                Some(username) => self.store.set_username_if_absent(username),
                None if throw_on_failure => return Err(AuthError::MissingUsername),
                None => {
                    log::error!("{}", AuthError::MissingUsername);
                    return Ok(AcquireOutcome::Failed);
                }
            }
        }

        let acquired_at = Utc::now();
        let expires_on = token.expires_on;
        let state = TokenState::new(token.token, acquired_at, expires_on);

        if !self.store.replace_if_newer(state) {
            log::debug!(
                "Fetched token expiring at {expires_on} is not newer than the current token; keeping it"
            );
            return Ok(AcquireOutcome::Unchanged);
        }

        log::info!("Acquired new token, expires at {expires_on}");
        self.events
            .token_refreshed(TokenRefreshed {
                acquired_at,
                expires_on,
            })
            .await;

        Ok(AcquireOutcome::Refreshed { expires_on })
    }

    fn resolve_username(&self, token: &str) -> Option<String> {
        self.principal_id
            .clone()
            .or_else(|| claims::object_id(token))
    }
}
