use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use zeroize::Zeroizing;

/// The active token together with its acquisition time and expiry.
pub struct TokenState {
    value: Zeroizing<String>,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TokenState {
    pub fn new(value: String, acquired_at: DateTime<Utc>, expires_at: DateTime<Utc>) -> Self {
        Self {
            value: Zeroizing::new(value),
            acquired_at,
            expires_at,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Lifetime as issued; non-positive lifetimes are always refreshed.
    pub fn lifetime(&self) -> chrono::Duration {
        self.expires_at - self.acquired_at
    }
}

impl fmt::Debug for TokenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenState")
            .field("value", &"<redacted>")
            .field("acquired_at", &self.acquired_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Single source of truth for the current token and Redis username.
///
/// Reads are synchronous so the transport's credential callback never has to
/// await. Writers hold the lock only for a pointer swap.
#[derive(Debug, Default)]
pub struct TokenStore {
    current: RwLock<Option<Arc<TokenState>>>,
    username: RwLock<Option<String>>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Option<Arc<TokenState>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Expiry of the current token, or `MIN_UTC` before the first acquisition.
    pub fn current_expiry(&self) -> DateTime<Utc> {
        self.snapshot()
            .map(|state| state.expires_at)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Installs `state` only if it expires strictly later than the current
    /// token. Returns whether the state changed.
    pub fn replace_if_newer(&self, state: TokenState) -> bool {
        let mut current = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let newer = current
            .as_ref()
            .is_none_or(|existing| state.expires_at > existing.expires_at);
        if newer {
            *current = Some(Arc::new(state));
        }
        newer
    }

    pub fn username(&self) -> Option<String> {
        self.username
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The username is fixed by the first caller; later values are ignored.
    pub fn set_username_if_absent(&self, username: String) {
        let mut current = self
            .username
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if current.is_none() {
            *current = Some(username);
        }
    }
}
