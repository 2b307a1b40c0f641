use crate::common::{ConfigurationError, IdentityError};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default heartbeat period: check the token and retry outstanding
/// re-authentications every 5 minutes.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(300);

/// Attempt to acquire a fresh token 5 times before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// First attempt fails fast; later attempts get more time.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_ATTEMPT_TIMEOUT_INCREMENT: Duration = Duration::from_secs(5);

/// Refresh once three quarters of the token lifetime has elapsed.
pub const DEFAULT_LIFETIME_FRACTION: f64 = 0.75;

const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);
const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Delay before the next acquisition attempt, given the zero-based index of
/// the attempt that just failed and its error.
pub type BackoffFn = Arc<dyn Fn(u32, Option<&IdentityError>) -> Duration + Send + Sync>;

/// Custom refresh-due predicate over `(acquired_at, expires_at)`.
pub type RefreshPredicate = Arc<dyn Fn(DateTime<Utc>, DateTime<Utc>) -> bool + Send + Sync>;

/// Decides when the heartbeat should fetch a new token.
///
/// Both historical policies are available; pick one explicitly in
/// configuration.
///
/// ```toml
/// [refresh_due]
/// kind = "expiration_margin"
/// margin_secs = 14400
/// ```
#[derive(Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RefreshDue {
    /// Refresh when the token is within `margin_secs` of its expiry.
    ExpirationMargin { margin_secs: u64 },
    /// Refresh when `fraction` of the token lifetime has elapsed.
    LifetimeElapsed { fraction: f64 },
    /// Application supplied predicate.
    #[serde(skip)]
    Custom(RefreshPredicate),
}

impl RefreshDue {
    /// Evaluates the policy against the current wall clock.
    pub fn should_refresh(&self, acquired_at: DateTime<Utc>, expires_at: DateTime<Utc>) -> bool {
        self.should_refresh_at(acquired_at, expires_at, Utc::now())
    }

    pub fn should_refresh_at(
        &self,
        acquired_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        match self {
            RefreshDue::ExpirationMargin { margin_secs } => {
                let margin = i64::try_from(*margin_secs)
                    .ok()
                    .and_then(chrono::Duration::try_seconds);
                match margin.and_then(|margin| expires_at.checked_sub_signed(margin)) {
                    Some(due) => now >= due,
                    None => true,
                }
            }
            RefreshDue::LifetimeElapsed { fraction } => {
                let lifetime_ms = (expires_at - acquired_at).num_milliseconds();
                let elapsed_ms = (lifetime_ms as f64 * fraction) as i64;
                now >= acquired_at + chrono::Duration::milliseconds(elapsed_ms)
            }
            RefreshDue::Custom(predicate) => predicate(acquired_at, expires_at),
        }
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        if let RefreshDue::LifetimeElapsed { fraction } = self {
            if !(*fraction > 0.0 && *fraction <= 1.0) {
                return Err(ConfigurationError::Invalid {
                    field: "refresh_due.fraction",
                    reason: format!("must be in (0, 1], got {fraction}"),
                });
            }
        }
        Ok(())
    }
}

impl Default for RefreshDue {
    fn default() -> Self {
        RefreshDue::LifetimeElapsed {
            fraction: DEFAULT_LIFETIME_FRACTION,
        }
    }
}

impl fmt::Debug for RefreshDue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshDue::ExpirationMargin { margin_secs } => f
                .debug_struct("ExpirationMargin")
                .field("margin_secs", margin_secs)
                .finish(),
            RefreshDue::LifetimeElapsed { fraction } => f
                .debug_struct("LifetimeElapsed")
                .field("fraction", fraction)
                .finish(),
            RefreshDue::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Per-attempt deadline schedule: `initial + increment * attempt_index`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttemptTimeouts {
    pub initial: Duration,
    pub increment: Duration,
}

impl AttemptTimeouts {
    pub fn for_attempt(&self, attempt: u32) -> Duration {
        self.initial.saturating_add(self.increment.saturating_mul(attempt))
    }
}

impl Default for AttemptTimeouts {
    fn default() -> Self {
        Self {
            initial: DEFAULT_ATTEMPT_TIMEOUT,
            increment: DEFAULT_ATTEMPT_TIMEOUT_INCREMENT,
        }
    }
}

/// Exponential backoff: `base * 2^attempt`, capped at `cap`.
pub fn exponential_backoff(base: Duration, cap: Duration) -> BackoffFn {
    Arc::new(move |attempt: u32, _: Option<&IdentityError>| {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        base.saturating_mul(factor).min(cap)
    })
}

/// Immutable refresh policy handed to the engine at construction.
#[derive(Clone)]
pub struct RefreshPolicy {
    pub max_attempts: u32,
    pub attempt_timeouts: AttemptTimeouts,
    pub backoff: BackoffFn,
    pub refresh_due: RefreshDue,
    pub heartbeat_interval: Duration,
    /// Extra same-pass AUTH retries per endpoint. Zero means failed
    /// endpoints are retried only on the next heartbeat.
    pub immediate_reauthentication_retries: u32,
}

impl RefreshPolicy {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_attempts == 0 {
            return Err(ConfigurationError::Invalid {
                field: "max_token_refresh_attempts",
                reason: "at least one attempt is required".to_string(),
            });
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigurationError::Invalid {
                field: "heartbeat_interval_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.attempt_timeouts.initial.is_zero() {
            return Err(ConfigurationError::Invalid {
                field: "attempt_timeout_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        self.refresh_due.validate()
    }

    pub fn with_backoff(
        mut self,
        backoff: impl Fn(u32, Option<&IdentityError>) -> Duration + Send + Sync + 'static,
    ) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    pub fn with_refresh_due(mut self, refresh_due: RefreshDue) -> Self {
        self.refresh_due = refresh_due;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            attempt_timeouts: AttemptTimeouts::default(),
            backoff: exponential_backoff(DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CAP),
            refresh_due: RefreshDue::default(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            immediate_reauthentication_retries: 0,
        }
    }
}

impl fmt::Debug for RefreshPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("attempt_timeouts", &self.attempt_timeouts)
            .field("refresh_due", &self.refresh_due)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field(
                "immediate_reauthentication_retries",
                &self.immediate_reauthentication_retries,
            )
            .finish_non_exhaustive()
    }
}
