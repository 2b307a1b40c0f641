use super::policy::{
    AttemptTimeouts, BackoffFn, RefreshDue, RefreshPolicy, DEFAULT_ATTEMPT_TIMEOUT,
    DEFAULT_ATTEMPT_TIMEOUT_INCREMENT, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_MAX_ATTEMPTS,
};
use crate::common::{ConfigurationError, IdentityError};
use crate::identity::TokenCredential;
use chrono::{DateTime, Utc};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Default OAuth scope for Azure Cache for Redis.
pub const DEFAULT_SCOPE: &str = "https://redis.azure.com/.default";

/// Default Microsoft Entra ID authority host.
pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";

/// Default Azure Instance Metadata Service token endpoint.
pub const DEFAULT_IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

/// Environment variable prefix used by [`AuthOptions::load`].
pub const ENV_PREFIX: &str = "AZURE_REDIS";

/// Client certificate of a service principal, already loaded into memory.
///
/// `private_key_pem` may be omitted when `certificate_pem` contains both the
/// certificate and its RSA private key.
#[derive(Clone, Deserialize)]
pub struct ClientCertificate {
    pub certificate_pem: String,
    pub private_key_pem: Option<String>,
}

impl fmt::Debug for ClientCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCertificate")
            .field("certificate_pem", &"<redacted>")
            .field("private_key_pem", &self.private_key_pem.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Options for authenticating Redis connections.
///
/// Exactly one credential type must be described. The combination of fields
/// decides which one:
///
/// - `access_key` - static access key, no token lifecycle
/// - `token_credential` - application supplied [`TokenCredential`]
/// - `service_principal_tenant_id` + `client_id` + one of
///   `service_principal_secret` / `service_principal_certificate` - service principal
/// - none of the above - managed identity (user-assigned when `client_id` is set)
///
/// # Optional Fields
///
/// - `principal_id` - Redis username; defaults to the token's `oid` claim
/// - `scope` - defaults to `https://redis.azure.com/.default`
/// - `authority_host` - defaults to `https://login.microsoftonline.com`
/// - `imds_endpoint` - defaults to the Azure Instance Metadata Service
/// - `heartbeat_interval_secs` - defaults to 300
/// - `max_token_refresh_attempts` - defaults to 5
/// - `attempt_timeout_secs` / `attempt_timeout_increment_secs` - default to 10 / 5
/// - `refresh_due` - defaults to 75% of the token lifetime
/// - `immediate_reauthentication_retries` - defaults to 0
///
/// # Examples
///
/// ```no_run
/// use azure_redis_auth::config::AuthOptions;
///
/// let options = AuthOptions::service_principal_secret(
///     "client-id",
///     "principal-object-id",
///     "tenant-id",
///     "client-secret",
/// );
/// ```
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthOptions {
    /// Object ID of the identity; used as the Redis username.
    pub principal_id: Option<String>,
    /// Client ID of a user-assigned managed identity or a service principal.
    pub client_id: Option<String>,
    pub service_principal_tenant_id: Option<String>,
    pub service_principal_secret: Option<String>,
    pub service_principal_certificate: Option<ClientCertificate>,
    /// Static access key. Mutually exclusive with every identity setting.
    pub access_key: Option<String>,
    /// Username sent with a static access key (Redis ACL user).
    pub access_key_user: Option<String>,
    pub scope: Option<String>,
    pub authority_host: Option<String>,
    pub imds_endpoint: Option<String>,
    pub heartbeat_interval_secs: Option<u64>,
    pub max_token_refresh_attempts: Option<u32>,
    pub attempt_timeout_secs: Option<u64>,
    pub attempt_timeout_increment_secs: Option<u64>,
    pub refresh_due: Option<RefreshDue>,
    pub immediate_reauthentication_retries: Option<u32>,
    #[serde(skip)]
    pub token_credential: Option<Arc<dyn TokenCredential>>,
    #[serde(skip)]
    pub backoff: Option<BackoffFn>,
}

impl AuthOptions {
    /// Loads options from a configuration file, with `AZURE_REDIS_*`
    /// environment variables overriding file values.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        log::debug!("Loading authentication options from {}", path.display());

        let config = Config::builder()
            .add_source(File::from(path))
            .add_source(Self::environment())
            .build()
            .map_err(|e| ConfigurationError::Load(e.to_string()))?;

        config
            .try_deserialize::<AuthOptions>()
            .map_err(|e| ConfigurationError::Load(format!("Failed to deserialize options: {e}")))
    }

    /// Loads options from `AZURE_REDIS_*` environment variables only.
    pub fn from_env() -> Result<Self, ConfigurationError> {
        Config::builder()
            .add_source(Self::environment())
            .build()
            .and_then(|config| config.try_deserialize::<AuthOptions>())
            .map_err(|e| ConfigurationError::Load(e.to_string()))
    }

    fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    pub fn system_assigned_managed_identity(principal_id: impl Into<String>) -> Self {
        Self {
            principal_id: Some(principal_id.into()),
            ..Self::default()
        }
    }

    pub fn user_assigned_managed_identity(
        client_id: impl Into<String>,
        principal_id: impl Into<String>,
    ) -> Self {
        Self {
            client_id: Some(client_id.into()),
            principal_id: Some(principal_id.into()),
            ..Self::default()
        }
    }

    pub fn service_principal_secret(
        client_id: impl Into<String>,
        principal_id: impl Into<String>,
        tenant_id: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            client_id: Some(client_id.into()),
            principal_id: Some(principal_id.into()),
            service_principal_tenant_id: Some(tenant_id.into()),
            service_principal_secret: Some(secret.into()),
            ..Self::default()
        }
    }

    pub fn service_principal_certificate(
        client_id: impl Into<String>,
        principal_id: impl Into<String>,
        tenant_id: impl Into<String>,
        certificate: ClientCertificate,
    ) -> Self {
        Self {
            client_id: Some(client_id.into()),
            principal_id: Some(principal_id.into()),
            service_principal_tenant_id: Some(tenant_id.into()),
            service_principal_certificate: Some(certificate),
            ..Self::default()
        }
    }

    /// Uses an application supplied credential. Without a `principal_id`
    /// the username is taken from the token's `oid` claim.
    pub fn token_credential(credential: Arc<dyn TokenCredential>) -> Self {
        Self {
            token_credential: Some(credential),
            ..Self::default()
        }
    }

    pub fn access_key(key: impl Into<String>) -> Self {
        Self {
            access_key: Some(key.into()),
            ..Self::default()
        }
    }

    pub fn with_principal_id(mut self, principal_id: impl Into<String>) -> Self {
        self.principal_id = Some(principal_id.into());
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// The interval is stored in whole seconds, like the file setting.
    /// Fractions round up and anything below one second becomes one second.
    /// Use [`RefreshPolicy::with_heartbeat_interval`] for sub-second periods.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        let secs = interval.as_secs() + u64::from(interval.subsec_nanos() > 0);
        self.heartbeat_interval_secs = Some(secs.max(1));
        self
    }

    pub fn with_refresh_due(mut self, refresh_due: RefreshDue) -> Self {
        self.refresh_due = Some(refresh_due);
        self
    }

    pub fn with_refresh_predicate(
        self,
        predicate: impl Fn(DateTime<Utc>, DateTime<Utc>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.with_refresh_due(RefreshDue::Custom(Arc::new(predicate)))
    }

    pub fn with_backoff(
        mut self,
        backoff: impl Fn(u32, Option<&IdentityError>) -> Duration + Send + Sync + 'static,
    ) -> Self {
        self.backoff = Some(Arc::new(backoff));
        self
    }

    pub fn scope(&self) -> &str {
        self.scope.as_deref().unwrap_or(DEFAULT_SCOPE)
    }

    pub fn authority_host(&self) -> &str {
        self.authority_host
            .as_deref()
            .unwrap_or(DEFAULT_AUTHORITY_HOST)
            .trim_end_matches('/')
    }

    pub fn imds_endpoint(&self) -> &str {
        self.imds_endpoint.as_deref().unwrap_or(DEFAULT_IMDS_ENDPOINT)
    }

    /// Builds and validates the refresh policy described by these options.
    pub fn refresh_policy(&self) -> Result<RefreshPolicy, ConfigurationError> {
        let defaults = RefreshPolicy::default();
        let policy = RefreshPolicy {
            max_attempts: self
                .max_token_refresh_attempts
                .unwrap_or(DEFAULT_MAX_ATTEMPTS),
            attempt_timeouts: AttemptTimeouts {
                initial: self
                    .attempt_timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_ATTEMPT_TIMEOUT),
                increment: self
                    .attempt_timeout_increment_secs
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_ATTEMPT_TIMEOUT_INCREMENT),
            },
            backoff: self.backoff.clone().unwrap_or(defaults.backoff),
            refresh_due: self.refresh_due.clone().unwrap_or_default(),
            heartbeat_interval: self
                .heartbeat_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL),
            immediate_reauthentication_retries: self
                .immediate_reauthentication_retries
                .unwrap_or_default(),
        };
        policy.validate()?;
        Ok(policy)
    }
}

fn redact(value: &Option<String>) -> Option<&'static str> {
    value.as_ref().map(|_| "<redacted>")
}

impl fmt::Debug for AuthOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthOptions")
            .field("principal_id", &self.principal_id)
            .field("client_id", &self.client_id)
            .field("service_principal_tenant_id", &self.service_principal_tenant_id)
            .field("service_principal_secret", &redact(&self.service_principal_secret))
            .field("service_principal_certificate", &self.service_principal_certificate)
            .field("access_key", &redact(&self.access_key))
            .field("access_key_user", &self.access_key_user)
            .field("scope", &self.scope)
            .field("authority_host", &self.authority_host)
            .field("imds_endpoint", &self.imds_endpoint)
            .field("heartbeat_interval_secs", &self.heartbeat_interval_secs)
            .field("max_token_refresh_attempts", &self.max_token_refresh_attempts)
            .field("refresh_due", &self.refresh_due)
            .field("token_credential", &self.token_credential.as_ref().map(|_| ".."))
            .finish_non_exhaustive()
    }
}
