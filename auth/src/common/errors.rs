use thiserror::Error;

/// Invalid or ambiguous credential configuration.
///
/// Raised while options are validated, before any token is requested. A
/// configuration error is always fatal: there is no credential that could be
/// handed to the transport.
///
/// # Examples
///
/// ```no_run
/// use azure_redis_auth::common::errors::ConfigurationError;
///
/// fn describe(error: &ConfigurationError) -> &'static str {
///     match error {
///         ConfigurationError::Conflict(_) => "remove one of the credential settings",
///         ConfigurationError::Missing { .. } => "add the missing setting",
///         ConfigurationError::Invalid { .. } => "fix the setting value",
///         ConfigurationError::Load(_) => "check the configuration file",
///     }
/// }
/// ```
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    /// Two mutually exclusive credential settings were supplied together.
    #[error("Conflicting credential configuration: {0}")]
    Conflict(String),

    /// A setting required by the selected credential type is absent.
    #[error("Missing required setting '{field}': {reason}")]
    Missing { field: &'static str, reason: String },

    /// A setting is present but its value cannot be used.
    #[error("Invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },

    /// The configuration file or environment could not be read.
    #[error("Failed to load configuration: {0}")]
    Load(String),
}

/// Failure to obtain a token from the identity backend.
///
/// Identity errors are retried with backoff up to the configured attempt
/// limit. Only the initial acquisition surfaces them to the caller; later
/// refreshes report them through the `TokenRefreshFailed` event.
#[derive(Debug, Clone, Error)]
pub enum IdentityError {
    /// The HTTP request to the identity endpoint could not be completed.
    #[error("Token request failed: {url} - {reason}")]
    RequestFailed { url: String, reason: String },

    /// The attempt did not finish within its deadline.
    #[error("Token request timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// The attempt was cancelled before a response arrived.
    #[error("Token request was cancelled")]
    Cancelled,

    /// The identity service answered with an OAuth error.
    #[error("Identity service rejected the token request ({status}): {code} - {description}")]
    Service {
        status: u16,
        code: String,
        description: String,
    },

    /// The identity service answered with a body that is not a token.
    #[error("Invalid token response: {0}")]
    InvalidResponse(String),

    /// A credential supplied by the application failed.
    #[error("Credential error: {0}")]
    Credential(String),
}

impl From<reqwest::Error> for IdentityError {
    fn from(err: reqwest::Error) -> Self {
        IdentityError::RequestFailed {
            url: err
                .url()
                .map(|url| url.to_string())
                .unwrap_or_else(|| "<unknown>".to_string()),
            reason: err.to_string(),
        }
    }
}

/// Failure to re-authenticate a single server endpoint.
///
/// Reported per endpoint and never retried on the spot (unless immediate
/// retries are configured). The connection stays stale so the next heartbeat
/// picks it up again.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReauthenticationError {
    /// The connection was disposed by the application.
    #[error("Connection has been disposed")]
    Disposed,

    /// The server rejected or failed the AUTH command.
    #[error("AUTH command to '{endpoint}' failed: {reason}")]
    CommandFailed { endpoint: String, reason: String },

    /// The server endpoints of a connection could not be enumerated.
    #[error("Failed to enumerate servers of '{client}': {reason}")]
    ServersUnavailable { client: String, reason: String },

    /// The re-authentication task panicked.
    #[error("Re-authentication of '{0}' panicked")]
    Panicked(String),
}

/// Subscriber misbehaviour. Always logged and discarded, never propagated.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    #[error("Handler for {name} timed out after {millis} ms")]
    TimedOut { name: &'static str, millis: u128 },

    #[error("Handler for {name} failed: {reason}")]
    Failed { name: &'static str, reason: String },
}

/// Errors returned by the fallible public entry points of the crate.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(
        "Unable to determine the Redis username: set principal_id or use a token that carries an 'oid' claim"
    )]
    MissingUsername,

    #[error("A tokio runtime is required: {0}")]
    NoRuntime(String),
}
