//! Credentials as seen by the Redis transport.

use crate::common::{AuthError, ConfigurationError};
use crate::config::AuthOptions;
use crate::connection::CacheConnection;
use crate::engine::TokenAuthEngine;
use crate::identity::CredentialSelection;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use zeroize::Zeroizing;

/// Client library name reported to Redis for managed connections.
pub const LIBRARY_NAME: &str = "azure-redis-auth";

/// Username and password for the Redis `AUTH` / `HELLO` handshake.
#[derive(Clone)]
pub struct Credential {
    pub username: Option<String>,
    pub password: Zeroizing<String>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Connection defaults and credentials consulted by the transport.
///
/// `credential` is called for every new physical connection and must not
/// block. `after_connect` is called once per client after its first
/// successful connect.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    fn credential(&self) -> Option<Credential>;

    async fn after_connect(&self, connection: &Arc<dyn CacheConnection>);

    fn requires_tls(&self) -> bool {
        true
    }

    /// Keep retrying in the background instead of failing the first connect.
    fn abort_on_connect_fail(&self) -> bool {
        false
    }

    fn library_name(&self) -> &'static str {
        LIBRARY_NAME
    }
}

/// Static access key; no token lifecycle.
pub struct AccessKeyProvider {
    username: Option<String>,
    key: Zeroizing<String>,
}

impl AccessKeyProvider {
    pub fn new(key: impl Into<String>, username: Option<String>) -> Self {
        Self {
            username,
            key: Zeroizing::new(key.into()),
        }
    }
}

impl fmt::Debug for AccessKeyProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessKeyProvider")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CredentialProvider for AccessKeyProvider {
    fn credential(&self) -> Option<Credential> {
        Some(Credential {
            username: self.username.clone(),
            password: self.key.clone(),
        })
    }

    async fn after_connect(&self, _connection: &Arc<dyn CacheConnection>) {}
}

#[async_trait]
impl CredentialProvider for TokenAuthEngine {
    fn credential(&self) -> Option<Credential> {
        TokenAuthEngine::credential(self)
    }

    async fn after_connect(&self, connection: &Arc<dyn CacheConnection>) {
        self.on_connection_established(connection).await;
    }
}

/// Builds the credential provider described by `options`.
///
/// For identity based options this performs the initial token acquisition
/// and fails if no token can be obtained.
pub async fn configure(options: &AuthOptions) -> Result<Arc<dyn CredentialProvider>, AuthError> {
    match CredentialSelection::from_options(options)? {
        CredentialSelection::AccessKey => {
            let key = options
                .access_key
                .clone()
                .ok_or(ConfigurationError::Missing {
                    field: "access_key",
                    reason: "no access key supplied".to_string(),
                })?;
            log::info!("Using access key authentication");
            Ok(Arc::new(AccessKeyProvider::new(
                key,
                options.access_key_user.clone(),
            )))
        }
        selection => {
            log::info!("Using Microsoft Entra ID authentication: {selection:?}");
            Ok(Arc::new(TokenAuthEngine::from_options(options).await?))
        }
    }
}
