//! Identity backends: a uniform way to obtain `(token, expiry)` pairs from
//! Microsoft Entra ID regardless of the credential type.

pub mod claims;
pub mod credential;
pub mod managed_identity;
pub mod service_principal;

pub use credential::{CredentialBackend, TokenCredential};
pub use managed_identity::{ManagedIdentityBackend, ManagedIdentityId};
pub use service_principal::{ClientAuthentication, ServicePrincipalBackend};

use crate::common::{ConfigurationError, IdentityError};
use crate::config::AuthOptions;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

/// An access token together with its absolute expiry.
#[derive(Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_on: DateTime<Utc>,
}

impl AccessToken {
    pub fn new(token: impl Into<String>, expires_on: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_on,
        }
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

/// Kind of credential behind an [`IdentityBackend`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdentityKind {
    SystemAssignedManagedIdentity,
    UserAssignedManagedIdentity,
    ServicePrincipalSecret,
    ServicePrincipalCertificate,
    TokenCredential,
}

/// Source of access tokens.
///
/// Implementations perform a single token request. Retries, timeouts and
/// backoff are applied by the caller; `cancel` is triggered when the caller's
/// per-attempt deadline passes.
///
/// # Examples
///
/// ```no_run
/// use azure_redis_auth::common::IdentityError;
/// use azure_redis_auth::identity::{AccessToken, IdentityBackend, IdentityKind};
/// use async_trait::async_trait;
/// use tokio_util::sync::CancellationToken;
///
/// struct FixedToken;
///
/// #[async_trait]
/// impl IdentityBackend for FixedToken {
///     async fn get_token(&self, _cancel: CancellationToken) -> Result<AccessToken, IdentityError> {
///         Ok(AccessToken::new("token", chrono::Utc::now() + chrono::Duration::hours(1)))
///     }
///
///     fn kind(&self) -> IdentityKind {
///         IdentityKind::TokenCredential
///     }
/// }
/// ```
#[async_trait]
pub trait IdentityBackend: Send + Sync {
    async fn get_token(&self, cancel: CancellationToken) -> Result<AccessToken, IdentityError>;

    fn kind(&self) -> IdentityKind;
}

/// The credential type described by a set of [`AuthOptions`].
#[derive(Debug)]
pub enum CredentialSelection {
    AccessKey,
    TokenCredential,
    ServicePrincipal {
        tenant_id: String,
        client_id: String,
        authentication: ClientAuthentication,
    },
    ManagedIdentity(ManagedIdentityId),
}

impl CredentialSelection {
    /// Decides the credential type from mutually exclusive option fields.
    pub fn from_options(options: &AuthOptions) -> Result<Self, ConfigurationError> {
        let service_principal = options.service_principal_tenant_id.is_some()
            || options.service_principal_secret.is_some()
            || options.service_principal_certificate.is_some();

        if options.access_key.is_some() {
            if service_principal || options.token_credential.is_some() || options.client_id.is_some()
            {
                return Err(ConfigurationError::Conflict(
                    "access_key cannot be combined with identity settings".to_string(),
                ));
            }
            return Ok(CredentialSelection::AccessKey);
        }

        if options.token_credential.is_some() {
            if service_principal {
                return Err(ConfigurationError::Conflict(
                    "token_credential cannot be combined with service principal settings"
                        .to_string(),
                ));
            }
            return Ok(CredentialSelection::TokenCredential);
        }

        if service_principal {
            let client_id = options
                .client_id
                .clone()
                .ok_or_else(|| ConfigurationError::Missing {
                    field: "client_id",
                    reason: "required for service principal authentication".to_string(),
                })?;
            let tenant_id = options.service_principal_tenant_id.clone().ok_or_else(|| {
                ConfigurationError::Missing {
                    field: "service_principal_tenant_id",
                    reason: "required for service principal authentication".to_string(),
                }
            })?;
            let authentication = match (
                &options.service_principal_secret,
                &options.service_principal_certificate,
            ) {
                (Some(secret), None) => ClientAuthentication::Secret(Zeroizing::new(secret.clone())),
                (None, Some(certificate)) => ClientAuthentication::Certificate(certificate.clone()),
                (Some(_), Some(_)) => {
                    return Err(ConfigurationError::Conflict(
                        "service_principal_secret and service_principal_certificate are mutually exclusive"
                            .to_string(),
                    ));
                }
                (None, None) => {
                    return Err(ConfigurationError::Missing {
                        field: "service_principal_secret",
                        reason: "a service principal needs either a secret or a certificate"
                            .to_string(),
                    });
                }
            };
            return Ok(CredentialSelection::ServicePrincipal {
                tenant_id,
                client_id,
                authentication,
            });
        }

        Ok(CredentialSelection::ManagedIdentity(
            ManagedIdentityId::from_client_id(options.client_id.as_deref()),
        ))
    }
}

/// Creates the identity backend described by `options`.
pub fn create_backend(options: &AuthOptions) -> Result<Arc<dyn IdentityBackend>, ConfigurationError> {
    let http_client = reqwest::Client::new();

    match CredentialSelection::from_options(options)? {
        CredentialSelection::AccessKey => Err(ConfigurationError::Invalid {
            field: "access_key",
            reason: "access keys authenticate without an identity backend".to_string(),
        }),
        CredentialSelection::TokenCredential => {
            let credential = options.token_credential.clone().ok_or_else(|| {
                ConfigurationError::Missing {
                    field: "token_credential",
                    reason: "no credential supplied".to_string(),
                }
            })?;
            Ok(Arc::new(CredentialBackend::new(credential, options.scope())))
        }
        CredentialSelection::ServicePrincipal {
            tenant_id,
            client_id,
            authentication,
        } => Ok(Arc::new(ServicePrincipalBackend::new(
            tenant_id,
            client_id,
            authentication,
            options.scope(),
            options.authority_host(),
            http_client,
        )?)),
        CredentialSelection::ManagedIdentity(identity) => Ok(Arc::new(
            ManagedIdentityBackend::new(identity, options.imds_endpoint(), options.scope(), http_client),
        )),
    }
}

/// Races a token request against the caller's cancellation.
pub(crate) async fn with_cancellation<F>(
    cancel: &CancellationToken,
    request: F,
) -> Result<AccessToken, IdentityError>
where
    F: Future<Output = Result<AccessToken, IdentityError>>,
{
    tokio::select! {
        () = cancel.cancelled() => Err(IdentityError::Cancelled),
        result = request => result,
    }
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: String,
    error_description: Option<String>,
}

/// Converts a non-success identity service response into an error,
/// keeping the OAuth `error` / `error_description` when present.
pub(crate) async fn service_error(response: reqwest::Response) -> IdentityError {
    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());

    match serde_json::from_str::<ErrorResponse>(&body) {
        Ok(error) => IdentityError::Service {
            status,
            code: error.error,
            description: error.error_description.unwrap_or_default(),
        },
        Err(_) => IdentityError::Service {
            status,
            code: "unknown_error".to_string(),
            description: body,
        },
    }
}
