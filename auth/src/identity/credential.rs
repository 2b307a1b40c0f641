use super::{AccessToken, IdentityBackend, IdentityKind, with_cancellation};
use crate::common::IdentityError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Application supplied source of Entra ID tokens.
///
/// Implement this to plug in any credential chain the application already
/// uses (developer tooling, workload identity, a cached token broker, ...).
#[async_trait]
pub trait TokenCredential: Send + Sync {
    async fn get_token(
        &self,
        scopes: &[&str],
        cancel: CancellationToken,
    ) -> Result<AccessToken, IdentityError>;
}

/// Adapts a [`TokenCredential`] to the [`IdentityBackend`] interface for a
/// single fixed scope.
pub struct CredentialBackend {
    credential: Arc<dyn TokenCredential>,
    scope: String,
}

impl CredentialBackend {
    pub fn new(credential: Arc<dyn TokenCredential>, scope: &str) -> Self {
        Self {
            credential,
            scope: scope.to_string(),
        }
    }
}

#[async_trait]
impl IdentityBackend for CredentialBackend {
    async fn get_token(&self, cancel: CancellationToken) -> Result<AccessToken, IdentityError> {
        let scopes = [self.scope.as_str()];
        with_cancellation(&cancel, self.credential.get_token(&scopes, cancel.clone())).await
    }

    fn kind(&self) -> IdentityKind {
        IdentityKind::TokenCredential
    }
}
