use super::{AccessToken, IdentityBackend, IdentityKind, service_error, with_cancellation};
use crate::common::IdentityError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const IMDS_API_VERSION: &str = "2018-02-01";

/// Which managed identity to request a token for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ManagedIdentityId {
    SystemAssigned,
    /// User-assigned identity addressed by its client ID.
    ClientId(String),
    /// User-assigned identity addressed by its ARM resource ID.
    ResourceId(String),
}

impl ManagedIdentityId {
    /// A GUID is treated as a client ID, anything else as a resource ID.
    pub fn from_client_id(id: Option<&str>) -> Self {
        match id {
            None => ManagedIdentityId::SystemAssigned,
            Some(id) if Uuid::parse_str(id).is_ok() => ManagedIdentityId::ClientId(id.to_string()),
            Some(id) => ManagedIdentityId::ResourceId(id.to_string()),
        }
    }
}

#[derive(Deserialize)]
struct ImdsTokenResponse {
    access_token: String,
    expires_on: UnixSeconds,
}

/// IMDS returns `expires_on` as a string, some hosting environments as a number.
#[derive(Deserialize)]
#[serde(untagged)]
enum UnixSeconds {
    Number(i64),
    Text(String),
}

impl UnixSeconds {
    fn to_datetime(&self) -> Result<DateTime<Utc>, IdentityError> {
        let seconds = match self {
            UnixSeconds::Number(seconds) => *seconds,
            UnixSeconds::Text(text) => text.trim().parse::<i64>().map_err(|e| {
                IdentityError::InvalidResponse(format!("Invalid expires_on value '{text}': {e}"))
            })?,
        };
        DateTime::from_timestamp(seconds, 0).ok_or_else(|| {
            IdentityError::InvalidResponse(format!("expires_on out of range: {seconds}"))
        })
    }
}

/// Managed identity tokens from the Azure Instance Metadata Service.
pub struct ManagedIdentityBackend {
    identity: ManagedIdentityId,
    endpoint: String,
    resource: String,
    http_client: reqwest::Client,
}

impl ManagedIdentityBackend {
    pub fn new(
        identity: ManagedIdentityId,
        endpoint: &str,
        scope: &str,
        http_client: reqwest::Client,
    ) -> Self {
        Self {
            identity,
            endpoint: endpoint.to_string(),
            // IMDS takes a resource, not a scope
            resource: scope.trim_end_matches("/.default").to_string(),
            http_client,
        }
    }

    pub fn identity(&self) -> &ManagedIdentityId {
        &self.identity
    }

    async fn request_token(&self) -> Result<AccessToken, IdentityError> {
        let mut query = vec![
            ("api-version", IMDS_API_VERSION),
            ("resource", self.resource.as_str()),
        ];
        match &self.identity {
            ManagedIdentityId::SystemAssigned => {}
            ManagedIdentityId::ClientId(id) => query.push(("client_id", id.as_str())),
            ManagedIdentityId::ResourceId(id) => query.push(("msi_res_id", id.as_str())),
        }

        let response = self
            .http_client
            .get(&self.endpoint)
            .header("Metadata", "true")
            .query(&query)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(service_error(response).await);
        }

        let token: ImdsTokenResponse = response.json().await.map_err(|e| {
            IdentityError::InvalidResponse(format!("Failed to parse IMDS token response: {e}"))
        })?;

        Ok(AccessToken::new(
            token.access_token,
            token.expires_on.to_datetime()?,
        ))
    }
}

#[async_trait]
impl IdentityBackend for ManagedIdentityBackend {
    async fn get_token(&self, cancel: CancellationToken) -> Result<AccessToken, IdentityError> {
        with_cancellation(&cancel, self.request_token()).await
    }

    fn kind(&self) -> IdentityKind {
        match self.identity {
            ManagedIdentityId::SystemAssigned => IdentityKind::SystemAssignedManagedIdentity,
            _ => IdentityKind::UserAssignedManagedIdentity,
        }
    }
}
