use super::{AccessToken, IdentityBackend, IdentityKind, service_error, with_cancellation};
use crate::common::{ConfigurationError, IdentityError};
use crate::config::ClientCertificate;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 600;

/// How a service principal proves its identity to the token endpoint.
#[derive(Clone)]
pub enum ClientAuthentication {
    Secret(Zeroizing<String>),
    Certificate(ClientCertificate),
}

impl fmt::Debug for ClientAuthentication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientAuthentication::Secret(_) => f.write_str("Secret(<redacted>)"),
            ClientAuthentication::Certificate(certificate) => {
                f.debug_tuple("Certificate").field(certificate).finish()
            }
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    aud: &'a str,
    exp: i64,
    iat: i64,
    iss: &'a str,
    jti: String,
    nbf: i64,
    sub: &'a str,
}

/// Signs client assertions with the private key of a client certificate.
struct CertificateSigner {
    key: EncodingKey,
    thumbprint: String,
}

impl CertificateSigner {
    fn new(certificate: &ClientCertificate) -> Result<Self, ConfigurationError> {
        let invalid = |reason: String| ConfigurationError::Invalid {
            field: "service_principal_certificate",
            reason,
        };

        let mut blocks = pem::parse_many(&certificate.certificate_pem)
            .map_err(|e| invalid(format!("Failed to parse certificate PEM: {e}")))?;
        if let Some(key_pem) = &certificate.private_key_pem {
            blocks.extend(
                pem::parse_many(key_pem)
                    .map_err(|e| invalid(format!("Failed to parse private key PEM: {e}")))?,
            );
        }

        let der = blocks
            .iter()
            .find(|block| block.tag() == "CERTIFICATE")
            .ok_or_else(|| invalid("No certificate found in PEM".to_string()))?
            .contents();
        let thumbprint = URL_SAFE_NO_PAD.encode(Sha256::digest(der));

        let key_block = blocks
            .iter()
            .find(|block| matches!(block.tag(), "PRIVATE KEY" | "RSA PRIVATE KEY"))
            .ok_or_else(|| invalid("No RSA private key found in PEM".to_string()))?;
        let key = EncodingKey::from_rsa_pem(pem::encode(key_block).as_bytes())
            .map_err(|e| invalid(format!("Failed to load private key: {e}")))?;

        Ok(Self { key, thumbprint })
    }

    fn assertion(&self, client_id: &str, audience: &str) -> Result<String, IdentityError> {
        let mut header = Header::new(Algorithm::RS256);
        header.x5t_s256 = Some(self.thumbprint.clone());

        let now = Utc::now().timestamp();
        let claims = AssertionClaims {
            aud: audience,
            exp: now + ASSERTION_LIFETIME_SECS,
            iat: now,
            iss: client_id,
            jti: uuid::Uuid::new_v4().to_string(),
            nbf: now,
            sub: client_id,
        };

        jsonwebtoken::encode(&header, &claims, &self.key)
            .map_err(|e| IdentityError::Credential(format!("Failed to sign client assertion: {e}")))
    }
}

enum ClientProof {
    Secret(Zeroizing<String>),
    Certificate(CertificateSigner),
}

/// Client credentials flow against the Microsoft Entra ID v2.0 token endpoint.
pub struct ServicePrincipalBackend {
    client_id: String,
    token_url: String,
    scope: String,
    proof: ClientProof,
    http_client: reqwest::Client,
}

impl ServicePrincipalBackend {
    /// Fails when a certificate is supplied that cannot be used for signing.
    pub fn new(
        tenant_id: String,
        client_id: String,
        authentication: ClientAuthentication,
        scope: &str,
        authority_host: &str,
        http_client: reqwest::Client,
    ) -> Result<Self, ConfigurationError> {
        let proof = match authentication {
            ClientAuthentication::Secret(secret) => ClientProof::Secret(secret),
            ClientAuthentication::Certificate(certificate) => {
                ClientProof::Certificate(CertificateSigner::new(&certificate)?)
            }
        };

        Ok(Self {
            client_id,
            token_url: format!(
                "{}/{}/oauth2/v2.0/token",
                authority_host.trim_end_matches('/'),
                tenant_id
            ),
            scope: scope.to_string(),
            proof,
            http_client,
        })
    }

    async fn request_token(&self) -> Result<AccessToken, IdentityError> {
        let assertion;
        let mut params = vec![
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("scope", self.scope.as_str()),
        ];
        match &self.proof {
            ClientProof::Secret(secret) => params.push(("client_secret", secret.as_str())),
            ClientProof::Certificate(signer) => {
                assertion = Zeroizing::new(signer.assertion(&self.client_id, &self.token_url)?);
                params.push(("client_assertion_type", CLIENT_ASSERTION_TYPE));
                params.push(("client_assertion", assertion.as_str()));
            }
        }

        let response = self
            .http_client
            .post(&self.token_url)
            .form(&params)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(service_error(response).await);
        }

        let token: TokenResponse = response.json().await.map_err(|e| {
            IdentityError::InvalidResponse(format!("Failed to parse token response: {e}"))
        })?;

        let expires_on = i64::try_from(token.expires_in)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
            .ok_or_else(|| {
                IdentityError::InvalidResponse(format!("expires_in out of range: {}", token.expires_in))
            })?;

        Ok(AccessToken::new(token.access_token, expires_on))
    }
}

#[async_trait]
impl IdentityBackend for ServicePrincipalBackend {
    async fn get_token(&self, cancel: CancellationToken) -> Result<AccessToken, IdentityError> {
        with_cancellation(&cancel, self.request_token()).await
    }

    fn kind(&self) -> IdentityKind {
        match self.proof {
            ClientProof::Secret(_) => IdentityKind::ServicePrincipalSecret,
            ClientProof::Certificate(_) => IdentityKind::ServicePrincipalCertificate,
        }
    }
}
