//! # Azure Redis Auth
//!
//! Keeps long-lived Redis connections authenticated with short-lived
//! Microsoft Entra ID tokens. A token engine acquires tokens from an identity
//! backend, refreshes them on a heartbeat before they expire, and
//! re-authenticates every live connection with the new token without
//! dropping it.
//!
//! ## Modules
//!
//! - [`config`] - Authentication options and the token refresh policy
//! - [`identity`] - Identity backends (managed identity, service principal, custom credential)
//! - [`token`] - Token state and the retrying acquisition loop
//! - [`connection`] - Transport traits and the registry of managed connections
//! - [`reauth`] - Concurrent re-authentication of stale connections
//! - [`events`] - Notification bus for refresh and re-authentication events
//! - [`engine`] - The token engine tying everything together
//! - [`provider`] - Credential providers consumed by the transport
//! - [`common`] - Error types
//!
//! ## Example
//!
//! ```no_run
//! use azure_redis_auth::config::AuthOptions;
//!
//! # async fn example() -> Result<(), azure_redis_auth::common::AuthError> {
//! let options = AuthOptions::system_assigned_managed_identity("principal-object-id");
//! let provider = azure_redis_auth::configure(&options).await?;
//!
//! if let Some(credential) = provider.credential() {
//!     // hand credential.username / credential.password to the Redis client
//! }
//! # Ok(())
//! # }
//! ```

pub mod common;
pub mod config;
pub mod connection;
pub mod engine;
pub mod events;
mod heartbeat;
pub mod identity;
pub mod provider;
pub mod reauth;
pub mod token;

pub use common::AuthError;
pub use config::AuthOptions;
pub use engine::{TokenAuthEngine, TokenAuthEngineBuilder};
pub use provider::{Credential, CredentialProvider, configure};
