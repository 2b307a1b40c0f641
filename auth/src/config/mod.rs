//! Configuration of credentials and of the token refresh policy.

pub mod options;
pub mod policy;

pub use options::{AuthOptions, ClientCertificate};
pub use policy::{AttemptTimeouts, BackoffFn, RefreshDue, RefreshPolicy, exponential_backoff};
