//! Token state and the acquisition loop that keeps it current.

pub mod acquisition;
pub mod state;

pub use acquisition::{AcquireOutcome, TokenAcquirer};
pub use state::{TokenState, TokenStore};
