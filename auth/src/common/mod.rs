pub mod errors;

pub use errors::{
    AuthError, ConfigurationError, HandlerError, IdentityError, ReauthenticationError,
};

use std::any::Any;

/// Extracts a printable message from a caught panic payload.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
